//! Media bindings attached to a peer
//!
//! Capture and playback live outside this crate. A peer only drives the
//! bindings through [`MediaStream`]: outbound bindings start once the peer
//! is connected, inbound bindings start when the remote track appears, and
//! every binding stops when the peer closes.

use crate::error::MediaError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
    Screen,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Audio => f.write_str("audio"),
            StreamKind::Video => f.write_str("video"),
            StreamKind::Screen => f.write_str("screen"),
        }
    }
}

/// Whether a binding sends local media or plays remote media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Opaque handle of the surface or device an inbound stream renders to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget(pub String);

/// One encoded media sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub data: Vec<u8>,
    pub duration: Duration,
}

/// Callback receiving samples from a binding
pub type SampleHandler = Arc<dyn Fn(&Sample) + Send + Sync>;

/// A capture or playback binding driven by a peer
pub trait MediaStream: Send {
    fn kind(&self) -> StreamKind;

    fn direction(&self) -> Direction;

    fn start(&mut self) -> Result<(), MediaError>;

    fn stop(&mut self) -> Result<(), MediaError>;

    /// Where an inbound stream should render
    fn set_output_target(&mut self, target: OutputTarget) -> Result<(), MediaError>;

    /// Observe samples flowing through the binding
    fn on_sample(&mut self, handler: SampleHandler);
}
