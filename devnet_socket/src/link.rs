//! Seam to the connectivity layer
//!
//! A [`Link`] is the direct peer connection being negotiated: it produces and
//! consumes session descriptions and candidates. It reports asynchronous
//! progress (connectivity, local candidates, remote tracks, control data)
//! as [`LinkEvent`]s through a [`LinkNotifier`], which the session resolves
//! back to the owning peer by name and generation.

use crate::error::{MediaError, NegotiationError};
use crate::media::{Direction, MediaStream, StreamKind};
use async_trait::async_trait;
use devnet_protocol::{Candidate, IceServer, SessionDescription};
use tokio::sync::mpsc;
use tracing::trace;

/// The connectivity layer's side of one peer
#[async_trait]
pub trait Link: Send {
    /// Create a local offer and apply it
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a remote offer and return the local answer
    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription, NegotiationError>;

    /// Apply the remote answer to a pending local offer
    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError>;

    async fn add_candidate(&mut self, candidate: Candidate) -> Result<(), NegotiationError>;

    /// Discard a pending local offer
    async fn rollback(&mut self) -> Result<(), NegotiationError>;

    /// Servers to use for future connectivity checks
    fn configure(&mut self, ice_servers: &[IceServer]);

    /// Send on the control channel of an established link
    fn send_control(&mut self, data: &str) -> Result<(), NegotiationError>;

    async fn close(&mut self);
}

/// Progress reported by a [`Link`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connectivity established
    Connected,
    /// Connectivity lost
    Disconnected,
    /// The link gave up
    Failed(String),
    /// A local candidate to send to the remote side
    LocalCandidate(Candidate),
    /// Data received on the control channel
    Control(String),
    /// The remote side started sending a stream
    TrackStarted(StreamKind),
    /// The remote side stopped sending a stream
    TrackEnded(StreamKind),
}

/// Non-owning reference from a link back to its peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub remote: String,
    /// Distinguishes a replaced peer from its successor
    pub generation: u64,
}

/// Where a [`Link`] delivers its events
#[derive(Debug, Clone)]
pub struct LinkNotifier {
    handle: PeerHandle,
    events: mpsc::UnboundedSender<(PeerHandle, LinkEvent)>,
}

impl LinkNotifier {
    pub(crate) fn new(handle: PeerHandle, events: mpsc::UnboundedSender<(PeerHandle, LinkEvent)>) -> Self {
        Self { handle, events }
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Report an event; returns false once the session has stopped
    pub fn notify(&self, event: LinkEvent) -> bool {
        trace!(remote = %self.handle.remote, generation = self.handle.generation, ?event, "link event");
        self.events.send((self.handle.clone(), event)).is_ok()
    }
}

/// Creates links and media bindings for a session
pub trait Backend: Send {
    fn create_link(
        &mut self,
        remote: &str,
        ice_servers: &[IceServer],
        notifier: LinkNotifier,
    ) -> Result<Box<dyn Link>, NegotiationError>;

    fn create_stream(
        &mut self,
        remote: &str,
        kind: StreamKind,
        direction: Direction,
    ) -> Result<Box<dyn MediaStream>, MediaError>;
}
