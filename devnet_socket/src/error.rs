//! Error types for the signaling client

use crate::media::StreamKind;
use crate::peer::PeerState;
use devnet_protocol::SdpKind;
use thiserror::Error;

/// Errors from the signaling transport
#[derive(Error, Debug)]
pub enum SignalError {
    /// The outgoing queue is full; the envelope was not queued
    #[error("outgoing queue is full")]
    QueueFull,

    /// The signal has been closed
    #[error("signal is closed")]
    Closed,

    /// Dial timed out before the upgrade completed
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Credentials cannot be carried in a header
    #[error("credentials contain characters not allowed in a header")]
    InvalidCredentials,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A timing setting that would stall or spin the connection task
    #[error("invalid signal config: {0}")]
    InvalidConfig(&'static str),
}

/// Errors from negotiating with one remote peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The connectivity layer refused an operation
    #[error("link error: {0}")]
    Link(String),

    /// A description arrived that the current state cannot take
    #[error("unexpected {kind} in state {state}")]
    UnexpectedDescription { kind: SdpKind, state: PeerState },

    /// An offer cannot be created in this state
    #[error("negotiation already in progress ({0})")]
    InProgress(PeerState),

    /// The peer is not connected yet
    #[error("peer is not connected")]
    NotConnected,

    /// The peer has been closed
    #[error("peer is closed")]
    Closed,
}

/// Errors from media bindings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// No binding of this kind exists
    #[error("no {0} stream")]
    NoStream(StreamKind),

    /// The capture or playback device failed
    #[error("device error: {0}")]
    Device(String),
}

/// Errors returned by [`SessionHandle`](crate::SessionHandle) operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// Connecting to one's own name
    #[error("cannot connect to self")]
    SelfConnect,

    /// Empty remote name
    #[error("remote name is empty")]
    InvalidName,

    /// No negotiation exists with this remote
    #[error("unknown peer '{0}'")]
    UnknownPeer(String),

    /// Negotiation failed
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Media binding failed
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    /// The session loop is no longer running
    #[error("session is closed")]
    Closed,
}
