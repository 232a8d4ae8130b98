//! Wire protocol for devnet signaling
//!
//! The signaling server only ever routes [`Envelope`]s between named
//! participants. Media never passes through it.
//!
//! # Payloads
//!
//! - `config` - relay and reachability servers, pushed by the server once per
//!   connection right after authentication
//! - `candidate` - an opaque reachability candidate for a negotiation round
//! - `sdp` - an offer or an answer
//! - `control` - application data exchanged once a peer link exists

#![forbid(unsafe_code)]

pub mod basic_auth;
pub mod envelope;
pub mod error;

pub use envelope::{
    Candidate, Config, Control, Envelope, IceServer, Payload, SdpKind, SessionDescription,
};
pub use error::ProtocolError;
