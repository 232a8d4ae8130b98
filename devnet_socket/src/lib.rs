//! Client side of devnet signaling
//!
//! - [`Signal`] keeps an authenticated WebSocket to the signaling server
//!   open, reconnecting underneath a stable send/receive interface.
//! - [`Session`] owns one [`Peer`] negotiation per remote name and turns
//!   everything that happens into [`SessionEvent`]s.
//! - [`Link`] and [`MediaStream`] are the seams to the connectivity and
//!   media layers, created per peer by a [`Backend`].
//!
//! # Example
//!
//! ```no_run
//! use devnet_socket::{Session, Signal, SignalConfig};
//! use devnet_socket::testing::MockBackend;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signal = Signal::dial(SignalConfig::new("ws://127.0.0.1:8080/ws", "alice", "secret"))?;
//! let (session, handle, mut events) = Session::new("alice", signal, MockBackend::new());
//! tokio::spawn(session.run());
//!
//! handle.connect("bob").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod events;
pub mod link;
pub mod media;
pub mod peer;
pub mod session;
pub mod signal;
pub mod testing;

pub use error::{MediaError, NegotiationError, SessionError, SignalError};
pub use events::{EventKind, SessionEvent, Subscribers};
pub use link::{Backend, Link, LinkEvent, LinkNotifier, PeerHandle};
pub use media::{Direction, MediaStream, OutputTarget, Sample, SampleHandler, StreamKind};
pub use peer::{Peer, PeerState};
pub use session::{Session, SessionHandle};
pub use signal::{Signal, SignalConfig, SignalState, Signaler, StateHandler};
