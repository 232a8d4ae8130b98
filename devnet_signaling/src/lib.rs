//! WebSocket signaling server for devnet peers
//!
//! Clients authenticate once with a basic authorization header on the
//! WebSocket upgrade. Afterwards the server only routes envelopes between
//! connected names; it never inspects the negotiation itself.
//!
//! # Protocol
//!
//! - **GET /ws** - Authenticated WebSocket upgrade (path configurable; `wss`
//!   when `tls` is set in the config)
//! - **GET /status** - JSON array of connected names
//! - **GET /health** - Health check
//!
//! Every frame on the WebSocket is one JSON envelope:
//!
//! ```json
//! {"src":"alice","dst":"bob","sdp":{"kind":"offer","sdp":"v=0..."}}
//! ```
//!
//! Right after the upgrade the server pushes a server-directed `config`
//! envelope (`src` and `dst` empty) listing the ICE servers to use. The
//! server overwrites `src` with the authenticated name on every envelope it
//! receives, and silently discards envelopes whose `dst` is not connected.
//!
//! A second connection with the same name replaces the first one, and a
//! client that stops draining its mailbox is disconnected.
//!
//! # Example
//!
//! ```bash
//! # Digest for a [[users]] entry
//! devnet-signald hash alice wonderland
//!
//! # Start the server
//! devnet-signald --config signald.toml
//! ```

#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod relay;
pub mod server;
pub mod switch;
pub mod tls;

pub use auth::{Credentials, StaticCredentials, User, hash_secret};
pub use config::ServerConfig;
pub use error::{AuthError, ConfigError, SignalingError};
pub use relay::IceServerProvider;
pub use server::SignalingServer;
pub use switch::{Switch, SwitchHandle};
