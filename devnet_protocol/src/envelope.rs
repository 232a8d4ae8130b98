//! The routed message unit and its payload variants
//!
//! Envelopes travel as JSON, one per WebSocket frame. The payload is a oneof:
//! exactly one of the `config`, `candidate`, `sdp` or `control` keys sits next
//! to `src` and `dst`.
//!
//! ```json
//! {"src":"alice","dst":"bob","sdp":{"kind":"offer","sdp":"v=0..."}}
//! ```

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A message routed from `src` to `dst` by the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    /// Sender name; stamped by the server with the authenticated name
    pub src: String,
    /// Recipient name; empty when the envelope is server-directed
    pub dst: String,
    #[serde(flatten)]
    pub payload: Payload,
}

/// The single payload variant carried by an [`Envelope`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Session parameters pushed by the server after authentication
    #[serde(rename = "config")]
    Config(Config),
    /// Reachability candidate for an ongoing negotiation
    #[serde(rename = "candidate")]
    Candidate(Candidate),
    /// Offer or answer
    #[serde(rename = "sdp")]
    SessionDescription(SessionDescription),
    /// Application data exchanged between connected peers
    #[serde(rename = "control")]
    Control(Control),
}

impl Payload {
    /// Short name of the variant, as used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Config(_) => "config",
            Payload::Candidate(_) => "candidate",
            Payload::SessionDescription(_) => "sdp",
            Payload::Control(_) => "control",
        }
    }
}

/// Server-pushed session parameters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// A STUN or TURN server the connectivity layer may use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A server reachable without credentials (usually STUN)
    pub fn open(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Opaque reachability candidate plus the identifiers that bind it to a
/// negotiation round
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: String,
    #[serde(default)]
    pub sdp_mline_index: u32,
    #[serde(default)]
    pub username_fragment: String,
}

/// Which half of the exchange a [`SessionDescription`] is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// An offer or answer with its opaque description blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Free-form application data
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub data: String,
}

impl Control {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl From<Config> for Payload {
    fn from(config: Config) -> Self {
        Payload::Config(config)
    }
}

impl From<Candidate> for Payload {
    fn from(candidate: Candidate) -> Self {
        Payload::Candidate(candidate)
    }
}

impl From<SessionDescription> for Payload {
    fn from(sdp: SessionDescription) -> Self {
        Payload::SessionDescription(sdp)
    }
}

impl From<Control> for Payload {
    fn from(control: Control) -> Self {
        Payload::Control(control)
    }
}

/// Decoding shape: every variant optional, so that a missing or duplicated
/// payload can be reported instead of silently picking one
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    #[serde(default)]
    src: String,
    #[serde(default)]
    dst: String,
    config: Option<Config>,
    candidate: Option<Candidate>,
    sdp: Option<SessionDescription>,
    control: Option<Control>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let mut payloads = [
            wire.config.map(Payload::Config),
            wire.candidate.map(Payload::Candidate),
            wire.sdp.map(Payload::SessionDescription),
            wire.control.map(Payload::Control),
        ]
        .into_iter()
        .flatten();

        let payload = payloads.next().ok_or(ProtocolError::MissingPayload)?;
        let extra = payloads.count();
        if extra > 0 {
            return Err(ProtocolError::AmbiguousPayload(extra + 1));
        }

        Ok(Envelope {
            src: wire.src,
            dst: wire.dst,
            payload,
        })
    }
}

impl Envelope {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            payload: payload.into(),
        }
    }

    /// True when the envelope is addressed to the server rather than a peer
    pub fn is_server_directed(&self) -> bool {
        self.dst.is_empty()
    }

    /// Decode an envelope from a binary frame holding UTF-8 JSON
    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_slice(data)?;
        Envelope::try_from(wire)
    }

    /// Encode the envelope as a JSON string
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl FromStr for Envelope {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wire: WireEnvelope = serde_json::from_str(s)?;
        Envelope::try_from(wire)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = self.to_json().map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
