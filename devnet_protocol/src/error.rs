//! Error types for the wire protocol

use thiserror::Error;

/// Errors that can occur while decoding or encoding an envelope
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not match the envelope shape
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// None of the payload variants is set
    #[error("envelope has no payload")]
    MissingPayload,

    /// More than one payload variant is set
    #[error("envelope carries {0} payloads, expected exactly one")]
    AmbiguousPayload(usize),
}
