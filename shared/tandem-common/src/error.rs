//! Protocol Errors

use thiserror::Error;

/// Errors raised while decoding signaling payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unknown session state name.
    #[error("Unknown session state: {0}")]
    UnknownState(String),

    /// Unknown signaling command keyword.
    #[error("Unknown signaling command: {0}")]
    UnknownCommand(String),

    /// ICE candidate payload did not have the `mid$index$candidate` shape.
    #[error("Malformed ICE candidate payload: {0}")]
    MalformedCandidate(String),

    /// Unknown session description type.
    #[error("Unknown session description type: {0}")]
    UnknownSdpKind(String),
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
