//! `Tandem` Common Library
//!
//! Signaling protocol and session description types shared by call endpoints
//! and relays.

pub mod error;
pub mod protocol;
pub mod sdp;

pub use error::{ProtocolError, Result};
pub use protocol::{IceCandidate, SessionState, SignalingCommand, SignalingFrame};
pub use sdp::{normalize_codecs, SdpKind, SessionDescription};
