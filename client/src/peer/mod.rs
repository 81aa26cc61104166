//! Peer Connections
//!
//! Negotiation of a single call leg: session descriptions, ICE candidates and
//! connection statistics, on top of the `webrtc` engine.

pub(crate) mod connection;
mod engine;
mod factory;

use std::fmt;
use std::sync::Arc;

use tandem_common::IceCandidate;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_remote::TrackRemote;

pub use connection::{ConnectionStats, IceCandidateOutcome, NegotiationState, PeerConnection};
pub use engine::{RtcConnection, WebRtcConnection};
pub use factory::{
    AudioConstraints, AudioSource, FactoryConfig, IceServerConfig, PeerConnectionFactory,
    VideoCodec, VideoCodecConfig, VideoSource, LOCAL_STREAM_ID,
};

/// Default interval between statistics reports.
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 10;

/// Errors returned by negotiation operations.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Peer connection error: {0}")]
    PeerConnection(String),
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("ICE error: {0}")]
    Ice(String),
    #[error("Track error: {0}")]
    Track(String),
    #[error("Peer connection not initialized")]
    NotInitialized,
    #[error("Peer connection already initialized")]
    AlreadyInitialized,
    #[error("Peer connection closed")]
    Closed,
}

/// Errors raised while building the connection factory.
///
/// These mean the media engine itself is misconfigured; no call can be set up.
#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("Media engine initialization failed: {0}")]
    EngineInit(String),
}

/// Role of a call leg, used to tag logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerType {
    Publisher,
    Subscriber,
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => f.write_str("publisher"),
            Self::Subscriber => f.write_str("subscriber"),
        }
    }
}

/// Offer/answer options for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub voice_activity_detection: bool,
    pub ice_restart: bool,
}

impl MediaConstraints {
    /// Receive both audio and video from the remote side.
    #[must_use]
    pub const fn audio_video() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
            voice_activity_detection: false,
            ice_restart: false,
        }
    }
}

/// ICE connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Closed, failed and disconnected connections carry no media.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed | Self::Disconnected)
    }
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => Self::New,
            RTCIceConnectionState::Checking => Self::Checking,
            RTCIceConnectionState::Connected => Self::Connected,
            RTCIceConnectionState::Completed => Self::Completed,
            RTCIceConnectionState::Disconnected => Self::Disconnected,
            RTCIceConnectionState::Failed => Self::Failed,
            RTCIceConnectionState::Closed => Self::Closed,
        }
    }
}

/// Aggregate peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// Everything the engine reports about a connection.
#[derive(Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be sent to the peer.
    IceCandidate(IceCandidate),
    /// First track of a remote stream arrived.
    StreamAdded(String),
    /// A remote track arrived.
    Track(Arc<TrackRemote>),
    /// Local tracks changed and a new offer is needed.
    RenegotiationNeeded,
    IceConnectionStateChanged(IceConnectionState),
    ConnectionStateChanged(PeerConnectionState),
    SignalingStateChanged(RTCSignalingState),
    IceGatheringStateChanged(RTCIceGathererState),
    DataChannel(Arc<RTCDataChannel>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            Self::StreamAdded(stream_id) => f.debug_tuple("StreamAdded").field(stream_id).finish(),
            Self::Track(track) => f
                .debug_struct("Track")
                .field("id", &track.id())
                .field("kind", &track.kind())
                .finish(),
            Self::RenegotiationNeeded => f.write_str("RenegotiationNeeded"),
            Self::IceConnectionStateChanged(state) => f
                .debug_tuple("IceConnectionStateChanged")
                .field(state)
                .finish(),
            Self::ConnectionStateChanged(state) => f
                .debug_tuple("ConnectionStateChanged")
                .field(state)
                .finish(),
            Self::SignalingStateChanged(state) => f
                .debug_tuple("SignalingStateChanged")
                .field(state)
                .finish(),
            Self::IceGatheringStateChanged(state) => f
                .debug_tuple("IceGatheringStateChanged")
                .field(state)
                .finish(),
            Self::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
        }
    }
}

/// Events forwarded from a peer connection to its owner.
pub type PeerEventSender = mpsc::UnboundedSender<(PeerType, PeerEvent)>;

/// Receiving half of [`PeerEventSender`].
pub type PeerEventReceiver = mpsc::UnboundedReceiver<(PeerType, PeerEvent)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_ice_states() {
        assert!(IceConnectionState::Closed.is_terminal());
        assert!(IceConnectionState::Failed.is_terminal());
        assert!(IceConnectionState::Disconnected.is_terminal());
        assert!(!IceConnectionState::Connected.is_terminal());
        assert!(!IceConnectionState::Checking.is_terminal());
    }

    #[test]
    fn maps_engine_states() {
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Unspecified),
            IceConnectionState::New
        );
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Completed),
            IceConnectionState::Completed
        );
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Failed),
            PeerConnectionState::Failed
        );
    }

    #[test]
    fn peer_type_display() {
        assert_eq!(PeerType::Publisher.to_string(), "publisher");
        assert_eq!(PeerType::Subscriber.to_string(), "subscriber");
    }
}
