//! Connection Factory
//!
//! Shared media engine configuration and the builders for connections,
//! sources and local tracks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::connection::PeerConnection;
use super::engine::WebRtcConnection;
use super::{
    FactoryError, MediaConstraints, NegotiationError, PeerEventSender, PeerType,
    DEFAULT_STATS_INTERVAL_SECS,
};

/// Stream id shared by all local tracks.
pub const LOCAL_STREAM_ID: &str = "tandem-local";

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Video codecs the engine can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
}

impl VideoCodec {
    const fn mime_type(self) -> &'static str {
        match self {
            Self::Vp8 => MIME_TYPE_VP8,
            Self::Vp9 => MIME_TYPE_VP9,
            Self::H264 => MIME_TYPE_H264,
        }
    }

    const fn payload_type(self) -> u8 {
        match self {
            Self::Vp8 => 96,
            Self::Vp9 => 98,
            Self::H264 => 102,
        }
    }

    const fn fmtp(self) -> &'static str {
        match self {
            Self::Vp8 => "",
            Self::Vp9 => "profile-id=0",
            Self::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"
            }
        }
    }

    fn capability(self) -> RTCRtpCodecCapability {
        let feedback = [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")];
        RTCRtpCodecCapability {
            mime_type: self.mime_type().to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: self.fmtp().to_string(),
            rtcp_feedback: feedback
                .into_iter()
                .map(|(typ, parameter)| RTCPFeedback {
                    typ: typ.to_string(),
                    parameter: parameter.to_string(),
                })
                .collect(),
        }
    }
}

/// Video codec preference: hardware codecs first, software fallback after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCodecConfig {
    pub hardware: Vec<VideoCodec>,
    pub software: Vec<VideoCodec>,
}

impl Default for VideoCodecConfig {
    fn default() -> Self {
        Self {
            hardware: Vec::new(),
            software: vec![VideoCodec::Vp8, VideoCodec::Vp9, VideoCodec::H264],
        }
    }
}

impl VideoCodecConfig {
    /// Codecs in registration order, without duplicates.
    pub fn effective(&self) -> Vec<VideoCodec> {
        let mut codecs = Vec::new();
        for codec in self.hardware.iter().chain(&self.software) {
            if !codecs.contains(codec) {
                codecs.push(*codec);
            }
        }
        codecs
    }
}

/// Audio processing requested for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub high_pass_filter: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            high_pass_filter: true,
        }
    }
}

/// Shared configuration for every connection built by one factory.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub video_codecs: VideoCodecConfig,
    /// The platform cancels echo in hardware.
    pub hardware_echo_cancellation: bool,
    /// The platform suppresses noise in hardware.
    pub hardware_noise_suppression: bool,
    pub stats_interval: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::default()],
            video_codecs: VideoCodecConfig::default(),
            hardware_echo_cancellation: false,
            hardware_noise_suppression: false,
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
        }
    }
}

/// Local video source.
#[derive(Debug, Clone)]
pub struct VideoSource {
    pub id: String,
    pub is_screencast: bool,
    pub codec: VideoCodec,
}

/// Local audio source.
#[derive(Debug, Clone)]
pub struct AudioSource {
    pub id: String,
    pub constraints: AudioConstraints,
    pub hardware_echo_cancellation: bool,
    pub hardware_noise_suppression: bool,
}

/// Builds connections and local media on a shared engine configuration.
pub struct PeerConnectionFactory {
    api: Arc<API>,
    config: FactoryConfig,
    codecs: Vec<VideoCodec>,
}

impl PeerConnectionFactory {
    /// Build the media engine.
    ///
    /// A failure here means the engine is misconfigured; no call can be made
    /// with this configuration.
    pub fn new(config: FactoryConfig) -> Result<Self, FactoryError> {
        let codecs = config.video_codecs.effective();
        if codecs.is_empty() {
            return Err(FactoryError::EngineInit("no video codecs configured".into()));
        }

        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| FactoryError::EngineInit(e.to_string()))?;

        for codec in &codecs {
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: codec.capability(),
                        payload_type: codec.payload_type(),
                        ..Default::default()
                    },
                    RTPCodecType::Video,
                )
                .map_err(|e| FactoryError::EngineInit(e.to_string()))?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| FactoryError::EngineInit(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!(
            ?codecs,
            hardware_aec = config.hardware_echo_cancellation,
            hardware_ns = config.hardware_noise_suppression,
            "Peer connection factory initialized"
        );

        Ok(Self {
            api: Arc::new(api),
            config,
            codecs,
        })
    }

    /// Configuration this factory was built with.
    pub const fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Video codecs in preference order.
    pub fn video_codecs(&self) -> &[VideoCodec] {
        &self.codecs
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    /// Build an initialized connection whose owner-facing events go to
    /// `events_tx`.
    pub async fn make_peer_connection(
        &self,
        peer_type: PeerType,
        constraints: MediaConstraints,
        events_tx: PeerEventSender,
    ) -> Result<Arc<PeerConnection>, NegotiationError> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_config())
            .await
            .map_err(|e| NegotiationError::PeerConnection(e.to_string()))?;

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let connection = WebRtcConnection::new(peer_type, Arc::new(pc), engine_tx);

        let peer = Arc::new(PeerConnection::new(
            peer_type,
            constraints,
            self.config.stats_interval,
            events_tx,
        ));
        peer.initialize(Arc::new(connection)).await?;
        peer.spawn_event_dispatch(engine_rx);

        Ok(peer)
    }

    /// Build a video source encoded with the preferred codec.
    pub fn make_video_source(&self, is_screencast: bool) -> VideoSource {
        let source = VideoSource {
            id: Uuid::now_v7().to_string(),
            is_screencast,
            codec: self.codecs[0],
        };
        debug!(id = %source.id, is_screencast, codec = ?source.codec, "Video source created");
        source
    }

    /// Build a local video track fed by `source`.
    pub fn make_video_track(
        &self,
        source: &VideoSource,
        track_id: Option<String>,
    ) -> Arc<TrackLocalStaticSample> {
        let id = track_id.unwrap_or_else(|| format!("video-{}", Uuid::now_v7()));
        debug!(%id, source = %source.id, "Video track created");
        Arc::new(TrackLocalStaticSample::new(
            source.codec.capability(),
            id,
            LOCAL_STREAM_ID.to_string(),
        ))
    }

    /// Build an audio source with the requested processing.
    pub fn make_audio_source(&self, constraints: AudioConstraints) -> AudioSource {
        let source = AudioSource {
            id: Uuid::now_v7().to_string(),
            constraints,
            hardware_echo_cancellation: self.config.hardware_echo_cancellation,
            hardware_noise_suppression: self.config.hardware_noise_suppression,
        };
        debug!(id = %source.id, ?constraints, "Audio source created");
        source
    }

    /// Build a local Opus track fed by `source`.
    pub fn make_audio_track(
        &self,
        source: &AudioSource,
        track_id: Option<String>,
    ) -> Arc<TrackLocalStaticSample> {
        let id = track_id.unwrap_or_else(|| format!("audio-{}", Uuid::now_v7()));
        debug!(%id, source = %source.id, "Audio track created");
        Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            id,
            LOCAL_STREAM_ID.to_string(),
        ))
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::NegotiationState;
    use webrtc::track::track_local::TrackLocal;

    #[test]
    fn hardware_codecs_come_first_without_duplicates() {
        let config = VideoCodecConfig {
            hardware: vec![VideoCodec::H264],
            software: vec![VideoCodec::Vp8, VideoCodec::Vp9, VideoCodec::H264],
        };
        assert_eq!(
            config.effective(),
            vec![VideoCodec::H264, VideoCodec::Vp8, VideoCodec::Vp9]
        );
        assert_eq!(
            VideoCodecConfig::default().effective(),
            vec![VideoCodec::Vp8, VideoCodec::Vp9, VideoCodec::H264]
        );
    }

    #[test]
    fn factory_without_codecs_fails() {
        let config = FactoryConfig {
            video_codecs: VideoCodecConfig {
                hardware: vec![],
                software: vec![],
            },
            ..Default::default()
        };
        assert!(matches!(
            PeerConnectionFactory::new(config),
            Err(FactoryError::EngineInit(_))
        ));
    }

    #[test]
    fn builds_sources_and_tracks() {
        let factory = PeerConnectionFactory::new(FactoryConfig {
            hardware_echo_cancellation: true,
            ..Default::default()
        })
        .unwrap();

        let video = factory.make_video_source(false);
        assert_eq!(video.codec, VideoCodec::Vp8);
        let track = factory.make_video_track(&video, Some("camera".into()));
        assert_eq!(track.id(), "camera");
        assert_eq!(track.stream_id(), LOCAL_STREAM_ID);
        assert_eq!(track.kind(), RTPCodecType::Video);

        let audio = factory.make_audio_source(AudioConstraints::default());
        assert!(audio.hardware_echo_cancellation);
        assert!(!audio.hardware_noise_suppression);
        let track = factory.make_audio_track(&audio, None);
        assert!(track.id().starts_with("audio-"));
        assert_eq!(track.kind(), RTPCodecType::Audio);
    }

    #[tokio::test]
    async fn offer_carries_local_tracks() {
        let factory = PeerConnectionFactory::new(FactoryConfig::default()).unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let peer = factory
            .make_peer_connection(PeerType::Publisher, MediaConstraints::audio_video(), events_tx)
            .await
            .unwrap();
        assert_eq!(peer.state().await, NegotiationState::Initialized);

        let audio = factory.make_audio_source(AudioConstraints::default());
        peer.add_track(factory.make_audio_track(&audio, None))
            .await
            .unwrap();
        let video = factory.make_video_source(false);
        peer.add_track(factory.make_video_track(&video, None))
            .await
            .unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("VP8/90000"));

        peer.close().await.unwrap();
        assert_eq!(peer.state().await, NegotiationState::Closed);
    }
}
