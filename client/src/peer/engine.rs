//! Engine seam.
//!
//! [`RtcConnection`] is the subset of the media engine the negotiation manager
//! drives. [`WebRtcConnection`] implements it on top of `webrtc`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tandem_common::{IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::connection::ConnectionStats;
use super::{MediaConstraints, NegotiationError, PeerEvent, PeerEventSender, PeerType};

/// Operations the negotiation manager needs from a media engine connection.
#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), NegotiationError>;

    /// Current statistics report.
    async fn stats(&self) -> ConnectionStats;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// [`RtcConnection`] backed by a `webrtc` peer connection.
pub struct WebRtcConnection {
    peer_type: PeerType,
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcConnection {
    /// Wrap `pc` and report all of its events on `events_tx`.
    pub fn new(
        peer_type: PeerType,
        pc: Arc<RTCPeerConnection>,
        events_tx: PeerEventSender,
    ) -> Self {
        Self::setup_event_handlers(peer_type, &pc, &events_tx);
        Self { peer_type, pc }
    }

    /// Underlying engine connection.
    pub const fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn setup_event_handlers(
        peer_type: PeerType,
        pc: &Arc<RTCPeerConnection>,
        events_tx: &PeerEventSender,
    ) {
        let emit = {
            let events_tx = events_tx.clone();
            move |event: PeerEvent| {
                if events_tx.send((peer_type, event)).is_err() {
                    debug!(peer = %peer_type, "Peer event dispatcher gone");
                }
            }
        };

        let on_candidate = emit.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let emit = on_candidate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(peer = %peer_type, "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emit(PeerEvent::IceCandidate(IceCandidate::new(
                        init.sdp_mid.unwrap_or_default(),
                        init.sdp_mline_index.unwrap_or_default(),
                        init.candidate,
                    ))),
                    Err(e) => warn!(peer = %peer_type, "Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let on_ice_state = emit.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let emit = on_ice_state.clone();
            Box::pin(async move {
                emit(PeerEvent::IceConnectionStateChanged(state.into()));
            })
        }));

        let on_state = emit.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let emit = on_state.clone();
            Box::pin(async move {
                info!(peer = %peer_type, "Peer connection state changed: {:?}", state);
                emit(PeerEvent::ConnectionStateChanged(state.into()));
            })
        }));

        // The engine reports tracks, not streams; the first track seen for a
        // stream id announces the stream.
        let seen_streams = Arc::new(Mutex::new(HashSet::new()));
        let on_track = emit.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let emit = on_track.clone();
            let seen_streams = seen_streams.clone();
            Box::pin(async move {
                info!(
                    peer = %peer_type,
                    "Remote track received: {} ({})",
                    track.kind(),
                    track.codec().capability.mime_type
                );
                let stream_id = track.stream_id();
                let first = seen_streams
                    .lock()
                    .map(|mut seen| seen.insert(stream_id.clone()))
                    .unwrap_or(false);
                if first {
                    emit(PeerEvent::StreamAdded(stream_id));
                }
                emit(PeerEvent::Track(track));
            })
        }));

        let on_negotiation = emit.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let emit = on_negotiation.clone();
            Box::pin(async move {
                emit(PeerEvent::RenegotiationNeeded);
            })
        }));

        let on_signaling = emit.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let emit = on_signaling.clone();
            Box::pin(async move {
                emit(PeerEvent::SignalingStateChanged(state));
            })
        }));

        let on_gathering = emit.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let emit = on_gathering.clone();
            Box::pin(async move {
                emit(PeerEvent::IceGatheringStateChanged(state));
            })
        }));

        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let emit = emit.clone();
            Box::pin(async move {
                emit(PeerEvent::DataChannel(channel));
            })
        }));
    }

    /// Add a receive-only transceiver unless one of `kind` already exists.
    async fn ensure_receiving(&self, kind: RTPCodecType) -> Result<(), NegotiationError> {
        let exists = self
            .pc
            .get_transceivers()
            .await
            .iter()
            .any(|transceiver| transceiver.kind() == kind);
        if exists {
            return Ok(());
        }

        debug!(peer = %self.peer_type, %kind, "Adding receive-only transceiver");
        self.pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map(|_| ())
            .map_err(|e| NegotiationError::Track(e.to_string()))
    }
}

fn to_engine(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(|e| NegotiationError::Sdp(e.to_string()))
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, NegotiationError> {
        if constraints.offer_to_receive_audio {
            self.ensure_receiving(RTPCodecType::Audio).await?;
        }
        if constraints.offer_to_receive_video {
            self.ensure_receiving(RTPCodecType::Video).await?;
        }

        let options = RTCOfferOptions {
            voice_activity_detection: constraints.voice_activity_detection,
            ice_restart: constraints.ice_restart,
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, NegotiationError> {
        let options = RTCAnswerOptions {
            voice_activity_detection: constraints.voice_activity_detection,
        };
        let answer = self
            .pc
            .create_answer(Some(options))
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_engine(description)?)
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_engine(description)?)
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Ice(e.to_string()))
    }

    async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), NegotiationError> {
        let track_id = track.id().to_string();
        let sender = self
            .pc
            .add_track(track)
            .await
            .map_err(|e| NegotiationError::Track(e.to_string()))?;

        // RTCP has to be drained for the interceptors to run.
        let peer_type = self.peer_type;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
            debug!(peer = %peer_type, track = %track_id, "RTCP reader finished");
        });
        Ok(())
    }

    async fn stats(&self) -> ConnectionStats {
        let report = self.pc.get_stats().await;
        let report_count = report.reports.len();
        let report = serde_json::to_value(&report).unwrap_or_else(|e| {
            warn!(peer = %self.peer_type, "Failed to serialize stats report: {}", e);
            serde_json::Value::Null
        });

        ConnectionStats {
            collected_at: Utc::now(),
            report_count,
            report,
        }
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc
            .close()
            .await
            .map_err(|e| NegotiationError::PeerConnection(e.to_string()))
    }
}
