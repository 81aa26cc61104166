//! Call Session
//!
//! Wires the signaling channel, the negotiation manager and audio routing
//! together for one two-party call. Sequencing only: decisions about
//! descriptions, candidates and devices live in the components.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tandem_common::{IceCandidate, SessionDescription, SessionState, SignalingCommand};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::{AudioManagerAdapter, AudioRouteError, AudioRouteHandler};
use crate::config::Config;
use crate::peer::{
    AudioConstraints, FactoryError, IceCandidateOutcome, MediaConstraints, NegotiationError,
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventReceiver,
    PeerType,
};
use crate::signaling::{CommandReceiver, SignalingClient, SignalingMessage};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error(transparent)]
    AudioRoute(#[from] AudioRouteError),
    #[error("Video capture error: {0}")]
    Capture(String),
    #[error("Session disconnected")]
    Disconnected,
}

/// Call progress as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    #[default]
    Idle,
    Negotiating,
    Connected,
    /// Negotiation failed; the call cannot continue.
    Failed,
    Ended,
}

/// Camera capture resolution and frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// Camera feeding the local video track.
pub trait VideoCapturer: Send + Sync {
    fn start_capture(&self, format: CaptureFormat) -> Result<(), SessionError>;

    fn stop_capture(&self);

    /// Switch between front and back camera.
    fn switch_camera(&self) -> Result<(), SessionError>;
}

#[derive(Default)]
struct Negotiation {
    screen_ready: bool,
    /// Remote offer received before the screen was ready.
    pending_offer: Option<String>,
}

struct Inner {
    signaling: Arc<SignalingClient>,
    peer: Arc<PeerConnection>,
    audio: AudioRouteHandler,
    capturer: Arc<dyn VideoCapturer>,
    capture_format: CaptureFormat,
    local_audio_track: Arc<TrackLocalStaticSample>,
    local_video_track: Arc<TrackLocalStaticSample>,
    negotiation: Mutex<Negotiation>,
    local_video_tx: watch::Sender<Option<Arc<TrackLocalStaticSample>>>,
    remote_video_tx: watch::Sender<Option<Arc<TrackRemote>>>,
    status_tx: watch::Sender<CallStatus>,
    microphone_tx: watch::Sender<bool>,
    disconnected: AtomicBool,
}

/// One call between this endpoint and the peer on the other side of the relay.
pub struct SessionManager {
    inner: Arc<Inner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    /// Connect to the relay and prepare a connection and local media.
    pub async fn new(
        config: &Config,
        factory: &PeerConnectionFactory,
        audio_manager: Arc<dyn AudioManagerAdapter>,
        capturer: Arc<dyn VideoCapturer>,
    ) -> Result<Self, SessionError> {
        // Subscribed before the relay can deliver anything, so an early
        // offer is kept while the connection is being built.
        let (signaling, commands) =
            SignalingClient::connect(config.signaling_url.clone(), config.signaling_reconnect);
        let signaling = Arc::new(signaling);

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let peer = factory
            .make_peer_connection(
                PeerType::Subscriber,
                MediaConstraints::audio_video(),
                events_tx,
            )
            .await?;

        let audio_source = factory.make_audio_source(AudioConstraints::default());
        let local_audio_track = factory.make_audio_track(&audio_source, None);
        let video_source = factory.make_video_source(false);
        let local_video_track = factory.make_video_track(&video_source, None);

        let audio = AudioRouteHandler::new(audio_manager, config.device_priority(), None)?;

        Ok(Self::from_parts(
            signaling,
            commands,
            peer,
            events_rx,
            audio,
            capturer,
            local_audio_track,
            local_video_track,
        ))
    }

    pub(crate) fn from_parts(
        signaling: Arc<SignalingClient>,
        commands: CommandReceiver,
        peer: Arc<PeerConnection>,
        peer_events: PeerEventReceiver,
        audio: AudioRouteHandler,
        capturer: Arc<dyn VideoCapturer>,
        local_audio_track: Arc<TrackLocalStaticSample>,
        local_video_track: Arc<TrackLocalStaticSample>,
    ) -> Self {
        let inner = Arc::new(Inner {
            signaling,
            peer,
            audio,
            capturer,
            capture_format: CaptureFormat::default(),
            local_audio_track,
            local_video_track,
            negotiation: Mutex::new(Negotiation::default()),
            local_video_tx: watch::Sender::new(None),
            remote_video_tx: watch::Sender::new(None),
            status_tx: watch::Sender::new(CallStatus::Idle),
            microphone_tx: watch::Sender::new(true),
            disconnected: AtomicBool::new(false),
        });

        let tasks = vec![
            tokio::spawn(command_loop(inner.clone(), commands)),
            tokio::spawn(peer_event_loop(inner.clone(), peer_events)),
        ];

        Self {
            inner,
            tasks: StdMutex::new(tasks),
        }
    }

    /// Relay-reported session state.
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.inner.signaling.session_state()
    }

    pub fn call_status(&self) -> watch::Receiver<CallStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Local camera track, set once the screen is ready.
    pub fn local_video_track(&self) -> watch::Receiver<Option<Arc<TrackLocalStaticSample>>> {
        self.inner.local_video_tx.subscribe()
    }

    /// Remote video track, set when the peer's video arrives.
    pub fn remote_video_track(&self) -> watch::Receiver<Option<Arc<TrackRemote>>> {
        self.inner.remote_video_tx.subscribe()
    }

    pub fn microphone_enabled(&self) -> watch::Receiver<bool> {
        self.inner.microphone_tx.subscribe()
    }

    /// Audio routing, for device selection and headset signals.
    pub fn audio(&self) -> &AudioRouteHandler {
        &self.inner.audio
    }

    /// The call screen is showing: start audio, publish local tracks, then
    /// answer the offer received so far or send our own.
    pub async fn on_session_screen_ready(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.disconnected.load(Ordering::SeqCst) {
            return Err(SessionError::Disconnected);
        }

        let pending_offer = {
            let mut negotiation = inner.negotiation.lock().await;
            if negotiation.screen_ready {
                warn!("[onSessionScreenReady] already ready");
                return Ok(());
            }
            negotiation.screen_ready = true;
            negotiation.pending_offer.take()
        };
        info!(answering = pending_offer.is_some(), "[onSessionScreenReady]");

        inner.status_tx.send_replace(CallStatus::Negotiating);
        let result = inner.publish_and_negotiate(pending_offer).await;
        if let Err(e) = &result {
            error!("Failed to start call: {}", e);
            inner.status_tx.send_replace(CallStatus::Failed);
        }
        result
    }

    /// Enable or mute the microphone.
    pub fn enable_microphone(&self, enabled: bool) {
        info!(enabled, "[enableMicrophone]");
        self.inner.audio.set_microphone_muted(!enabled);
        self.inner.microphone_tx.send_replace(enabled);
    }

    /// Switch to the other camera.
    pub fn flip_camera(&self) -> Result<(), SessionError> {
        debug!("[flipCamera]");
        self.inner.capturer.switch_camera()
    }

    /// End the call: stop capture, stop audio routing, close the connection
    /// and dispose signaling. Safe to call more than once.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[disconnect]");

        inner.capturer.stop_capture();
        inner.audio.stop();
        if let Err(e) = inner.peer.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
        inner.signaling.dispose();

        self.abort_tasks();
        inner.local_video_tx.send_replace(None);
        inner.remote_video_tx.send_replace(None);
        inner.status_tx.send_replace(CallStatus::Ended);
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl Inner {
    async fn publish_and_negotiate(
        &self,
        pending_offer: Option<String>,
    ) -> Result<(), SessionError> {
        self.audio.start();

        self.peer.add_track(self.local_video_track.clone()).await?;
        self.peer.add_track(self.local_audio_track.clone()).await?;
        self.capturer.start_capture(self.capture_format)?;
        self.local_video_tx
            .send_replace(Some(self.local_video_track.clone()));

        match pending_offer {
            Some(offer) => self.send_answer(offer).await,
            None => self.send_offer().await,
        }
    }

    async fn send_offer(&self) -> Result<(), SessionError> {
        let offer = self.peer.create_offer().await?;
        let offer = offer.normalized();
        self.peer.set_local_description(offer.clone()).await?;
        self.signaling
            .send_command(SignalingCommand::Offer, &offer.sdp);
        Ok(())
    }

    async fn send_answer(&self, offer: String) -> Result<(), SessionError> {
        self.peer
            .set_remote_description(SessionDescription::offer(offer))
            .await?;
        let answer = self.peer.create_answer().await?.normalized();
        self.peer.set_local_description(answer.clone()).await?;
        self.signaling
            .send_command(SignalingCommand::Answer, &answer.sdp);
        Ok(())
    }

    async fn handle_command(&self, message: SignalingMessage) {
        match message.command {
            SignalingCommand::Offer => {
                let answer_now = {
                    let mut negotiation = self.negotiation.lock().await;
                    if negotiation.screen_ready {
                        true
                    } else {
                        negotiation.pending_offer = Some(message.payload.clone());
                        false
                    }
                };
                if answer_now {
                    // The screen is already up, so this is a fresh offer.
                    self.status_tx.send_replace(CallStatus::Negotiating);
                    if let Err(e) = self.send_answer(message.payload).await {
                        error!("Failed to answer offer: {}", e);
                        self.status_tx.send_replace(CallStatus::Failed);
                    }
                } else {
                    debug!("Offer stored until the session screen is ready");
                }
            }
            SignalingCommand::Answer => {
                let answer = SessionDescription::answer(message.payload);
                if let Err(e) = self.peer.set_remote_description(answer).await {
                    error!("Failed to apply answer: {}", e);
                    self.status_tx.send_replace(CallStatus::Failed);
                }
            }
            SignalingCommand::Ice => self.handle_remote_ice(&message.payload).await,
            SignalingCommand::State => {}
        }
    }

    async fn handle_remote_ice(&self, payload: &str) {
        let candidate = match IceCandidate::from_payload(payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Dropping ICE candidate: {}", e);
                return;
            }
        };
        match self.peer.add_ice_candidate(candidate).await {
            Ok(IceCandidateOutcome::Applied) => {}
            Ok(IceCandidateOutcome::Deferred) => debug!("ICE candidate deferred"),
            Err(e) => warn!("Failed to add ICE candidate: {}", e),
        }
    }

    fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.signaling
                    .send_command(SignalingCommand::Ice, &candidate.to_payload());
            }
            PeerEvent::Track(track) => {
                if track.kind() == RTPCodecType::Video {
                    info!(id = %track.id(), "[onVideoTrack] remote video");
                    self.remote_video_tx.send_replace(Some(track));
                }
            }
            PeerEvent::StreamAdded(stream_id) => info!(%stream_id, "[onStreamAdded]"),
            PeerEvent::ConnectionStateChanged(state) => {
                let status = match state {
                    PeerConnectionState::Connected => Some(CallStatus::Connected),
                    PeerConnectionState::Failed => Some(CallStatus::Failed),
                    _ => None,
                };
                if let Some(status) = status {
                    self.status_tx.send_replace(status);
                }
            }
            other => debug!(event = ?other, "Ignoring peer event"),
        }
    }
}

async fn command_loop(inner: Arc<Inner>, mut commands: CommandReceiver) {
    while let Some(message) = commands.recv().await {
        inner.handle_command(message).await;
    }
}

async fn peer_event_loop(inner: Arc<Inner>, mut events: PeerEventReceiver) {
    while let Some((_, event)) = events.recv().await {
        inner.handle_peer_event(event);
    }
}
