//! Negotiation Manager
//!
//! Owns one engine connection: creates and applies session descriptions and
//! holds remote ICE candidates until a remote description is in place.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tandem_common::{IceCandidate, SessionDescription};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::track::track_local::TrackLocal;

use super::engine::RtcConnection;
use super::{
    IceConnectionState, MediaConstraints, NegotiationError, PeerEvent, PeerEventReceiver,
    PeerEventSender, PeerType,
};

/// Lifecycle of a [`PeerConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Uninitialized,
    Initialized,
    Closed,
}

/// Result of [`PeerConnection::add_ice_candidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceCandidateOutcome {
    /// The candidate was handed to the engine.
    Applied,
    /// No remote description yet; the candidate is queued and will be applied
    /// once one is set.
    Deferred,
}

/// Snapshot of the engine's statistics report.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub collected_at: DateTime<Utc>,
    /// Number of individual reports (transports, candidate pairs, RTP streams...).
    pub report_count: usize,
    pub report: serde_json::Value,
}

enum Slot {
    Uninitialized,
    Initialized(Arc<dyn RtcConnection>),
    Closed,
}

#[derive(Default)]
struct PendingIce {
    remote_description_set: bool,
    candidates: Vec<IceCandidate>,
}

/// One negotiated call leg.
pub struct PeerConnection {
    peer_type: PeerType,
    constraints: MediaConstraints,
    stats_interval: Duration,
    slot: RwLock<Slot>,
    /// Serializes description-mutating calls.
    negotiation: Mutex<()>,
    /// Guards the pending candidate queue and its drain.
    pending_ice: Mutex<PendingIce>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    stats_tx: watch::Sender<Option<ConnectionStats>>,
    events_tx: PeerEventSender,
}

impl PeerConnection {
    /// Create an uninitialized connection. [`initialize`](Self::initialize)
    /// must be called before any negotiation.
    pub fn new(
        peer_type: PeerType,
        constraints: MediaConstraints,
        stats_interval: Duration,
        events_tx: PeerEventSender,
    ) -> Self {
        info!(peer = %peer_type, ?constraints, "Peer connection created");
        let (stats_tx, _) = watch::channel(None);

        Self {
            peer_type,
            constraints,
            stats_interval,
            slot: RwLock::new(Slot::Uninitialized),
            negotiation: Mutex::new(()),
            pending_ice: Mutex::new(PendingIce::default()),
            stats_task: Mutex::new(None),
            stats_tx,
            events_tx,
        }
    }

    /// Attach the engine connection.
    pub async fn initialize(
        &self,
        connection: Arc<dyn RtcConnection>,
    ) -> Result<(), NegotiationError> {
        let mut slot = self.slot.write().await;
        match *slot {
            Slot::Uninitialized => {
                *slot = Slot::Initialized(connection);
                debug!(peer = %self.peer_type, "Peer connection initialized");
                Ok(())
            }
            Slot::Initialized(_) => Err(NegotiationError::AlreadyInitialized),
            Slot::Closed => Err(NegotiationError::Closed),
        }
    }

    /// Role of this leg.
    pub const fn peer_type(&self) -> PeerType {
        self.peer_type
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> NegotiationState {
        match *self.slot.read().await {
            Slot::Uninitialized => NegotiationState::Uninitialized,
            Slot::Initialized(_) => NegotiationState::Initialized,
            Slot::Closed => NegotiationState::Closed,
        }
    }

    async fn connection(&self) -> Result<Arc<dyn RtcConnection>, NegotiationError> {
        match &*self.slot.read().await {
            Slot::Initialized(connection) => Ok(connection.clone()),
            Slot::Uninitialized => Err(NegotiationError::NotInitialized),
            Slot::Closed => Err(NegotiationError::Closed),
        }
    }

    /// Create an offer for this connection.
    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        debug!(peer = %self.peer_type, "[createOffer]");
        let connection = self.connection().await?;
        let _negotiation = self.negotiation.lock().await;
        connection.create_offer(&self.constraints).await
    }

    /// Create an answer to the applied remote offer.
    pub async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        debug!(peer = %self.peer_type, "[createAnswer]");
        let connection = self.connection().await?;
        let _negotiation = self.negotiation.lock().await;
        connection.create_answer(&self.constraints).await
    }

    /// Apply a local description after normalizing its codec tokens.
    pub async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = description.normalized();
        debug!(peer = %self.peer_type, kind = %description.kind, "[setLocalDescription]");

        let connection = self.connection().await?;
        let _negotiation = self.negotiation.lock().await;
        connection.set_local_description(description).await
    }

    /// Apply a remote description after normalizing its codec tokens, then
    /// apply every queued candidate in arrival order.
    ///
    /// Candidates that fail to apply are logged; they do not fail the call.
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = description.normalized();
        debug!(peer = %self.peer_type, kind = %description.kind, "[setRemoteDescription]");

        let connection = self.connection().await?;
        let _negotiation = self.negotiation.lock().await;
        connection.set_remote_description(description).await?;

        let mut pending = self.pending_ice.lock().await;
        pending.remote_description_set = true;
        let candidates = std::mem::take(&mut pending.candidates);
        if !candidates.is_empty() {
            info!(
                peer = %self.peer_type,
                count = candidates.len(),
                "Applying pending ICE candidates"
            );
        }
        for candidate in candidates {
            debug!(peer = %self.peer_type, %candidate, "[setRemoteDescription] pending candidate");
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(peer = %self.peer_type, "Failed to apply pending ICE candidate: {}", e);
            }
        }

        Ok(())
    }

    /// Apply a remote candidate, or queue it when no remote description has
    /// been applied yet.
    pub async fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<IceCandidateOutcome, NegotiationError> {
        let connection = self.connection().await?;

        {
            let mut pending = self.pending_ice.lock().await;
            if !pending.remote_description_set {
                warn!(
                    peer = %self.peer_type,
                    %candidate,
                    "[addIceCandidate] postponed (no remote description)"
                );
                pending.candidates.push(candidate);
                return Ok(IceCandidateOutcome::Deferred);
            }
        }

        debug!(peer = %self.peer_type, %candidate, "[addIceCandidate]");
        connection.add_ice_candidate(candidate).await?;
        Ok(IceCandidateOutcome::Applied)
    }

    /// Number of candidates waiting for a remote description.
    pub async fn pending_candidate_count(&self) -> usize {
        self.pending_ice.lock().await.candidates.len()
    }

    /// Publish a local track on this connection.
    pub async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), NegotiationError> {
        let connection = self.connection().await?;
        connection.add_track(track).await
    }

    /// Latest statistics report; `None` until the connection has been
    /// connected for one interval.
    pub fn stats(&self) -> watch::Receiver<Option<ConnectionStats>> {
        self.stats_tx.subscribe()
    }

    /// Whether periodic statistics collection is running.
    pub async fn is_collecting_stats(&self) -> bool {
        self.stats_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Dispatch engine events to [`handle_event`](Self::handle_event) until the
    /// engine stops reporting or this connection is dropped.
    pub fn spawn_event_dispatch(self: &Arc<Self>, mut events: PeerEventReceiver) -> JoinHandle<()> {
        let peer: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some((_, event)) = events.recv().await {
                let Some(peer) = peer.upgrade() else {
                    break;
                };
                peer.handle_event(event).await;
            }
        })
    }

    /// Single entry point for engine events.
    ///
    /// ICE connection state drives statistics collection. Candidates, tracks,
    /// streams, renegotiation and connection state are forwarded to the owner
    /// without interpretation.
    pub async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IceConnectionStateChanged(state) => {
                info!(peer = %self.peer_type, ?state, "[onIceConnectionChange]");
                if state.is_terminal() {
                    self.stop_stats().await;
                } else if state == IceConnectionState::Connected {
                    self.start_stats().await;
                }
            }
            PeerEvent::IceCandidate(_)
            | PeerEvent::StreamAdded(_)
            | PeerEvent::Track(_)
            | PeerEvent::RenegotiationNeeded
            | PeerEvent::ConnectionStateChanged(_) => {
                debug!(peer = %self.peer_type, ?event, "Forwarding peer event");
                if self.events_tx.send((self.peer_type, event)).is_err() {
                    debug!(peer = %self.peer_type, "Peer event receiver dropped");
                }
            }
            PeerEvent::SignalingStateChanged(state) => {
                debug!(peer = %self.peer_type, %state, "[onSignalingChange]");
            }
            PeerEvent::IceGatheringStateChanged(state) => {
                info!(peer = %self.peer_type, %state, "[onIceGatheringChange]");
            }
            PeerEvent::DataChannel(channel) => {
                debug!(peer = %self.peer_type, label = channel.label(), "Ignoring data channel");
            }
        }
    }

    async fn start_stats(&self) {
        let connection = match self.connection().await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(peer = %self.peer_type, "Not collecting stats: {}", e);
                return;
            }
        };

        let mut task = self.stats_task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let stats_tx = self.stats_tx.clone();
        let interval = self.stats_interval;
        let peer_type = self.peer_type;
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let stats = connection.stats().await;
                debug!(peer = %peer_type, reports = stats.report_count, "[observeStats]");
                stats_tx.send_replace(Some(stats));
            }
        }));
    }

    async fn stop_stats(&self) {
        if let Some(task) = self.stats_task.lock().await.take() {
            task.abort();
            debug!(peer = %self.peer_type, "Stats collection stopped");
        }
    }

    /// Stop statistics, close the engine connection and move to Closed.
    /// Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), NegotiationError> {
        let previous = std::mem::replace(&mut *self.slot.write().await, Slot::Closed);
        self.stop_stats().await;

        if let Slot::Initialized(connection) = previous {
            if let Err(e) = connection.close().await {
                error!(peer = %self.peer_type, "Failed to close peer connection: {}", e);
                return Err(e);
            }
            info!(peer = %self.peer_type, "Peer connection closed");
        }
        Ok(())
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(task) = self.stats_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tandem_common::SdpKind;
    use tokio::sync::mpsc;

    /// Engine call recorded by [`FakeConnection`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        CreateOffer,
        CreateAnswer,
        SetLocal(SessionDescription),
        SetRemote(SessionDescription),
        AddCandidate(IceCandidate),
        AddTrack(String),
        Stats,
        Close,
    }

    /// In-memory engine that records every call.
    #[derive(Default)]
    pub(crate) struct FakeConnection {
        pub calls: StdMutex<Vec<Call>>,
        pub fail_remote: StdMutex<bool>,
        pub fail_candidates: StdMutex<Vec<String>>,
    }

    impl FakeConnection {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn applied_candidates(&self) -> Vec<IceCandidate> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::AddCandidate(candidate) => Some(candidate),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl RtcConnection for FakeConnection {
        async fn create_offer(
            &self,
            _constraints: &MediaConstraints,
        ) -> Result<SessionDescription, NegotiationError> {
            self.record(Call::CreateOffer);
            Ok(SessionDescription::offer("a=rtpmap:96 vp8/90000"))
        }

        async fn create_answer(
            &self,
            _constraints: &MediaConstraints,
        ) -> Result<SessionDescription, NegotiationError> {
            self.record(Call::CreateAnswer);
            Ok(SessionDescription::answer("a=rtpmap:102 h264/90000"))
        }

        async fn set_local_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), NegotiationError> {
            self.record(Call::SetLocal(description));
            Ok(())
        }

        async fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), NegotiationError> {
            if *self.fail_remote.lock().unwrap() {
                return Err(NegotiationError::Sdp("rejected".into()));
            }
            self.record(Call::SetRemote(description));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
            let fail = self
                .fail_candidates
                .lock()
                .unwrap()
                .contains(&candidate.candidate);
            self.record(Call::AddCandidate(candidate));
            if fail {
                return Err(NegotiationError::Ice("bad candidate".into()));
            }
            Ok(())
        }

        async fn add_track(
            &self,
            track: Arc<dyn TrackLocal + Send + Sync>,
        ) -> Result<(), NegotiationError> {
            self.record(Call::AddTrack(track.id().to_string()));
            Ok(())
        }

        async fn stats(&self) -> ConnectionStats {
            self.record(Call::Stats);
            ConnectionStats {
                collected_at: Utc::now(),
                report_count: 0,
                report: serde_json::Value::Null,
            }
        }

        async fn close(&self) -> Result<(), NegotiationError> {
            self.record(Call::Close);
            Ok(())
        }
    }

    pub(crate) async fn fake_peer() -> (
        Arc<PeerConnection>,
        Arc<FakeConnection>,
        mpsc::UnboundedReceiver<(PeerType, PeerEvent)>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(PeerConnection::new(
            PeerType::Subscriber,
            MediaConstraints::audio_video(),
            Duration::from_secs(10),
            events_tx,
        ));
        let engine = Arc::new(FakeConnection::default());
        peer.initialize(engine.clone()).await.unwrap();
        (peer, engine, events_rx)
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate::new(
            "0",
            0,
            format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"),
        )
    }

    #[tokio::test]
    async fn operations_require_initialization() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let peer = PeerConnection::new(
            PeerType::Publisher,
            MediaConstraints::default(),
            Duration::from_secs(10),
            events_tx,
        );
        assert_eq!(peer.state().await, NegotiationState::Uninitialized);
        assert!(matches!(
            peer.create_offer().await,
            Err(NegotiationError::NotInitialized)
        ));
        assert!(matches!(
            peer.add_ice_candidate(candidate(1)).await,
            Err(NegotiationError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn initialize_twice_fails() {
        let (peer, _engine, _events) = fake_peer().await;
        assert_eq!(peer.state().await, NegotiationState::Initialized);
        let again = peer.initialize(Arc::new(FakeConnection::default())).await;
        assert!(matches!(again, Err(NegotiationError::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn early_candidates_applied_once_in_order() {
        let (peer, engine, _events) = fake_peer().await;

        for n in 1..=3 {
            let outcome = peer.add_ice_candidate(candidate(n)).await.unwrap();
            assert_eq!(outcome, IceCandidateOutcome::Deferred);
        }
        assert_eq!(peer.pending_candidate_count().await, 3);
        assert!(engine.applied_candidates().is_empty());

        peer.set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();

        assert_eq!(
            engine.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
        assert_eq!(peer.pending_candidate_count().await, 0);
    }

    #[tokio::test]
    async fn second_remote_description_does_not_reapply() {
        let (peer, engine, _events) = fake_peer().await;

        peer.add_ice_candidate(candidate(1)).await.unwrap();
        peer.set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        peer.set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();

        assert_eq!(engine.applied_candidates(), vec![candidate(1)]);
    }

    #[tokio::test]
    async fn candidates_after_remote_description_apply_immediately() {
        let (peer, engine, _events) = fake_peer().await;

        peer.set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        let outcome = peer.add_ice_candidate(candidate(7)).await.unwrap();

        assert_eq!(outcome, IceCandidateOutcome::Applied);
        assert_eq!(engine.applied_candidates(), vec![candidate(7)]);
    }

    #[tokio::test]
    async fn failed_remote_description_keeps_queue() {
        let (peer, engine, _events) = fake_peer().await;

        peer.add_ice_candidate(candidate(1)).await.unwrap();
        *engine.fail_remote.lock().unwrap() = true;
        assert!(peer
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .is_err());
        assert!(engine.applied_candidates().is_empty());
        assert_eq!(peer.pending_candidate_count().await, 1);

        // Still deferred until a remote description succeeds.
        let outcome = peer.add_ice_candidate(candidate(2)).await.unwrap();
        assert_eq!(outcome, IceCandidateOutcome::Deferred);

        *engine.fail_remote.lock().unwrap() = false;
        peer.set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(engine.applied_candidates(), vec![candidate(1), candidate(2)]);
    }

    #[tokio::test]
    async fn failing_pending_candidate_does_not_fail_remote_description() {
        let (peer, engine, _events) = fake_peer().await;
        engine
            .fail_candidates
            .lock()
            .unwrap()
            .push(candidate(2).candidate);

        for n in 1..=3 {
            peer.add_ice_candidate(candidate(n)).await.unwrap();
        }
        peer.set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();

        assert_eq!(
            engine.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
    }

    #[tokio::test]
    async fn concurrent_candidates_are_not_lost_or_duplicated() {
        let (peer, engine, _events) = fake_peer().await;

        let mut adds = Vec::new();
        for n in 0..50 {
            let peer = peer.clone();
            adds.push(tokio::spawn(async move {
                peer.add_ice_candidate(candidate(n)).await.unwrap()
            }));
        }
        let remote = {
            let peer = peer.clone();
            tokio::spawn(async move {
                peer.set_remote_description(SessionDescription::offer("v=0"))
                    .await
                    .unwrap();
            })
        };
        for add in adds {
            add.await.unwrap();
        }
        remote.await.unwrap();

        let mut applied: Vec<String> = engine
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(peer.pending_candidate_count().await, 0);
        assert_eq!(applied.len(), 50);
        applied.sort();
        applied.dedup();
        assert_eq!(applied.len(), 50);
    }

    #[tokio::test]
    async fn descriptions_are_normalized() {
        let (peer, engine, _events) = fake_peer().await;

        let offer = peer.create_offer().await.unwrap();
        peer.set_local_description(offer).await.unwrap();
        peer.set_remote_description(SessionDescription::answer("a=rtpmap:98 vp9/90000"))
            .await
            .unwrap();

        let calls = engine.calls();
        assert!(calls.contains(&Call::SetLocal(SessionDescription::offer(
            "a=rtpmap:96 VP8/90000"
        ))));
        assert!(calls.contains(&Call::SetRemote(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "a=rtpmap:98 VP9/90000".into(),
        })));
    }

    #[tokio::test]
    async fn forwards_owner_events() {
        let (peer, _engine, mut events) = fake_peer().await;

        peer.handle_event(PeerEvent::IceCandidate(candidate(1))).await;
        peer.handle_event(PeerEvent::RenegotiationNeeded).await;

        let (peer_type, event) = events.recv().await.unwrap();
        assert_eq!(peer_type, PeerType::Subscriber);
        assert!(matches!(event, PeerEvent::IceCandidate(c) if c == candidate(1)));
        assert!(matches!(
            events.recv().await.unwrap().1,
            PeerEvent::RenegotiationNeeded
        ));
    }

    #[tokio::test]
    async fn ice_state_is_not_forwarded() {
        let (peer, _engine, mut events) = fake_peer().await;
        peer.handle_event(PeerEvent::IceConnectionStateChanged(IceConnectionState::Checking))
            .await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_follow_ice_connection_state() {
        let (peer, engine, _events) = fake_peer().await;
        let mut stats = peer.stats();

        peer.handle_event(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected))
            .await;
        assert!(peer.is_collecting_stats().await);

        tokio::time::sleep(Duration::from_secs(11)).await;
        stats.changed().await.unwrap();
        assert!(stats.borrow().is_some());
        assert!(engine.calls().contains(&Call::Stats));

        peer.handle_event(PeerEvent::IceConnectionStateChanged(IceConnectionState::Disconnected))
            .await;
        assert!(!peer.is_collecting_stats().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (peer, engine, _events) = fake_peer().await;

        peer.handle_event(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected))
            .await;
        peer.close().await.unwrap();
        peer.close().await.unwrap();

        assert_eq!(peer.state().await, NegotiationState::Closed);
        assert!(!peer.is_collecting_stats().await);
        let closes = engine.calls().iter().filter(|c| **c == Call::Close).count();
        assert_eq!(closes, 1);
        assert!(matches!(
            peer.create_answer().await,
            Err(NegotiationError::Closed)
        ));
    }
}
