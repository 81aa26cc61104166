//! Signaling Channel
//!
//! Persistent WebSocket connection to the relay. Tracks the session state the
//! relay reports and fans out offer, answer and ICE commands. Knows nothing
//! about negotiation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tandem_common::{SessionState, SignalingCommand, SignalingFrame};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Longest wait between reconnection attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// An inbound negotiation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub command: SignalingCommand,
    pub payload: String,
}

/// Inbound commands for one subscriber. Unbounded: a slow subscriber
/// delays its own commands but never loses any.
pub type CommandReceiver = mpsc::UnboundedReceiver<SignalingMessage>;

/// Transport status, separate from the relay's session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

struct Shared {
    session_state: watch::Sender<SessionState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SignalingMessage>>>,
    status: watch::Sender<ConnectionStatus>,
    /// Set by dispose; frames still in flight are ignored afterwards.
    closed: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            session_state: watch::Sender::new(SessionState::Offline),
            subscribers: Mutex::new(Vec::new()),
            status: watch::Sender::new(ConnectionStatus::Connecting),
            closed: AtomicBool::new(false),
        }
    }

    fn subscribe(&self) -> CommandReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Deliver to every live subscriber, forgetting the ones that hung up.
    fn fan_out(&self, message: SignalingMessage) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }

    /// Handle one relay frame. `STATE` frames only update the session state;
    /// everything else is fanned out. Unparsable frames are dropped.
    fn handle_text(&self, text: &str) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Signaling disposed, ignoring frame: {}", text);
            return;
        }
        match SignalingFrame::parse(text) {
            Ok(SignalingFrame::State(state)) => {
                info!(%state, "[onMessage] session state");
                // Checked again under the watch lock so a racing dispose wins.
                self.session_state.send_if_modified(|current| {
                    if self.closed.load(Ordering::SeqCst) {
                        return false;
                    }
                    *current = state;
                    true
                });
            }
            Ok(SignalingFrame::Command { command, payload }) => {
                debug!(%command, "[onMessage] {}", text);
                self.fan_out(SignalingMessage { command, payload });
            }
            Err(e) => {
                warn!("Dropping signaling frame: {} - {}", e, text);
            }
        }
    }

    fn go_offline(&self) {
        self.session_state.send_replace(SessionState::Offline);
    }
}

/// Client side of the relay connection.
pub struct SignalingClient {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<String>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Option<JoinHandle<()>>,
    disposed: AtomicBool,
}

impl SignalingClient {
    /// Start connecting to the relay at `url` in the background.
    ///
    /// The returned receiver is subscribed before the connection starts, so it
    /// sees every command the relay sends. With `reconnect`, a lost connection
    /// is retried with capped exponential backoff; each new connection waits
    /// for the relay's `STATE` frame.
    pub fn connect(url: Url, reconnect: bool) -> (Self, CommandReceiver) {
        let shared = Arc::new(Shared::new());
        let commands = shared.subscribe();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(connection_loop(
            url,
            reconnect,
            shared.clone(),
            outgoing_rx,
            shutdown_rx,
        ));

        let client = Self {
            shared,
            outgoing,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Some(task),
            disposed: AtomicBool::new(false),
        };
        (client, commands)
    }

    /// Queue `"<command> <payload>"` for the relay. Never waits for the
    /// network. After [`dispose`](Self::dispose) the frame is dropped.
    pub fn send_command(&self, command: SignalingCommand, payload: &str) {
        if self.disposed.load(Ordering::SeqCst) {
            warn!(%command, "Signaling disposed, dropping outbound frame");
            return;
        }
        let frame = SignalingFrame::encode(command, payload);
        debug!(%command, "[sendCommand] {}", frame);
        if self.outgoing.send(frame).is_err() {
            warn!(%command, "Signaling connection task gone, dropping outbound frame");
        }
    }

    /// Session state updates; a new receiver sees the current state at once.
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.shared.session_state.subscribe()
    }

    pub fn current_state(&self) -> SessionState {
        *self.shared.session_state.borrow()
    }

    /// Inbound offer, answer and ICE commands received from now on.
    pub fn commands(&self) -> CommandReceiver {
        self.shared.subscribe()
    }

    /// Transport status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Close the connection and go Offline. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[dispose] closing signaling connection");
        self.shared.closed.store(true, Ordering::SeqCst);

        let shutdown = self.shutdown_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        self.shared.go_offline();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Client with no transport; frames sent through it land on the returned
    /// receiver and inbound frames are fed with [`inject`](Self::inject).
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let client = Self {
            shared: Arc::new(Shared::new()),
            outgoing,
            shutdown_tx: Mutex::new(None),
            task: None,
            disposed: AtomicBool::new(false),
        };
        (client, outgoing_rx)
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, text: &str) {
        self.shared.handle_text(text);
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Connection loop with reconnection.
async fn connection_loop(
    url: Url,
    reconnect: bool,
    shared: Arc<Shared>,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut attempt = 0u32;

    loop {
        if attempt > 0 {
            shared
                .status
                .send_replace(ConnectionStatus::Reconnecting { attempt });
        } else {
            shared.status.send_replace(ConnectionStatus::Connecting);
        }
        info!("Connecting to signaling server: {}", url);

        let connected = tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                info!("Signaling shutdown requested while connecting");
                shared.status.send_replace(ConnectionStatus::Disconnected);
                return;
            }
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((ws_stream, _)) => {
                info!("Signaling connected");
                attempt = 0;
                shared.status.send_replace(ConnectionStatus::Connected);

                let (mut write, mut read) = ws_stream.split();

                loop {
                    tokio::select! {
                        biased;

                        _ = &mut shutdown_rx => {
                            info!("Signaling shutdown requested");
                            let _ = write.send(Message::Close(None)).await;
                            shared.go_offline();
                            shared.status.send_replace(ConnectionStatus::Disconnected);
                            return;
                        }

                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                                Some(Ok(Message::Ping(data))) => {
                                    if let Err(e) = write.send(Message::Pong(data)).await {
                                        warn!("Failed to send pong: {}", e);
                                    }
                                }
                                Some(Ok(Message::Close(_))) => {
                                    info!("Relay closed connection");
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!("Signaling socket error: {}", e);
                                    break;
                                }
                                None => {
                                    info!("Signaling stream ended");
                                    break;
                                }
                                _ => {}
                            }
                        }

                        frame = outgoing_rx.recv() => {
                            let Some(frame) = frame else {
                                info!("Signaling client dropped");
                                let _ = write.send(Message::Close(None)).await;
                                shared.go_offline();
                                shared.status.send_replace(ConnectionStatus::Disconnected);
                                return;
                            };
                            if let Err(e) = write.send(Message::Text(frame.into())).await {
                                error!("Failed to send signaling frame: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to connect to signaling server: {}", e);
            }
        }

        // The relay is unreachable until it reports otherwise.
        shared.go_offline();
        shared.status.send_replace(ConnectionStatus::Disconnected);

        if !reconnect {
            return;
        }

        attempt += 1;
        let backoff = backoff(attempt);
        info!("Reconnecting in {:?} (attempt {})", backoff, attempt);

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = &mut shutdown_rx => {
                info!("Shutdown during reconnect backoff");
                return;
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    std::cmp::min(Duration::from_secs(2u64.pow(attempt.min(5))), MAX_BACKOFF)
}
