//! Audio route thread.
//!
//! Owns the [`AudioSwitch`] on one named thread. Every public method posts a
//! command and returns without waiting for it to run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    AudioDevice, AudioDeviceChangeListener, AudioManagerAdapter, AudioRouteError, AudioSwitch,
    DevicePriority, RouteState,
};

const THREAD_NAME: &str = "audio-route";

/// Route state as seen from the audio route thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub state: RouteState,
    pub devices: Vec<AudioDevice>,
    pub selected: Option<AudioDevice>,
}

enum RouteCommand {
    Start { epoch: u64 },
    Stop { epoch: u64 },
    SelectDevice(Option<AudioDevice>),
    WiredHeadset(bool),
    BluetoothConnected(Option<String>),
    BluetoothDisconnected,
    MuteMicrophone(bool),
    Snapshot(oneshot::Sender<RouteSnapshot>),
    Shutdown,
}

/// Serializes all audio routing onto a dedicated thread.
pub struct AudioRouteHandler {
    commands: mpsc::UnboundedSender<RouteCommand>,
    /// Bumped by every stop; a queued start/stop with an older epoch is
    /// skipped, so a stop cancels whatever start/stop is still pending.
    epoch: Arc<AtomicU64>,
    thread: JoinHandle<()>,
}

impl AudioRouteHandler {
    pub fn new(
        manager: Arc<dyn AudioManagerAdapter>,
        priority: DevicePriority,
        listener: Option<AudioDeviceChangeListener>,
    ) -> Result<Self, AudioRouteError> {
        let (commands, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));

        let listener = listener.unwrap_or_else(|| {
            Arc::new(|_: &[AudioDevice], selected: Option<&AudioDevice>| {
                info!("[onAudioDeviceChange] selectedAudioDevice: {:?}", selected);
            })
        });
        let worker = RouteWorker {
            manager,
            priority,
            listener,
            epoch: epoch.clone(),
            switch: None,
            wired_headset_available: false,
            bluetooth_headset: None,
        };

        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || worker.run(rx))
            .map_err(|e| AudioRouteError::Platform(e.to_string()))?;

        Ok(Self {
            commands,
            epoch,
            thread,
        })
    }

    /// Whether the route thread is still processing commands.
    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    fn post(&self, command: RouteCommand) {
        if self.commands.send(command).is_err() {
            warn!("Audio route thread is gone, command dropped");
        }
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Create, start and activate the switch, unless one is already running.
    ///
    /// Does not cancel a pending stop: `stop(); start()` restarts the route.
    pub fn start(&self) {
        debug!("[start]");
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.post(RouteCommand::Start { epoch });
    }

    /// Stop and drop the switch, cancelling any start not yet run.
    pub fn stop(&self) {
        debug!("[stop]");
        let epoch = self.next_epoch();
        self.post(RouteCommand::Stop { epoch });
    }

    pub fn select_device(&self, device: Option<AudioDevice>) {
        self.post(RouteCommand::SelectDevice(device));
    }

    pub fn set_wired_headset_available(&self, available: bool) {
        self.post(RouteCommand::WiredHeadset(available));
    }

    pub fn bluetooth_headset_connected(&self, name: Option<String>) {
        self.post(RouteCommand::BluetoothConnected(name));
    }

    pub fn bluetooth_headset_disconnected(&self) {
        self.post(RouteCommand::BluetoothDisconnected);
    }

    /// Mute or unmute the microphone through the platform adapter.
    pub fn set_microphone_muted(&self, muted: bool) {
        self.post(RouteCommand::MuteMicrophone(muted));
    }

    /// Route state once every previously posted command has run.
    pub async fn snapshot(&self) -> Result<RouteSnapshot, AudioRouteError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RouteCommand::Snapshot(tx))
            .map_err(|_| AudioRouteError::HandlerStopped)?;
        rx.await.map_err(|_| AudioRouteError::HandlerStopped)
    }
}

impl Drop for AudioRouteHandler {
    fn drop(&mut self) {
        // Not joined: the thread stops the switch on its own.
        let _ = self.commands.send(RouteCommand::Shutdown);
    }
}

struct RouteWorker {
    manager: Arc<dyn AudioManagerAdapter>,
    priority: DevicePriority,
    listener: AudioDeviceChangeListener,
    epoch: Arc<AtomicU64>,
    switch: Option<AudioSwitch>,
    wired_headset_available: bool,
    bluetooth_headset: Option<Option<String>>,
}

impl RouteWorker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<RouteCommand>) {
        debug!("Audio route thread started");

        while let Some(command) = rx.blocking_recv() {
            match command {
                RouteCommand::Start { epoch } => {
                    if self.is_current(epoch) {
                        self.start();
                    }
                }
                RouteCommand::Stop { epoch } => {
                    if self.is_current(epoch) {
                        self.stop();
                    }
                }
                RouteCommand::SelectDevice(device) => {
                    if let Some(switch) = &mut self.switch {
                        switch.select_device(device);
                    }
                }
                RouteCommand::WiredHeadset(available) => {
                    self.wired_headset_available = available;
                    if let Some(switch) = &mut self.switch {
                        switch.set_wired_headset_available(available);
                    }
                }
                RouteCommand::BluetoothConnected(name) => {
                    self.bluetooth_headset = Some(name.clone());
                    if let Some(switch) = &mut self.switch {
                        switch.bluetooth_headset_connected(name);
                    }
                }
                RouteCommand::BluetoothDisconnected => {
                    self.bluetooth_headset = None;
                    if let Some(switch) = &mut self.switch {
                        switch.bluetooth_headset_disconnected();
                    }
                }
                RouteCommand::MuteMicrophone(muted) => {
                    if let Err(e) = self.manager.mute(muted) {
                        warn!("Failed to set microphone mute: {}", e);
                    }
                }
                RouteCommand::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                RouteCommand::Shutdown => break,
            }
        }

        self.stop();
        debug!("Audio route thread finished");
    }

    fn is_current(&self, epoch: u64) -> bool {
        let current = self.epoch.load(Ordering::SeqCst);
        if epoch != current {
            debug!(epoch, current, "Skipping superseded route command");
        }
        epoch == current
    }

    fn start(&mut self) {
        if self.switch.is_some() {
            debug!("[start] audio switch already running");
            return;
        }

        let mut switch = AudioSwitch::new(self.manager.clone(), self.priority.clone());
        // Presence known before the call started.
        switch.set_wired_headset_available(self.wired_headset_available);
        if let Some(name) = self.bluetooth_headset.clone() {
            switch.bluetooth_headset_connected(name);
        }
        switch.start(self.listener.clone());
        switch.activate();
        info!(selected = ?switch.selected_device(), "Audio route activated");
        self.switch = Some(switch);
    }

    fn stop(&mut self) {
        if let Some(mut switch) = self.switch.take() {
            switch.stop();
            info!("Audio route stopped");
        }
    }

    fn snapshot(&self) -> RouteSnapshot {
        match &self.switch {
            Some(switch) => RouteSnapshot {
                state: switch.state(),
                devices: switch.devices().to_vec(),
                selected: switch.selected_device().cloned(),
            },
            None => RouteSnapshot {
                state: RouteState::Stopped,
                devices: Vec::new(),
                selected: None,
            },
        }
    }
}
