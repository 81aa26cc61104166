//! Audio route state machine.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{
    AudioDevice, AudioDeviceChangeListener, AudioDeviceKind, AudioManagerAdapter, DevicePriority,
};

/// Route lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteState {
    #[default]
    Stopped,
    Started,
    Activated,
}

/// Picks and activates the call audio device.
///
/// Not thread-safe; see [`AudioRouteHandler`](super::AudioRouteHandler).
pub struct AudioSwitch {
    manager: Arc<dyn AudioManagerAdapter>,
    priority: DevicePriority,
    state: RouteState,
    listener: Option<AudioDeviceChangeListener>,
    devices: Vec<AudioDevice>,
    selected: Option<AudioDevice>,
    user_selected: Option<AudioDevice>,
    wired_headset_available: bool,
    bluetooth_headset: Option<AudioDevice>,
}

impl AudioSwitch {
    pub fn new(manager: Arc<dyn AudioManagerAdapter>, priority: DevicePriority) -> Self {
        Self {
            manager,
            priority,
            state: RouteState::Stopped,
            listener: None,
            devices: Vec::new(),
            selected: None,
            user_selected: None,
            wired_headset_available: false,
            bluetooth_headset: None,
        }
    }

    pub const fn state(&self) -> RouteState {
        self.state
    }

    /// Available devices in priority order.
    pub fn devices(&self) -> &[AudioDevice] {
        &self.devices
    }

    pub const fn selected_device(&self) -> Option<&AudioDevice> {
        self.selected.as_ref()
    }

    /// Enumerate devices and register `listener` for later changes.
    /// Does nothing unless stopped.
    pub fn start(&mut self, listener: AudioDeviceChangeListener) {
        debug!(state = ?self.state, "[start]");
        if self.state == RouteState::Stopped {
            self.listener = Some(listener);
            self.enumerate_devices();
            self.state = RouteState::Started;
        }
    }

    pub fn stop(&mut self) {
        debug!(state = ?self.state, "[stop]");
        match self.state {
            RouteState::Activated => {
                self.deactivate();
                self.close_listeners();
            }
            RouteState::Started => self.close_listeners(),
            RouteState::Stopped => {}
        }
    }

    /// Take over call audio and route it to the selected device. When already
    /// activated, routing is applied again.
    ///
    /// # Panics
    ///
    /// Panics when the switch is stopped.
    pub fn activate(&mut self) {
        debug!(state = ?self.state, "[activate]");
        match self.state {
            RouteState::Started => {
                self.manager.cache_audio_state();
                // Calls always start unmuted.
                if let Err(e) = self.manager.mute(false) {
                    warn!("Failed to unmute microphone: {}", e);
                }
                if let Err(e) = self.manager.set_audio_focus() {
                    warn!("Failed to request audio focus: {}", e);
                }
                self.route_selected();
                self.state = RouteState::Activated;
            }
            RouteState::Activated => self.route_selected(),
            RouteState::Stopped => panic!("AudioSwitch::activate called while stopped"),
        }
    }

    /// Restore the audio state cached by [`activate`](Self::activate).
    pub fn deactivate(&mut self) {
        debug!(state = ?self.state, "[deactivate]");
        if self.state == RouteState::Activated {
            if let Err(e) = self.manager.restore_audio_state() {
                warn!("Failed to restore audio state: {}", e);
            }
            self.state = RouteState::Started;
        }
    }

    /// Pin `device` as the user's choice. `None` returns to automatic
    /// selection.
    pub fn select_device(&mut self, device: Option<AudioDevice>) {
        debug!(?device, "[selectDevice]");
        if self.selected != device {
            self.user_selected = device;
            self.enumerate_devices();
        }
    }

    pub fn set_wired_headset_available(&mut self, available: bool) {
        debug!(available, "[onWiredHeadsetChanged]");
        self.wired_headset_available = available;
        self.refresh();
    }

    pub fn bluetooth_headset_connected(&mut self, name: Option<String>) {
        debug!(?name, "[onBluetoothHeadsetConnected]");
        self.bluetooth_headset = Some(AudioDevice::BluetoothHeadset { name });
        self.refresh();
    }

    pub fn bluetooth_headset_disconnected(&mut self) {
        debug!("[onBluetoothHeadsetDisconnected]");
        self.bluetooth_headset = None;
        self.refresh();
    }

    fn refresh(&mut self) {
        if self.state != RouteState::Stopped {
            self.enumerate_devices();
        }
    }

    fn enumerate_devices(&mut self) {
        let old_devices = self.devices.clone();
        let old_selected = self.selected.clone();

        self.add_available_devices();

        if !self.user_selected_device_present() {
            self.user_selected = None;
        }

        self.selected = self
            .user_selected
            .clone()
            .or_else(|| self.devices.first().cloned());
        trace!(selected = ?self.selected, "[enumerateDevices]");

        if self.state == RouteState::Activated {
            self.activate();
        }

        // Compare names too, so a different Bluetooth headset counts as a change.
        let changed = !same_devices(&old_devices, &self.devices)
            || !same_device(old_selected.as_ref(), self.selected.as_ref());
        if changed {
            if let Some(listener) = &self.listener {
                listener(&self.devices, self.selected.as_ref());
            }
        }
    }

    fn add_available_devices(&mut self) {
        self.devices.clear();
        for kind in self.priority.kinds() {
            let device = match kind {
                AudioDeviceKind::Bluetooth => self.bluetooth_headset.clone(),
                AudioDeviceKind::WiredHeadset => {
                    self.wired_headset_available.then_some(AudioDevice::WiredHeadset)
                }
                AudioDeviceKind::Earpiece => (self.manager.has_earpiece()
                    && !self.wired_headset_available)
                    .then_some(AudioDevice::Earpiece),
                AudioDeviceKind::Speakerphone => self
                    .manager
                    .has_speakerphone()
                    .then_some(AudioDevice::Speakerphone),
            };
            if let Some(device) = device {
                self.devices.push(device);
            }
        }
    }

    /// Whether the user's choice survived enumeration. A Bluetooth choice
    /// follows whichever headset is now connected.
    fn user_selected_device_present(&mut self) -> bool {
        let Some(user_selected) = &self.user_selected else {
            return false;
        };
        let current = self
            .devices
            .iter()
            .find(|device| device.kind() == user_selected.kind())
            .cloned();
        match current {
            Some(device) => {
                self.user_selected = Some(device);
                true
            }
            None => false,
        }
    }

    fn route_selected(&self) {
        let Some(device) = &self.selected else {
            return;
        };
        debug!(%device, "[activate] routing");
        let speakerphone = device.kind() == AudioDeviceKind::Speakerphone;
        if let Err(e) = self.manager.enable_speakerphone(speakerphone) {
            warn!(%device, "Failed to route audio: {}", e);
        }
    }

    fn close_listeners(&mut self) {
        self.listener = None;
        self.state = RouteState::Stopped;
    }
}

fn same_device(a: Option<&AudioDevice>, b: Option<&AudioDevice>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b && a.name() == b.name(),
        (None, None) => true,
        _ => false,
    }
}

fn same_devices(a: &[AudioDevice], b: &[AudioDevice]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| same_device(Some(a), Some(b)))
}
