//! Audio Routing
//!
//! Discovers call audio devices, picks one by priority or user choice, and
//! routes audio to it while a call is active.
//!
//! [`AudioSwitch`] is not thread-safe. [`AudioRouteHandler`] owns it on a
//! dedicated thread and every operation is posted there.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod handler;
mod manager;
pub(crate) mod switch;

pub use handler::{AudioRouteHandler, RouteSnapshot};
pub use manager::{
    AudioFocusChange, AudioFocusListener, AudioManagerAdapter, AudioMode, DesktopAudioManager,
};
pub use switch::{AudioSwitch, RouteState};

/// Audio routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioRouteError {
    #[error("Device listed more than once: {0}")]
    DuplicateDevice(AudioDeviceKind),
    #[error("Unknown audio device: {0}")]
    UnknownDevice(String),
    #[error("Audio platform error: {0}")]
    Platform(String),
    #[error("Audio route handler stopped")]
    HandlerStopped,
}

/// Device classes, used for priorities and presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioDeviceKind {
    Bluetooth,
    WiredHeadset,
    Earpiece,
    Speakerphone,
}

impl AudioDeviceKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Bluetooth => "bluetooth",
            Self::WiredHeadset => "wired_headset",
            Self::Earpiece => "earpiece",
            Self::Speakerphone => "speakerphone",
        }
    }
}

impl fmt::Display for AudioDeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioDeviceKind {
    type Err = AudioRouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        DevicePriority::DEFAULT
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AudioRouteError::UnknownDevice(s.to_string()))
    }
}

/// An audio device a call can be routed to.
///
/// Devices compare by kind only, so every Bluetooth headset is the same
/// device for selection purposes.
#[derive(Debug, Clone, Eq)]
pub enum AudioDevice {
    BluetoothHeadset { name: Option<String> },
    WiredHeadset,
    Earpiece,
    Speakerphone,
}

impl AudioDevice {
    pub const fn kind(&self) -> AudioDeviceKind {
        match self {
            Self::BluetoothHeadset { .. } => AudioDeviceKind::Bluetooth,
            Self::WiredHeadset => AudioDeviceKind::WiredHeadset,
            Self::Earpiece => AudioDeviceKind::Earpiece,
            Self::Speakerphone => AudioDeviceKind::Speakerphone,
        }
    }

    /// Human readable name.
    pub fn name(&self) -> &str {
        match self {
            Self::BluetoothHeadset { name } => name.as_deref().unwrap_or("Bluetooth"),
            Self::WiredHeadset => "Wired Headset",
            Self::Earpiece => "Earpiece",
            Self::Speakerphone => "Speakerphone",
        }
    }
}

impl PartialEq for AudioDevice {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind()
    }
}

impl fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Called with the full device list and the selected device whenever either
/// changes.
pub type AudioDeviceChangeListener =
    Arc<dyn Fn(&[AudioDevice], Option<&AudioDevice>) + Send + Sync>;

/// Ordered device preference without duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePriority(Vec<AudioDeviceKind>);

impl DevicePriority {
    pub const DEFAULT: [AudioDeviceKind; 4] = [
        AudioDeviceKind::Bluetooth,
        AudioDeviceKind::WiredHeadset,
        AudioDeviceKind::Earpiece,
        AudioDeviceKind::Speakerphone,
    ];

    /// Move `preferred` to the front of the default order, keeping the
    /// relative order of the remaining kinds.
    pub fn new(preferred: &[AudioDeviceKind]) -> Result<Self, AudioRouteError> {
        for (i, kind) in preferred.iter().enumerate() {
            if preferred[..i].contains(kind) {
                return Err(AudioRouteError::DuplicateDevice(*kind));
            }
        }

        let mut order = preferred.to_vec();
        order.extend(
            Self::DEFAULT
                .into_iter()
                .filter(|kind| !preferred.contains(kind)),
        );
        Ok(Self(order))
    }

    pub fn kinds(&self) -> &[AudioDeviceKind] {
        &self.0
    }
}

impl Default for DevicePriority {
    fn default() -> Self {
        Self(Self::DEFAULT.to_vec())
    }
}
