//! Platform audio adapter.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::AudioRouteError;

/// Platform audio mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    #[default]
    Normal,
    /// Tuned for two-way voice.
    InCommunication,
}

/// Audio focus notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFocusChange {
    Gain,
    GainTransient,
    GainTransientExclusive,
    GainTransientMayDuck,
    Loss,
    LossTransient,
    LossTransientCanDuck,
}

impl fmt::Display for AudioFocusChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gain => "AUDIOFOCUS_GAIN",
            Self::GainTransient => "AUDIOFOCUS_GAIN_TRANSIENT",
            Self::GainTransientExclusive => "AUDIOFOCUS_GAIN_TRANSIENT_EXCLUSIVE",
            Self::GainTransientMayDuck => "AUDIOFOCUS_GAIN_TRANSIENT_MAY_DUCK",
            Self::Loss => "AUDIOFOCUS_LOSS",
            Self::LossTransient => "AUDIOFOCUS_LOSS_TRANSIENT",
            Self::LossTransientCanDuck => "AUDIOFOCUS_LOSS_TRANSIENT_CAN_DUCK",
        };
        f.write_str(name)
    }
}

/// Receives audio focus changes.
pub type AudioFocusListener = Arc<dyn Fn(AudioFocusChange) + Send + Sync>;

/// Platform audio operations used by [`AudioSwitch`](super::AudioSwitch).
///
/// Only ever called from the audio route thread.
pub trait AudioManagerAdapter: Send + Sync {
    fn has_earpiece(&self) -> bool;

    fn has_speakerphone(&self) -> bool;

    /// Request audio focus and switch to [`AudioMode::InCommunication`].
    fn set_audio_focus(&self) -> Result<(), AudioRouteError>;

    fn enable_speakerphone(&self, enable: bool) -> Result<(), AudioRouteError>;

    fn mute(&self, mute: bool) -> Result<(), AudioRouteError>;

    /// Remember mode, microphone mute and speakerphone state.
    fn cache_audio_state(&self);

    /// Put back the cached state and release audio focus.
    fn restore_audio_state(&self) -> Result<(), AudioRouteError>;
}

#[derive(Debug, Clone, Copy, Default)]
struct SavedAudioState {
    mode: AudioMode,
    microphone_muted: bool,
    speakerphone_on: bool,
}

#[derive(Debug, Default)]
struct DesktopAudioState {
    mode: AudioMode,
    microphone_muted: bool,
    speakerphone_on: bool,
    focused: bool,
    saved: SavedAudioState,
}

/// In-process audio state for desktop hosts.
///
/// Desktops have no earpiece. Speakerphone availability comes from the
/// default output device when built with the `cpal` feature.
pub struct DesktopAudioManager {
    state: Mutex<DesktopAudioState>,
    focus_listener: AudioFocusListener,
}

impl DesktopAudioManager {
    pub fn new() -> Self {
        Self::with_focus_listener(Arc::new(|change| {
            info!("[onAudioFocusChange] focusChange: {}", change);
        }))
    }

    pub fn with_focus_listener(focus_listener: AudioFocusListener) -> Self {
        Self {
            state: Mutex::new(DesktopAudioState::default()),
            focus_listener,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, DesktopAudioState>, AudioRouteError> {
        self.state
            .lock()
            .map_err(|_| AudioRouteError::Platform("audio state lock poisoned".into()))
    }

    pub fn mode(&self) -> AudioMode {
        self.state().map(|s| s.mode).unwrap_or_default()
    }

    pub fn is_microphone_muted(&self) -> bool {
        self.state().map(|s| s.microphone_muted).unwrap_or_default()
    }

    pub fn is_speakerphone_on(&self) -> bool {
        self.state().map(|s| s.speakerphone_on).unwrap_or_default()
    }

    pub fn has_audio_focus(&self) -> bool {
        self.state().map(|s| s.focused).unwrap_or_default()
    }
}

impl Default for DesktopAudioManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioManagerAdapter for DesktopAudioManager {
    fn has_earpiece(&self) -> bool {
        false
    }

    #[cfg(feature = "cpal")]
    fn has_speakerphone(&self) -> bool {
        use cpal::traits::HostTrait;

        cpal::default_host().default_output_device().is_some()
    }

    #[cfg(not(feature = "cpal"))]
    fn has_speakerphone(&self) -> bool {
        true
    }

    fn set_audio_focus(&self) -> Result<(), AudioRouteError> {
        let gained = {
            let mut state = self.state()?;
            let gained = !state.focused;
            state.focused = true;
            state.mode = AudioMode::InCommunication;
            gained
        };
        info!("[setAudioFocus] completed: {}", gained);
        if gained {
            (self.focus_listener)(AudioFocusChange::GainTransient);
        }
        Ok(())
    }

    fn enable_speakerphone(&self, enable: bool) -> Result<(), AudioRouteError> {
        info!("[enableSpeakerphone] enable: {}", enable);
        self.state()?.speakerphone_on = enable;
        Ok(())
    }

    fn mute(&self, mute: bool) -> Result<(), AudioRouteError> {
        info!("[mute] mute: {}", mute);
        self.state()?.microphone_muted = mute;
        Ok(())
    }

    fn cache_audio_state(&self) {
        match self.state() {
            Ok(mut state) => {
                state.saved = SavedAudioState {
                    mode: state.mode,
                    microphone_muted: state.microphone_muted,
                    speakerphone_on: state.speakerphone_on,
                };
                debug!(saved = ?state.saved, "[cacheAudioState]");
            }
            Err(e) => warn!("Failed to cache audio state: {}", e),
        }
    }

    fn restore_audio_state(&self) -> Result<(), AudioRouteError> {
        let released = {
            let mut state = self.state()?;
            let saved = state.saved;
            state.mode = saved.mode;
            state.microphone_muted = saved.microphone_muted;
            state.speakerphone_on = saved.speakerphone_on;
            let released = state.focused;
            state.focused = false;
            debug!(?saved, "[restoreAudioState]");
            released
        };
        if released {
            (self.focus_listener)(AudioFocusChange::Loss);
        }
        Ok(())
    }
}
