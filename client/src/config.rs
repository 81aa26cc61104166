//! Client Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use url::Url;

use crate::audio::{AudioDeviceKind, DevicePriority};
use crate::peer::{FactoryConfig, IceServerConfig, DEFAULT_STATS_INTERVAL_SECS};

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Signaling relay WebSocket URL
    pub signaling_url: Url,

    /// Reconnect to the relay after a dropped connection (default: true)
    pub signaling_reconnect: bool,

    /// WebRTC STUN server
    pub stun_server: String,

    /// WebRTC TURN server (optional)
    pub turn_server: Option<String>,

    /// WebRTC TURN username (optional)
    pub turn_username: Option<String>,

    /// WebRTC TURN credential (optional)
    pub turn_credential: Option<String>,

    /// Audio device kinds to prefer, moved ahead of the default order
    pub preferred_audio_devices: Vec<AudioDeviceKind>,

    /// Seconds between connection statistics reports (default: 10)
    pub stats_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let signaling_url = lookup("SIGNALING_SERVER_URL")
            .context("SIGNALING_SERVER_URL must be set")?;
        let signaling_url = parse_signaling_url(&signaling_url)?;

        let preferred_audio_devices = match lookup("PREFERRED_AUDIO_DEVICES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|kind| !kind.is_empty())
                .map(str::parse)
                .collect::<Result<Vec<AudioDeviceKind>, _>>()
                .context("Invalid PREFERRED_AUDIO_DEVICES")?,
            None => Vec::new(),
        };
        DevicePriority::new(&preferred_audio_devices)
            .context("Invalid PREFERRED_AUDIO_DEVICES")?;

        Ok(Self {
            signaling_url,
            signaling_reconnect: lookup("SIGNALING_RECONNECT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            stun_server: lookup("STUN_SERVER")
                .unwrap_or_else(|| "stun:stun.l.google.com:19302".into()),
            turn_server: lookup("TURN_SERVER"),
            turn_username: lookup("TURN_USERNAME"),
            turn_credential: lookup("TURN_CREDENTIAL"),
            preferred_audio_devices,
            stats_interval_secs: lookup("STATS_INTERVAL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_STATS_INTERVAL_SECS),
        })
    }

    /// Check if TURN is configured.
    #[must_use]
    pub const fn has_turn(&self) -> bool {
        self.turn_server.is_some()
    }

    /// STUN server first, then TURN when configured.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers = vec![IceServerConfig {
            urls: vec![self.stun_server.clone()],
            username: None,
            credential: None,
        }];
        if let Some(turn) = &self.turn_server {
            servers.push(IceServerConfig {
                urls: vec![turn.clone()],
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }

    /// Audio device priority with the preferred kinds in front.
    pub fn device_priority(&self) -> DevicePriority {
        // Validated in `from_lookup`; a hand-built config with duplicates
        // falls back to the default order.
        DevicePriority::new(&self.preferred_audio_devices).unwrap_or_default()
    }

    /// Factory configuration for this client.
    pub fn factory_config(&self) -> FactoryConfig {
        FactoryConfig {
            ice_servers: self.ice_servers(),
            stats_interval: Duration::from_secs(self.stats_interval_secs),
            ..FactoryConfig::default()
        }
    }

    /// Create a default configuration for testing against a local relay.
    #[cfg(test)]
    pub(crate) fn default_for_test() -> Self {
        Self {
            signaling_url: Url::parse("ws://127.0.0.1:8080/rtc").unwrap(),
            signaling_reconnect: false,
            stun_server: "stun:stun.l.google.com:19302".into(),
            turn_server: None,
            turn_username: None,
            turn_credential: None,
            preferred_audio_devices: Vec::new(),
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
        }
    }
}

/// Parse the relay URL, accepting http(s) as an alias for ws(s).
fn parse_signaling_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("Invalid SIGNALING_SERVER_URL: {raw}"))?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => bail!("SIGNALING_SERVER_URL must use ws or wss, got {other}"),
    };
    if let Some(scheme) = scheme {
        if url.set_scheme(scheme).is_err() {
            bail!("Cannot use {scheme} for SIGNALING_SERVER_URL");
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[("SIGNALING_SERVER_URL", "ws://relay.local:8080/rtc")]).unwrap();
        assert_eq!(config.signaling_url.as_str(), "ws://relay.local:8080/rtc");
        assert!(config.signaling_reconnect);
        assert_eq!(config.stun_server, "stun:stun.l.google.com:19302");
        assert!(!config.has_turn());
        assert_eq!(config.stats_interval_secs, 10);
        assert_eq!(config.device_priority(), DevicePriority::default());
        assert_eq!(config.ice_servers().len(), 1);
    }

    #[test]
    fn relay_url_is_required() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("SIGNALING_SERVER_URL"));
    }

    #[test]
    fn http_urls_become_websocket_urls() {
        let config = load(&[("SIGNALING_SERVER_URL", "https://relay.example.com/rtc")]).unwrap();
        assert_eq!(config.signaling_url.scheme(), "wss");

        let config = load(&[("SIGNALING_SERVER_URL", "http://10.0.2.2:8080/rtc")]).unwrap();
        assert_eq!(config.signaling_url.as_str(), "ws://10.0.2.2:8080/rtc");

        assert!(load(&[("SIGNALING_SERVER_URL", "ftp://relay")]).is_err());
        assert!(load(&[("SIGNALING_SERVER_URL", "not a url")]).is_err());
    }

    #[test]
    fn turn_server_appended() {
        let config = load(&[
            ("SIGNALING_SERVER_URL", "ws://relay"),
            ("TURN_SERVER", "turn:turn.example.com:3478"),
            ("TURN_USERNAME", "alice"),
            ("TURN_CREDENTIAL", "secret"),
        ])
        .unwrap();

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(servers[1].username.as_deref(), Some("alice"));
        assert_eq!(config.factory_config().ice_servers, servers);
    }

    #[test]
    fn preferred_audio_devices() {
        let config = load(&[
            ("SIGNALING_SERVER_URL", "ws://relay"),
            ("PREFERRED_AUDIO_DEVICES", "speakerphone, earpiece"),
        ])
        .unwrap();
        assert_eq!(
            config.device_priority().kinds(),
            &[
                AudioDeviceKind::Speakerphone,
                AudioDeviceKind::Earpiece,
                AudioDeviceKind::Bluetooth,
                AudioDeviceKind::WiredHeadset,
            ]
        );

        assert!(load(&[
            ("SIGNALING_SERVER_URL", "ws://relay"),
            ("PREFERRED_AUDIO_DEVICES", "earpiece,hdmi"),
        ])
        .is_err());
        assert!(load(&[
            ("SIGNALING_SERVER_URL", "ws://relay"),
            ("PREFERRED_AUDIO_DEVICES", "earpiece,earpiece"),
        ])
        .is_err());
    }

    #[test]
    fn numeric_and_flag_overrides() {
        let config = load(&[
            ("SIGNALING_SERVER_URL", "ws://relay"),
            ("STATS_INTERVAL_SECS", "3"),
            ("SIGNALING_RECONNECT", "false"),
        ])
        .unwrap();
        assert_eq!(config.stats_interval_secs, 3);
        assert!(!config.signaling_reconnect);
        assert_eq!(
            config.factory_config().stats_interval,
            Duration::from_secs(3)
        );

        let config = load(&[
            ("SIGNALING_SERVER_URL", "ws://relay"),
            ("STATS_INTERVAL_SECS", "soon"),
        ])
        .unwrap();
        assert_eq!(config.stats_interval_secs, 10);
    }
}
