//! Signaling Protocol
//!
//! Text frames exchanged with the relay look like `"<COMMAND> <payload>"`.
//! The command keyword is matched case-insensitively and the payload is the
//! remainder of the frame after the first space.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Separator between the fields of an ICE candidate payload.
pub const ICE_SEPARATOR: char = '$';

/// Call availability as reported by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionState {
    /// Offer and answer have been exchanged.
    Active,
    /// An offer has been sent, the session is being created.
    Creating,
    /// Both endpoints are connected and a call can be started.
    Ready,
    /// Fewer than two endpoints are connected to the relay.
    Impossible,
    /// The relay is unreachable.
    #[default]
    Offline,
}

impl SessionState {
    /// All states, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Active,
        Self::Creating,
        Self::Ready,
        Self::Impossible,
        Self::Offline,
    ];

    /// Canonical name used on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Creating => "Creating",
            Self::Ready => "Ready",
            Self::Impossible => "Impossible",
            Self::Offline => "Offline",
        }
    }

    /// Whether a call may be started from this state.
    #[must_use]
    pub const fn may_start_call(&self) -> bool {
        matches!(self, Self::Ready | Self::Creating)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtocolError::UnknownState(s.to_string()))
    }
}

/// Signaling command keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalingCommand {
    /// Session state update from the relay.
    State,
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// ICE candidate.
    Ice,
}

impl SignalingCommand {
    const ALL: [Self; 4] = [Self::State, Self::Offer, Self::Answer, Self::Ice];

    /// Keyword used on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::State => "STATE",
            Self::Offer => "OFFER",
            Self::Answer => "ANSWER",
            Self::Ice => "ICE",
        }
    }
}

impl fmt::Display for SignalingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalingCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtocolError::UnknownCommand(s.to_string()))
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingFrame {
    /// Authoritative session state from the relay.
    State(SessionState),
    /// Negotiation command (offer, answer or ICE candidate) with its payload.
    Command {
        command: SignalingCommand,
        payload: String,
    },
}

impl SignalingFrame {
    /// Decode a relay text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let (keyword, payload) = text.split_once(' ').unwrap_or((text, ""));

        match keyword.parse::<SignalingCommand>()? {
            SignalingCommand::State => payload.trim().parse().map(Self::State),
            command => Ok(Self::Command {
                command,
                payload: payload.to_string(),
            }),
        }
    }

    /// Encode a command and payload as a single text frame.
    #[must_use]
    pub fn encode(command: SignalingCommand, payload: &str) -> String {
        format!("{command} {payload}")
    }
}

impl fmt::Display for SignalingFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(state) => write!(f, "{} {state}", SignalingCommand::State),
            Self::Command { command, payload } => write!(f, "{command} {payload}"),
        }
    }
}

/// One network path option for reaching the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Media stream identification tag.
    pub sdp_mid: String,
    /// Index of the media description this candidate belongs to.
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    /// The `candidate:` attribute line.
    pub candidate: String,
}

impl IceCandidate {
    /// Create a candidate.
    pub fn new(
        sdp_mid: impl Into<String>,
        sdp_mline_index: u16,
        candidate: impl Into<String>,
    ) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            candidate: candidate.into(),
        }
    }

    /// Encode as an `ICE` frame payload.
    #[must_use]
    pub fn to_payload(&self) -> String {
        format!(
            "{}{ICE_SEPARATOR}{}{ICE_SEPARATOR}{}",
            self.sdp_mid, self.sdp_mline_index, self.candidate
        )
    }

    /// Decode an `ICE` frame payload.
    pub fn from_payload(payload: &str) -> Result<Self> {
        let mut parts = payload.splitn(3, ICE_SEPARATOR);
        let malformed = || ProtocolError::MalformedCandidate(payload.to_string());

        let sdp_mid = parts.next().ok_or_else(malformed)?;
        let sdp_mline_index = parts
            .next()
            .and_then(|index| index.trim().parse::<u16>().ok())
            .ok_or_else(malformed)?;
        let candidate = parts.next().ok_or_else(malformed)?;

        Ok(Self::new(sdp_mid, sdp_mline_index, candidate))
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {}",
            self.sdp_mid, self.sdp_mline_index, self.candidate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_state_frames() {
        assert_eq!(
            SignalingFrame::parse("STATE Ready"),
            Ok(SignalingFrame::State(SessionState::Ready))
        );
        assert_eq!(
            SignalingFrame::parse("state active"),
            Ok(SignalingFrame::State(SessionState::Active))
        );
    }

    #[test]
    fn parses_command_frames() {
        assert_eq!(
            SignalingFrame::parse("OFFER abc"),
            Ok(SignalingFrame::Command {
                command: SignalingCommand::Offer,
                payload: "abc".into(),
            })
        );

        // Payload keeps everything after the first space, including newlines.
        let frame = SignalingFrame::parse("answer v=0\r\no=- 1 2 IN IP4 0.0.0.0").unwrap();
        assert_eq!(
            frame,
            SignalingFrame::Command {
                command: SignalingCommand::Answer,
                payload: "v=0\r\no=- 1 2 IN IP4 0.0.0.0".into(),
            }
        );
    }

    #[test]
    fn command_without_payload() {
        assert_eq!(
            SignalingFrame::parse("ICE"),
            Ok(SignalingFrame::Command {
                command: SignalingCommand::Ice,
                payload: String::new(),
            })
        );
    }

    #[test]
    fn rejects_unknown_frames() {
        assert_eq!(
            SignalingFrame::parse("HELLO world"),
            Err(ProtocolError::UnknownCommand("HELLO".into()))
        );
        assert_eq!(
            SignalingFrame::parse("STATE Sleeping"),
            Err(ProtocolError::UnknownState("Sleeping".into()))
        );
        assert!(SignalingFrame::parse("").is_err());
    }

    #[test]
    fn encodes_frames() {
        assert_eq!(
            SignalingFrame::encode(SignalingCommand::Offer, "sdp"),
            "OFFER sdp"
        );
        assert_eq!(
            SignalingFrame::State(SessionState::Impossible).to_string(),
            "STATE Impossible"
        );
    }

    #[test]
    fn session_state_call_gate() {
        assert!(SessionState::Ready.may_start_call());
        assert!(SessionState::Creating.may_start_call());
        assert!(!SessionState::Active.may_start_call());
        assert!(!SessionState::Impossible.may_start_call());
        assert!(!SessionState::Offline.may_start_call());
        assert_eq!(SessionState::default(), SessionState::Offline);
    }

    #[test]
    fn ice_candidate_payload() {
        let candidate = IceCandidate::new(
            "0",
            0,
            "candidate:1 1 udp 2130706431 192.168.1.4 54321 typ host",
        );
        let payload = candidate.to_payload();
        assert_eq!(
            payload,
            "0$0$candidate:1 1 udp 2130706431 192.168.1.4 54321 typ host"
        );
        assert_eq!(IceCandidate::from_payload(&payload), Ok(candidate));
    }

    #[test]
    fn ice_candidate_text_may_contain_separator() {
        let parsed = IceCandidate::from_payload("video$1$candidate:a$b").unwrap();
        assert_eq!(parsed.sdp_mid, "video");
        assert_eq!(parsed.sdp_mline_index, 1);
        assert_eq!(parsed.candidate, "candidate:a$b");
    }

    #[test]
    fn malformed_ice_candidate() {
        assert!(IceCandidate::from_payload("0$x$candidate").is_err());
        assert!(IceCandidate::from_payload("0$1").is_err());
        assert!(IceCandidate::from_payload("").is_err());
    }

    #[test]
    fn ice_candidate_json_field_names() {
        let candidate = IceCandidate::new("audio", 2, "candidate:x");
        let json = serde_json::to_string(&candidate).unwrap();
        assert!(json.contains("\"sdpMid\":\"audio\""));
        assert!(json.contains("\"sdpMLineIndex\":2"));
    }
}
