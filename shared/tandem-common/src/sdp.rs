//! Session Descriptions
//!
//! Codec names in SDP bodies are upper-cased before a description is applied
//! or sent. Some engines emit lowercase encoding names while others only match
//! the uppercase form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Codec tokens rewritten by [`normalize_codecs`].
const CODEC_TOKENS: [(&str, &str); 3] = [("vp9", "VP9"), ("vp8", "VP8"), ("h264", "H264")];

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

impl FromStr for SdpKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("offer") {
            Ok(Self::Offer)
        } else if s.eq_ignore_ascii_case("answer") {
            Ok(Self::Answer)
        } else {
            Err(ProtocolError::UnknownSdpKind(s.to_string()))
        }
    }
}

/// Capability and media description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    pub kind: SdpKind,
    /// SDP body.
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Copy of this description with codec tokens normalized.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            kind: self.kind,
            sdp: normalize_codecs(&self.sdp),
        }
    }
}

/// Upper-case the VP8, VP9 and H264 codec tokens of an SDP body.
///
/// Idempotent: normalizing an already normalized body returns it unchanged.
#[must_use]
pub fn normalize_codecs(sdp: &str) -> String {
    CODEC_TOKENS
        .iter()
        .fold(sdp.to_string(), |body, (from, to)| body.replace(from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96 98 102\r\n\
        a=rtpmap:96 vp8/90000\r\n\
        a=rtpmap:98 vp9/90000\r\n\
        a=rtpmap:102 h264/90000\r\n\
        a=rtpmap:111 opus/48000/2\r\n";

    #[test]
    fn upper_cases_video_codecs() {
        let normalized = normalize_codecs(SDP);
        assert!(normalized.contains("a=rtpmap:96 VP8/90000"));
        assert!(normalized.contains("a=rtpmap:98 VP9/90000"));
        assert!(normalized.contains("a=rtpmap:102 H264/90000"));
        // Audio codecs are left alone.
        assert!(normalized.contains("a=rtpmap:111 opus/48000/2"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_codecs(SDP);
        let twice = normalize_codecs(&once);
        assert_eq!(once, twice);

        let description = SessionDescription::answer(SDP).normalized();
        assert_eq!(description.normalized(), description);
    }

    #[test]
    fn normalized_keeps_kind() {
        let description = SessionDescription::offer("a=rtpmap:96 vp8/90000");
        let normalized = description.normalized();
        assert_eq!(normalized.kind, SdpKind::Offer);
        assert_eq!(normalized.sdp, "a=rtpmap:96 VP8/90000");
    }

    #[test]
    fn sdp_kind_from_str() {
        assert_eq!("offer".parse::<SdpKind>(), Ok(SdpKind::Offer));
        assert_eq!("ANSWER".parse::<SdpKind>(), Ok(SdpKind::Answer));
        assert!("pranswer".parse::<SdpKind>().is_err());
    }
}
