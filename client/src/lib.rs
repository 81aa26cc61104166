//! Tandem Call Core
//!
//! Two-party audio/video calls coordinated through a signaling relay:
//! the relay connection, offer/answer negotiation with candidate buffering,
//! audio device routing, and the session that ties them together.

pub mod audio;
pub mod config;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::Config;
pub use peer::{PeerConnection, PeerConnectionFactory};
pub use session::{CallStatus, SessionError, SessionManager, VideoCapturer};
pub use signaling::SignalingClient;
pub use tandem_common::{SessionState, SignalingCommand};

/// Install the fmt subscriber, filtered by `RUST_LOG`.
///
/// Does nothing if a subscriber is already installed.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_client=debug".into()),
        )
        .try_init();
}
