//! Error types shared by the relay, the negotiation endpoints and the RTMP bridge.

use thiserror::Error;

/// Errors raised while routing a signaling frame.
///
/// None of these are ever surfaced to other participants; the connection
/// handler logs them and drops the frame.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed signaling frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("signal `{kind}` has no sessionId")]
    MissingSessionId { kind: String },

    #[error("sender is not joined to session `{session_id}`")]
    NotMember { session_id: String },
}

/// Errors raised by an endpoint while negotiating one media link.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("illegal link transition: {event} while {state}")]
    IllegalTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("signal `{0}` is missing its payload")]
    MissingPayload(String),

    #[error("no link for {0}")]
    NoLink(String),

    #[error("peer backend: {0}")]
    Backend(String),

    #[error("signaling channel closed")]
    ChannelClosed,
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        NegotiationError::Backend(err.to_string())
    }
}

/// Errors returned by the RTMP bridge manager.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Config(String),

    #[error("failed to spawn transcoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("unknown {platform} streamId `{stream_id}`")]
    NotFound { platform: String, stream_id: String },

    #[error("stream `{0}` is not active")]
    NotActive(String),

    #[error("stream `{0}` is not keeping up, chunk rejected")]
    Backpressure(String),

    #[error("chunk of {size} bytes exceeds the {limit} byte limit")]
    ChunkTooLarge { size: usize, limit: usize },
}

impl BridgeError {
    /// HTTP status the bridge routes answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            BridgeError::Config(_) | BridgeError::Spawn(_) | BridgeError::NotActive(_) => 500,
            BridgeError::NotFound { .. } => 404,
            BridgeError::Backpressure(_) => 503,
            BridgeError::ChunkTooLarge { .. } => 413,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_errors_map_to_http_status() {
        let not_found = BridgeError::NotFound {
            platform: "youtube".into(),
            stream_id: "yt-1".into(),
        };
        assert_eq!(not_found.status_code(), 404);
        assert_eq!(BridgeError::NotActive("yt-1".into()).status_code(), 500);
        assert_eq!(BridgeError::Backpressure("yt-1".into()).status_code(), 503);
        assert_eq!(
            not_found.to_string(),
            "unknown youtube streamId `yt-1`"
        );
    }
}
