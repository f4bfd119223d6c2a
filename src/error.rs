//! Error types for speech evaluation sessions

use thiserror::Error;

/// Errors that can occur while setting up or running an evaluation session.
///
/// `Config` is returned synchronously from constructors. The other variants
/// are delivered through [`crate::EvaluationCallback::on_error`] and always
/// end the session.
#[derive(Debug, Clone, Error)]
pub enum IseError {
    /// Missing credentials, empty reference text or app id, bad config values
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport reported an error or the connection URL could not be obtained
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-zero status code
    #[error("service error {code}: {message}")]
    Service {
        code: i64,
        message: String,
        /// The original response payload, untouched
        raw: serde_json::Value,
    },

    /// The service broke the frame protocol (e.g. finished before any audio was sent)
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl IseError {
    /// Raw service payload, if this error came from a service response.
    pub fn raw_payload(&self) -> Option<&serde_json::Value> {
        match self {
            IseError::Service { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IseError::Config("appId must not be empty".to_string());
        assert!(err.to_string().contains("appId"));

        let err = IseError::Transport("connection reset".to_string());
        assert!(err.to_string().contains("connection reset"));

        let err = IseError::Service {
            code: 10163,
            message: "param validate error".to_string(),
            raw: serde_json::json!({ "code": 10163 }),
        };
        assert_eq!(err.to_string(), "service error 10163: param validate error");
    }

    #[test]
    fn test_raw_payload_only_for_service_errors() {
        let raw = serde_json::json!({ "code": 68675, "message": "audio error" });
        let err = IseError::Service {
            code: 68675,
            message: "audio error".to_string(),
            raw: raw.clone(),
        };
        assert_eq!(err.raw_payload(), Some(&raw));
        assert!(IseError::Protocol("x".to_string()).raw_payload().is_none());
    }
}
