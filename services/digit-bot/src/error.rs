//! Error taxonomy for the session layer and configuration

use std::time::Duration;

/// Error reported by the remote service inside an `error` envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classify by error code
    pub fn class(&self) -> ProtocolErrorClass {
        match self.code.as_str() {
            "InvalidToken" | "AuthorizationRequired" | "InvalidAppID" | "DisabledClient" => {
                ProtocolErrorClass::InvalidCredential
            }
            "RateLimit" | "TooManyRequests" => ProtocolErrorClass::RateLimited,
            "MarketIsClosed" | "TradingDisabled" | "TradingIsDisabled" => {
                ProtocolErrorClass::MarketClosed
            }
            _ => ProtocolErrorClass::Unknown,
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Coarse classes of remote errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorClass {
    InvalidCredential,
    RateLimited,
    MarketClosed,
    Unknown,
}

/// Errors surfaced by the session transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request '{kind}' timed out after {after:?}")]
    RequestTimeout { kind: &'static str, after: Duration },

    #[error("protocol error {0}")]
    Protocol(ProtocolError),

    #[error("transport gave up after {attempts} reconnect attempts")]
    FatalDisconnect { attempts: u32 },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl SessionError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Connection(_) | SessionError::RequestTimeout { .. }
        )
    }

    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            SessionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Configuration problems, fatal at startup
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ValidationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_classes() {
        assert_eq!(
            ProtocolError::new("InvalidToken", "bad").class(),
            ProtocolErrorClass::InvalidCredential
        );
        assert_eq!(
            ProtocolError::new("RateLimit", "slow down").class(),
            ProtocolErrorClass::RateLimited
        );
        assert_eq!(
            ProtocolError::new("MarketIsClosed", "closed").class(),
            ProtocolErrorClass::MarketClosed
        );
        assert_eq!(
            ProtocolError::new("ContractBuyValidationError", "stale").class(),
            ProtocolErrorClass::Unknown
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(SessionError::Connection("reset".to_string()).is_transient());
        assert!(!SessionError::Protocol(ProtocolError::new("X", "y")).is_transient());
    }
}
