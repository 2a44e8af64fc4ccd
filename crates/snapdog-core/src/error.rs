//! Error taxonomy shared by every crate in the workspace.
//!
//! Expected failures are values, not panics.  Engines and transports return
//! [`Result`]; only the configuration pass at startup is allowed to abort the
//! process, and it does so by bubbling a [`Error::Config`] up to `main`.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Missing, out-of-range or unparsable configuration.  Fatal at startup.
    #[error("config key {key}: {reason}")]
    Config { key: String, reason: String },

    /// Connect/send failure or unexpected close on a transport.
    #[error("transport: {0}")]
    Transport(String),

    /// Operation did not complete within its policy window.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed frame or payload on the wire.
    #[error("protocol: {0}")]
    Protocol(String),

    /// DPT encode/decode failure or mismatch against a configured mapping.
    #[error("dpt: {0}")]
    Dpt(String),

    /// Command targets an unknown zone, client or group address.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation is not legal in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Cooperative cancellation.  Never surfaced to users as an error.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation.  Always logged with full context.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Config {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transport(reason: impl fmt::Display) -> Self {
        Self::Transport(reason.to_string())
    }

    pub fn timeout(what: impl fmt::Display) -> Self {
        Self::Timeout(what.to_string())
    }

    pub fn protocol(reason: impl fmt::Display) -> Self {
        Self::Protocol(reason.to_string())
    }

    pub fn dpt(reason: impl fmt::Display) -> Self {
        Self::Dpt(reason.to_string())
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn invalid_state(reason: impl fmt::Display) -> Self {
        Self::InvalidState(reason.to_string())
    }

    pub fn not_seekable() -> Self {
        Self::InvalidState("stream is not seekable".to_string())
    }

    pub fn internal(reason: impl fmt::Display) -> Self {
        Self::Internal(reason.to_string())
    }

    /// Short machine-readable kind label, used on the MQTT error topic.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
            Self::Dpt(_) => "dpt",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status the API layer maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Config { .. } => 400,
            Self::NotFound(_) => 404,
            Self::Timeout(_) => 504,
            Self::InvalidState(_) => 409,
            Self::Transport(_) => 503,
            Self::Dpt(_) | Self::Protocol(_) => 400,
            Self::Cancelled => 503,
            Self::Internal(_) => 500,
        }
    }

    /// True for failures worth another attempt under a retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::not_found("zone 9").http_status(), 404);
        assert_eq!(Error::not_seekable().http_status(), 409);
        assert_eq!(Error::timeout("knx read").http_status(), 504);
        assert_eq!(Error::transport("broker gone").http_status(), 503);
        assert_eq!(Error::internal("bug").http_status(), 500);
    }

    #[test]
    fn transient_classification() {
        assert!(Error::transport("x").is_transient());
        assert!(Error::timeout("x").is_transient());
        assert!(!Error::not_found("x").is_transient());
        assert!(!Error::Cancelled.is_transient());
    }
}
