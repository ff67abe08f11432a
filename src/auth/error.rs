use thiserror::Error;

use crate::error::PairlinkError;

/// Normalized errors for pairing and device-authorization flows.
///
/// Transient variants are absorbed by the polling loop; everything else is
/// terminal for the flow that produced it.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Code expired")]
    Expired,
    /// For callers wrapping an [`AuthEvent::Denied`](super::AuthEvent::Denied)
    /// outcome as an error. The engine reports denial as an event and never
    /// emits this variant itself.
    #[error("Access denied")]
    Denied,
    /// For callers wrapping an
    /// [`AuthEvent::Expired`](super::AuthEvent::Expired) timeout as an error.
    /// The engine reports poll timeouts as events and never emits this
    /// variant itself.
    #[error("Timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("Flow cancelled")]
    Cancelled,
    #[error("Rate limited")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("Server error (status {status})")]
    Server { status: u16 },
    #[error("Rejected by server: {code}{}", detail_suffix(.message))]
    Rejected {
        code: String,
        message: Option<String>,
    },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AuthError {
    /// Whether the failure may clear up on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Server { .. } | Self::RateLimited { .. }
        )
    }

    /// Malformed or unexpected server payloads.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    pub(crate) fn rejected(code: impl Into<String>, message: Option<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message,
        }
    }
}

fn detail_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(" ({m})"))
        .unwrap_or_default()
}

impl From<reqwest::Error> for AuthError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::Protocol(error.to_string());
        }
        Self::Network(error.to_string())
    }
}

impl From<std::io::Error> for AuthError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<toml::de::Error> for AuthError {
    fn from(error: toml::de::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<toml::ser::Error> for AuthError {
    fn from(error: toml::ser::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<AuthError> for PairlinkError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::RateLimited { retry_after_ms } => PairlinkError::RateLimited { retry_after_ms },
            AuthError::Timeout { attempts } => PairlinkError::Timeout { attempts },
            AuthError::Configuration(message) => PairlinkError::Configuration(message),
            other => PairlinkError::Authentication(other.to_string()),
        }
    }
}
