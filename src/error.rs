//! Error taxonomy for the session manager
//!
//! Configuration and input errors are returned directly from the call that
//! caused them. Everything that happens asynchronously (policy attachment,
//! endpoint lookup, transport construction, per-message decoding) is turned
//! into an `Error` event instead, carrying [`SessionError::event_detail`].

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::control_plane::ControlPlaneError;
use crate::credentials::CredentialError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No valid credential provided")]
    InvalidCredential,

    #[error("No region could be resolved")]
    MissingRegion,

    #[error("Transport construction failed: {0}")]
    Construction(#[source] TransportError),

    #[error("Policy attachment failed: {0}")]
    PolicyAttach(#[source] ControlPlaneError),

    #[error("Endpoint lookup failed: {0}")]
    EndpointLookup(#[source] ControlPlaneError),

    #[error("Credential provider failed: {0}")]
    CredentialProvider(#[from] CredentialError),

    #[error("Not connected: no transport exists")]
    NotConnected,

    #[error("Payload decode failed on topic {topic}: {source}")]
    PayloadDecode {
        topic: String,
        #[source]
        source: CodecError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl SessionError {
    pub fn payload_decode<S: Into<String>>(topic: S, source: CodecError) -> Self {
        Self::PayloadDecode {
            topic: topic.into(),
            source,
        }
    }

    /// Text carried by the `Error` event for this failure, with secrets
    /// redacted
    pub fn event_detail(&self) -> String {
        sanitize_detail(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(secret|token|signature|password|credential)[=:]\s*[^\s&,]+")
        .expect("secret pattern is a valid regex")
});

static AMZ_QUERY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(X-Amz-(?:Security-Token|Signature|Credential))=[^&\s]+")
        .expect("query pattern is a valid regex")
});

const MAX_DETAIL_LEN: usize = 500;

/// Redact credential material and cap the length of error text
pub fn sanitize_detail(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = AMZ_QUERY_PATTERN
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_DETAIL_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_DETAIL_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
