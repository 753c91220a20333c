//! Error types for the device lookup gateway
//!
//! Request-path failures are split by stage so every one maps to a distinct,
//! observable outcome: [`IdentityError`] (caller identity), [`TokenError`]
//! (identity-provider token), [`FetchError`] (device-management API).
//! [`Error`] covers process-level failures such as configuration and startup.

use std::io;

use thiserror::Error;

/// Result type alias for process-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level errors (configuration, startup, serving)
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Caller identity could not be established from request metadata
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// A certificate field was absent or empty
    #[error("Missing client certificate field: {0}")]
    Missing(String),

    /// The issuer asserted by the TLS terminator is not the trusted one
    #[error("Untrusted certificate issuer: {0:?}")]
    UntrustedIssuer(String),
}

/// Bearer token could not be obtained from the identity provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Transport failure, timeout, non-2xx status, or unusable response body
    #[error("Token acquisition failed: {0}")]
    AcquisitionFailed(String),
}

/// Device record could not be fetched from the device-management API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The upstream call did not complete within the configured timeout
    #[error("Device API request timed out")]
    Timeout,

    /// The upstream API does not know the device
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Transport failure or an upstream status other than not-found
    #[error("Device API error: {message}")]
    UpstreamError {
        /// HTTP status, when one was received
        status: Option<u16>,
        /// Human-readable detail (never the upstream body verbatim)
        message: String,
    },

    /// The upstream answered 2xx but the body was unusable or incomplete
    #[error("Malformed device record: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Create an upstream error without a status (transport failure)
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamError {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the upstream rejected our bearer token
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            Self::UpstreamError {
                status: Some(401 | 403),
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_rejection_only_for_401_and_403() {
        let unauthorized = FetchError::UpstreamError {
            status: Some(401),
            message: "HTTP 401".to_string(),
        };
        let forbidden = FetchError::UpstreamError {
            status: Some(403),
            message: "HTTP 403".to_string(),
        };
        let unavailable = FetchError::UpstreamError {
            status: Some(503),
            message: "HTTP 503".to_string(),
        };

        assert!(unauthorized.is_auth_rejection());
        assert!(forbidden.is_auth_rejection());
        assert!(!unavailable.is_auth_rejection());
        assert!(!FetchError::upstream("connection reset").is_auth_rejection());
        assert!(!FetchError::Timeout.is_auth_rejection());
    }

    #[test]
    fn display_messages_name_the_stage() {
        assert_eq!(
            IdentityError::Missing("SSL_CLIENT_I_DN_CN".to_string()).to_string(),
            "Missing client certificate field: SSL_CLIENT_I_DN_CN"
        );
        assert_eq!(
            TokenError::AcquisitionFailed("HTTP 401".to_string()).to_string(),
            "Token acquisition failed: HTTP 401"
        );
        assert_eq!(FetchError::Timeout.to_string(), "Device API request timed out");
    }
}
