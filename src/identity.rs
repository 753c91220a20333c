//! Caller identity extraction.
//!
//! The TLS terminator in front of the gateway performs the mutual-TLS
//! handshake and chain validation, then forwards the client certificate's
//! subject and issuer Common Names as request metadata. This module reads
//! those two fields and checks the issuer against the configured trust
//! anchor name.
//!
//! # Trust boundary
//!
//! Nothing here parses X.509 structures. The fields are trusted as asserted
//! by the terminator; deployments must ensure clients cannot reach the
//! gateway without passing through it, or they can forge both values.

use std::collections::{BTreeMap, HashMap};

use axum::http::HeaderMap;

use crate::error::IdentityError;

/// Metadata key for the client certificate subject Common Name.
pub const SUBJECT_CN_FIELD: &str = "SSL_CLIENT_S_DN_CN";

/// Metadata key for the client certificate issuer Common Name.
pub const ISSUER_CN_FIELD: &str = "SSL_CLIENT_I_DN_CN";

// ─────────────────────────────────────────────────────────────────────────────
// Request metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view of the metadata a transport layer attaches to a request.
pub trait RequestMetadata {
    /// Look up a metadata field by name.
    fn field(&self, name: &str) -> Option<&str>;
}

impl RequestMetadata for HashMap<String, String> {
    fn field(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl RequestMetadata for BTreeMap<String, String> {
    fn field(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

/// Header values that are not visible ASCII are treated as absent.
impl RequestMetadata for HeaderMap {
    fn field(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Caller identity
// ─────────────────────────────────────────────────────────────────────────────

/// A device identity vouched for by the trusted certificate issuer.
///
/// Only [`IdentityExtractor::extract`] constructs this type, so holding one
/// means both fields were present and the issuer matched policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    subject_common_name: String,
    issuer_common_name: String,
}

impl CallerIdentity {
    /// Unique device identifier from the certificate subject.
    #[must_use]
    pub fn subject_common_name(&self) -> &str {
        &self.subject_common_name
    }

    /// Issuer Common Name, equal to the configured trusted issuer.
    #[must_use]
    pub fn issuer_common_name(&self) -> &str {
        &self.issuer_common_name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extractor
// ─────────────────────────────────────────────────────────────────────────────

/// Validates caller identity fields against the trusted issuer policy.
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    trusted_issuer: String,
    subject_field: String,
    issuer_field: String,
}

impl IdentityExtractor {
    /// Create an extractor reading the standard `SSL_CLIENT_*` metadata keys.
    #[must_use]
    pub fn new(trusted_issuer: impl Into<String>) -> Self {
        Self {
            trusted_issuer: trusted_issuer.into(),
            subject_field: SUBJECT_CN_FIELD.to_string(),
            issuer_field: ISSUER_CN_FIELD.to_string(),
        }
    }

    /// Read the subject and issuer from differently named fields
    /// (e.g. the HTTP headers a reverse proxy forwards them in).
    #[must_use]
    pub fn with_fields(
        mut self,
        subject_field: impl Into<String>,
        issuer_field: impl Into<String>,
    ) -> Self {
        self.subject_field = subject_field.into();
        self.issuer_field = issuer_field.into();
        self
    }

    /// Extract a trusted caller identity from request metadata.
    ///
    /// # Errors
    ///
    /// - [`IdentityError::Missing`] if either field is absent or empty.
    /// - [`IdentityError::UntrustedIssuer`] if the issuer is not an exact,
    ///   case-sensitive match for the trusted issuer.
    pub fn extract<M>(&self, metadata: &M) -> Result<CallerIdentity, IdentityError>
    where
        M: RequestMetadata + ?Sized,
    {
        let subject = non_empty_field(metadata, &self.subject_field)?;
        let issuer = non_empty_field(metadata, &self.issuer_field)?;

        if issuer != self.trusted_issuer {
            return Err(IdentityError::UntrustedIssuer(issuer.to_owned()));
        }

        Ok(CallerIdentity {
            subject_common_name: subject.to_owned(),
            issuer_common_name: issuer.to_owned(),
        })
    }
}

fn non_empty_field<'a, M>(metadata: &'a M, name: &str) -> Result<&'a str, IdentityError>
where
    M: RequestMetadata + ?Sized,
{
    metadata
        .field(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IdentityError::Missing(name.to_owned()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
