//! Bearer token for the device-management API
//!
//! Implements the OAuth 2.0 client-credentials grant against the identity
//! provider and keeps one process-wide token in a [`TtlCache`]. The token's
//! own expiry claims are not inspected; the cache TTL alone decides when a
//! new token is acquired.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStatsSnapshot, TtlCache};
use crate::error::TokenError;
use crate::{Error, Result};

/// Cache key of the single global token
pub const TOKEN_CACHE_KEY: &str = "api_token";

/// Opaque bearer token
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a raw bearer token
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw token for an `Authorization: Bearer` header
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Source of fresh bearer tokens (one network round trip per call)
#[async_trait]
pub trait TokenAcquirer: Send + Sync {
    /// Obtain a new token from the identity provider
    async fn acquire(&self) -> std::result::Result<AccessToken, TokenError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Client-credentials grant
// ─────────────────────────────────────────────────────────────────────────────

/// Successful token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Error body returned by the token endpoint
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// Client-credentials grant against `{authority}/{tenant}/oauth2/token`
pub struct ClientCredentialsAcquirer {
    http_client: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    resource: String,
}

impl ClientCredentialsAcquirer {
    /// Create an acquirer for the given tenant
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `authority_url` cannot be used as a base URL.
    pub fn new(
        http_client: Client,
        authority_url: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        resource: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            http_client,
            token_url: token_url(authority_url, tenant_id)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            resource: resource.into(),
        })
    }

    /// Token endpoint this acquirer posts to
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }
}

/// Build `{authority}/{tenant}/oauth2/token?api-version=1.0`
fn token_url(authority_url: &str, tenant_id: &str) -> Result<Url> {
    let mut url = Url::parse(authority_url)
        .map_err(|e| Error::Config(format!("Invalid authority URL {authority_url:?}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| Error::Config(format!("Authority URL cannot be a base: {authority_url}")))?
        .pop_if_empty()
        .extend([tenant_id, "oauth2", "token"]);
    url.set_query(Some("api-version=1.0"));
    Ok(url)
}

#[async_trait]
impl TokenAcquirer for ClientCredentialsAcquirer {
    async fn acquire(&self) -> std::result::Result<AccessToken, TokenError> {
        info!("Acquiring API token");
        debug!(url = %self.token_url, "Token acquisition URL");

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("resource", self.resource.as_str()),
            ("grant_type", "client_credentials"),
        ];

        let response = self
            .http_client
            .post(self.token_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TokenError::AcquisitionFailed("token request timed out".to_string())
                } else {
                    TokenError::AcquisitionFailed(format!("token request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let code = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|r| r.error)
                .ok();
            warn!(status = status.as_u16(), error_code = ?code, "Token endpoint rejected request");
            return Err(TokenError::AcquisitionFailed(match code {
                Some(code) => format!("HTTP {status} ({code})"),
                None => format!("HTTP {status}"),
            }));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            TokenError::AcquisitionFailed(format!("failed to parse token response: {e}"))
        })?;

        if token.access_token.is_empty() {
            return Err(TokenError::AcquisitionFailed(
                "token response contained an empty access_token".to_string(),
            ));
        }

        info!("API token acquired");
        Ok(AccessToken::new(token.access_token))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token cache
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide cache of the API bearer token
pub struct TokenCache {
    acquirer: Arc<dyn TokenAcquirer>,
    cache: TtlCache<AccessToken>,
}

impl TokenCache {
    /// Create a token cache that keeps acquired tokens for `ttl`
    #[must_use]
    pub fn new(acquirer: Arc<dyn TokenAcquirer>, ttl: Duration) -> Self {
        Self {
            acquirer,
            cache: TtlCache::new(ttl),
        }
    }

    /// Return the cached token, acquiring a new one on miss.
    ///
    /// Concurrent misses share a single acquisition. Failures are not cached.
    pub async fn get_token(&self) -> std::result::Result<AccessToken, TokenError> {
        self.cache
            .get_or_fetch(TOKEN_CACHE_KEY, || self.acquirer.acquire())
            .await
    }

    /// Drop `token` if it is still the cached one.
    ///
    /// Used when the device API rejects the token before its TTL ran out.
    pub async fn invalidate(&self, token: &AccessToken) -> bool {
        let removed = self
            .cache
            .invalidate_if(TOKEN_CACHE_KEY, |cached| cached == token)
            .await;
        if removed {
            info!("Cached API token invalidated after upstream rejection");
        }
        removed
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }
}
