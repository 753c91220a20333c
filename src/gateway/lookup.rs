//! Device lookup orchestration
//!
//! One lookup runs three stages in a fixed order and stops at the first
//! failure:
//!
//! ```text
//! request metadata
//!   → identity extraction      (failure → Forbidden, no network access)
//!   → API token from cache     (failure → BadGateway, device API untouched)
//!   → device record from cache (miss → device API; 404/400 → NotFound,
//!                               other failures → BadGateway; never cached)
//!   → Found(DeviceMetadata)
//! ```
//!
//! Nothing is retried here; a failed request fails and the client re-issues it.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheStatsSnapshot, TtlCache};
use crate::config::Config;
use crate::error::{FetchError, IdentityError, TokenError};
use crate::graph::{DeviceDirectory, DeviceMetadata, GraphClient};
use crate::identity::{IdentityExtractor, RequestMetadata};
use crate::token::{ClientCredentialsAcquirer, TokenCache};
use crate::{Error, Result};

/// Failure of an upstream dependency
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// The identity provider did not issue a token
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The device-management API failed
    #[error(transparent)]
    Device(#[from] FetchError),
}

/// Terminal result of one lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The caller's device record
    Found(DeviceMetadata),
    /// Caller identity missing or not issued by the trusted CA
    Forbidden(IdentityError),
    /// The device API does not know the caller's device
    NotFound(String),
    /// The identity provider or device API is unavailable or misbehaving
    BadGateway(UpstreamFailure),
}

/// Counters for both caches
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    /// API token cache
    pub token_cache: CacheStatsSnapshot,
    /// Device record cache
    pub device_cache: CacheStatsSnapshot,
}

/// Resolves a request's client certificate identity to its device record
pub struct DeviceGateway {
    extractor: IdentityExtractor,
    tokens: TokenCache,
    devices: TtlCache<DeviceMetadata>,
    directory: Arc<dyn DeviceDirectory>,
}

impl DeviceGateway {
    /// Assemble a gateway from its collaborators; both caches are created
    /// by the caller and owned by the gateway from here on
    #[must_use]
    pub fn new(
        extractor: IdentityExtractor,
        tokens: TokenCache,
        devices: TtlCache<DeviceMetadata>,
        directory: Arc<dyn DeviceDirectory>,
    ) -> Self {
        Self {
            extractor,
            tokens,
            devices,
            directory,
        }
    }

    /// Build the production gateway: one shared HTTP client with the
    /// configured timeout, the client-credentials token cache, and the
    /// Graph device client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or an upstream
    /// URL is unusable.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.upstream.timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;

        let acquirer = ClientCredentialsAcquirer::new(
            http_client.clone(),
            &config.upstream.authority_url,
            &config.upstream.tenant_id,
            config.upstream.client_id.clone(),
            config.upstream.client_secret.clone(),
            config.upstream.resource.clone(),
        )?;
        let directory = GraphClient::new(http_client, &config.upstream.graph_url)?;
        info!(
            token_url = %acquirer.token_url(),
            graph_url = %config.upstream.graph_url,
            "Upstream endpoints"
        );

        let extractor = IdentityExtractor::new(config.identity.trusted_issuer.clone())
            .with_fields(
                config.identity.subject_header.clone(),
                config.identity.issuer_header.clone(),
            );

        Ok(Self::new(
            extractor,
            TokenCache::new(Arc::new(acquirer), config.cache.token_ttl),
            TtlCache::new(config.cache.device_ttl),
            Arc::new(directory),
        ))
    }

    /// Run one lookup for the caller described by `metadata`
    pub async fn lookup<M>(&self, metadata: &M) -> LookupOutcome
    where
        M: RequestMetadata + ?Sized,
    {
        let identity = match self.extractor.extract(metadata) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "Rejected caller identity");
                return LookupOutcome::Forbidden(e);
            }
        };
        let device_id = identity.subject_common_name();
        debug!(device_id, "Caller identity accepted");

        let token = match self.tokens.get_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(device_id, error = %e, "Could not obtain API token");
                return LookupOutcome::BadGateway(e.into());
            }
        };

        let result = self
            .devices
            .get_or_fetch(device_id, || self.directory.managed_device(&token, device_id))
            .await;

        match result {
            Ok(metadata) => {
                info!(device_id, fields = metadata.len(), "Device lookup succeeded");
                LookupOutcome::Found(metadata)
            }
            Err(FetchError::NotFound(id)) => {
                info!(device_id, "Device unknown to device API");
                LookupOutcome::NotFound(id)
            }
            Err(e) => {
                if e.is_auth_rejection() {
                    self.tokens.invalidate(&token).await;
                }
                warn!(device_id, error = %e, "Device lookup failed");
                LookupOutcome::BadGateway(e.into())
            }
        }
    }

    /// Drop expired device records (background maintenance)
    pub fn evict_expired(&self) {
        self.devices.evict_expired();
    }

    /// Counters for both caches
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            token_cache: self.tokens.stats(),
            device_cache: self.devices.stats(),
        }
    }
}
