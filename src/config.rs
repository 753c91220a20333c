//! Configuration management

use std::{
    env, fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Placeholder shown instead of secrets in summaries and debug output
pub const REDACTED: &str = "<redacted>";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order; variables already set in
    /// the process environment are not overridden.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Caller identity policy
    pub identity: IdentityConfig,
    /// Identity provider and device-management API
    pub upstream: UpstreamConfig,
    /// Cache lifetimes
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: vec![".env".to_string()],
            server: ServerConfig::default(),
            identity: IdentityConfig::default(),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8443,
        }
    }
}

/// Caller identity policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Issuer Common Name that client certificates must carry
    pub trusted_issuer: String,
    /// Header carrying the client certificate subject CN (`SSL_CLIENT_S_DN_CN`)
    pub subject_header: String,
    /// Header carrying the client certificate issuer CN (`SSL_CLIENT_I_DN_CN`)
    pub issuer_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trusted_issuer: "Microsoft Intune MDM Device CA".to_string(),
            subject_header: "x-ssl-client-s-dn-cn".to_string(),
            issuer_header: "x-ssl-client-i-dn-cn".to_string(),
        }
    }
}

/// Identity provider and device-management API settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Directory tenant ID
    pub tenant_id: String,
    /// Application (client) ID
    pub client_id: String,
    /// Client secret. Supports `env:VAR_NAME`.
    pub client_secret: String,
    /// Identity provider base URL
    pub authority_url: String,
    /// Resource (audience) the token is requested for
    pub resource: String,
    /// Device-management API base URL, including the API version
    pub graph_url: String,
    /// Timeout applied to every outbound request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            tenant_id: "${TENANT_ID}".to_string(),
            client_id: "${CLIENT_ID}".to_string(),
            client_secret: "${CLIENT_SECRET}".to_string(),
            authority_url: "https://login.microsoftonline.com".to_string(),
            resource: "https://graph.microsoft.com/".to_string(),
            graph_url: "https://graph.microsoft.com/v1.0".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &REDACTED)
            .field("authority_url", &self.authority_url)
            .field("resource", &self.resource)
            .field("graph_url", &self.graph_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl UpstreamConfig {
    /// Resolve the client secret (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        if let Some(var_name) = self.client_secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_default()
        } else {
            self.client_secret.clone()
        }
    }
}

/// Cache lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an acquired API token is reused
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// How long a device record is reused
    #[serde(with = "humantime_serde")]
    pub device_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(60 * 60),
            device_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or the resulting configuration fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (DEVICE_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("DEVICE_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        config.expand_env_vars();
        config.upstream.client_secret = config.upstream.resolve_client_secret();

        config.validate()?;
        Ok(config)
    }

    /// Load `env_files` into the process environment, in order.
    ///
    /// Missing files are skipped. For each loaded file, the upstream
    /// credential variables it defines are logged by name only.
    fn load_env_files(&self) {
        for path in self.env_files.iter().map(|p| expand_home(p)) {
            if !path.is_file() {
                tracing::debug!(path = %path.display(), "Env file not found, skipped");
                continue;
            }
            if let Err(e) = dotenvy::from_path(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load env file");
                continue;
            }
            let supplied = credential_vars_in(&path);
            tracing::info!(path = %path.display(), credentials = ?supplied, "Loaded env file");
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in [
            &mut self.identity.trusted_issuer,
            &mut self.upstream.tenant_id,
            &mut self.upstream.client_id,
            &mut self.upstream.client_secret,
            &mut self.upstream.authority_url,
            &mut self.upstream.resource,
            &mut self.upstream.graph_url,
        ] {
            *value = Self::expand_string(&re, value);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check that the configuration can serve requests
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("identity.trusted_issuer", &self.identity.trusted_issuer),
            ("identity.subject_header", &self.identity.subject_header),
            ("identity.issuer_header", &self.identity.issuer_header),
            ("upstream.tenant_id", &self.upstream.tenant_id),
            ("upstream.client_id", &self.upstream.client_id),
            ("upstream.client_secret", &self.upstream.client_secret),
            ("upstream.resource", &self.upstream.resource),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} must be set")));
            }
        }

        for (name, value) in [
            ("upstream.authority_url", &self.upstream.authority_url),
            ("upstream.graph_url", &self.upstream.graph_url),
        ] {
            Url::parse(value).map_err(|e| Error::Config(format!("{name} is invalid: {e}")))?;
        }

        for (name, value) in [
            ("upstream.timeout", self.upstream.timeout),
            ("cache.token_ttl", self.cache.token_ttl),
            ("cache.device_ttl", self.cache.device_ttl),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        Ok(())
    }

    /// Copy of this configuration with secrets replaced, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.upstream.client_secret = REDACTED.to_string();
        copy
    }
}

/// Variables referenced by the default upstream credentials
const CREDENTIAL_VARS: [&str; 3] = ["TENANT_ID", "CLIENT_ID", "CLIENT_SECRET"];

/// Resolve a leading `~` to the home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches(['/', '\\'])),
        _ => PathBuf::from(path),
    }
}

/// Names of the credential variables an env file defines
fn credential_vars_in(path: &Path) -> Vec<&'static str> {
    let Ok(entries) = dotenvy::from_path_iter(path) else {
        return Vec::new();
    };
    let defined: Vec<String> = entries.filter_map(|e| e.ok().map(|(k, _)| k)).collect();
    CREDENTIAL_VARS
        .into_iter()
        .filter(|var| defined.iter().any(|k| k == var))
        .collect()
}
