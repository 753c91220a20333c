//! Intune Device Gateway Library
//!
//! Resolves a device that already authenticated with a client certificate
//! (mutual TLS terminated by a reverse proxy) to its managed-device record.
//!
//! # Features
//!
//! - **Identity policy**: certificate subject/issuer Common Names forwarded by
//!   the TLS terminator, issuer pinned to a configured trust anchor name
//! - **Token cache**: one OAuth 2.0 client-credentials token per process
//! - **Device cache**: per-device records with their own TTL
//! - **Single-flight**: concurrent misses for one key share one upstream call
//! - **Typed outcomes**: Forbidden / NotFound / BadGateway, never a stale record

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod identity;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to initialise tracing: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to initialise tracing: {e}"))),
    }
}
