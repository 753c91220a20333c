//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::lookup::DeviceGateway;
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::{Error, Result};

/// Device lookup HTTP server
pub struct Server {
    /// Configuration
    config: Config,
    /// Shared lookup orchestration
    gateway: Arc<DeviceGateway>,
}

impl Server {
    /// Create a server and its upstream clients
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream clients cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let gateway = Arc::new(DeviceGateway::from_config(&config)?);
        Ok(Self { config, gateway })
    }

    /// Run until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let app = create_router(Arc::new(AppState {
            gateway: Arc::clone(&self.gateway),
        }));

        let listener = TcpListener::bind(addr).await?;

        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        info!(
            trusted_issuer = %self.config.identity.trusted_issuer,
            subject_header = %self.config.identity.subject_header,
            issuer_header = %self.config.identity.issuer_header,
            "Caller identity policy"
        );
        info!(
            token_ttl = ?self.config.cache.token_ttl,
            device_ttl = ?self.config.cache.device_ttl,
            upstream_timeout = ?self.config.upstream.timeout,
            "Cache lifetimes"
        );
        warn!(
            "Certificate headers are trusted as sent; expose this listener only to the mTLS terminator"
        );

        // Periodically drop expired device records
        let gateway = Arc::clone(&self.gateway);
        let sweep_interval = self.config.cache.device_ttl.max(Duration::from_secs(1));
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => gateway.evict_expired(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
