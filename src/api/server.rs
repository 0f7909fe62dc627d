//! API Server
//!
//! Runs the REST surface until a shutdown is signalled. Shutdown stops
//! accepting connections and abandons the polling of in-flight requests;
//! backend tasks already submitted keep running and are resumed from the
//! ledger by the next retry.

use crate::controller::ControllerService;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    service: Arc<ControllerService>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, service: Arc<ControllerService>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            service,
            shutdown_tx,
        }
    }

    /// Serve until [`ApiServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let requests = CancellationToken::new();
        let app = RestRouter::new(self.service.clone(), requests.clone()).build();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            "REST API listening on {}",
            listener.local_addr().map_err(Error::Io)?
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
                requests.cancel();
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::Harness;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let h = Harness::new();
        let server = Arc::new(ApiServer::new(ApiServerConfig::default(), h.service.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        // Retry until the serve loop has subscribed
        let result = loop {
            server.shutdown();
            tokio::time::sleep(Duration::from_millis(10)).await;
            if handle.is_finished() {
                break handle.await.unwrap();
            }
        };
        assert!(result.is_ok());
    }
}
