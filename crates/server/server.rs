//! Server implementation that runs API and workers concurrently.

use std::future::Future;
use std::net::SocketAddr;

use actix_web::{dev, web, App, HttpServer};
use tq_core::{Registry, Result, TqError, WorkerPool};

use crate::api::{self, AppState};
use crate::config::ServerConfig;

/// The tq server that runs both the API and worker pool.
pub struct Server {
    config: ServerConfig,
    registry: Registry,
}

impl Server {
    /// Create a new server for the queues and tasks in `registry`.
    pub fn new(config: ServerConfig, registry: Registry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server.
    ///
    /// This starts both the HTTP API server and the worker pool concurrently.
    /// The server will run until a shutdown signal (Ctrl+C) is received.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the server until `shutdown` completes.
    pub async fn run_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let worker_pool = WorkerPool::builder()
            .registry(self.registry)
            .config(self.config.worker.clone())
            .build()?;

        // Create app state for API
        let app_state = web::Data::new(AppState {
            backend: worker_pool.registry().backend().clone(),
            queues: worker_pool.registry().queue_names(),
        });

        let (http, bound) = start_api(self.config.api_addr, app_state)?;
        let http_handle = http.handle();
        let api_task = tokio::spawn(http);

        tracing::info!(
            addrs = ?bound,
            worker_id = %worker_pool.worker_id(),
            "API server started"
        );

        // Run worker pool (this blocks until shutdown)
        let worker_result = worker_pool.run_until(shutdown).await;

        tracing::info!("Shutting down API server...");
        http_handle.stop(true).await;
        match api_task.await {
            Ok(Err(e)) => tracing::error!(error = %e, "API server error"),
            Err(e) => tracing::error!(error = %e, "API server task failed"),
            Ok(Ok(())) => {}
        }

        tracing::info!("Server stopped");

        worker_result
    }
}

/// Bind the API and build its server future.
///
/// `HttpServer` is not `Send`, so it must not live across an `.await` in
/// [`Server::run_until`]. Only the returned `dev::Server` handle does.
fn start_api(
    addr: SocketAddr,
    app_state: web::Data<AppState>,
) -> Result<(dev::Server, Vec<SocketAddr>)> {
    let http = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(api::configure)
    })
    .bind(addr)
    .map_err(|e| TqError::Config(format!("Failed to bind API to {}: {}", addr, e)))?;
    let bound = http.addrs();
    Ok((http.disable_signals().run(), bound))
}
