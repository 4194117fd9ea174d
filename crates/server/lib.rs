//! # tq-server - Worker process bootstrap and ops API
//!
//! This crate runs a [`WorkerPool`](tq_core::WorkerPool) next to a small HTTP
//! API for monitoring and management, on a backend chosen from a URL.
//!
//! ## Features
//!
//! - **Backend selection**: `postgres://`, `sqlite:` and `redis://` URLs
//! - **Worker Pool**: processes every queue and scheduled task in the registry
//! - **HTTP API**: Provides endpoints for:
//!   - Health check (`GET /health`)
//!   - Statistics of registered queues (`GET /api/stats`)
//!   - Statistics of one queue (`GET /api/stats/{queue}`)
//!   - Job snapshot (`GET /api/jobs/{id}`)
//!   - Cancel a waiting job (`POST /api/jobs/{id}/cancel`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tq_core::{QueueOptions, Registry};
//! use tq_server::{connect, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> tq_core::Result<()> {
//!     let config = ServerConfig::from_env()?;
//!     let backend = connect(&config.backend_url, &config.namespace).await?;
//!
//!     let mut registry = Registry::new(backend);
//!     registry.define_queue("email", QueueOptions::default(), |to: String, _ctx| async move {
//!         println!("sending to {}", to);
//!         Ok(())
//!     })?;
//!
//!     Server::new(config, registry).run().await
//! }
//! ```

mod api;
mod backend;
mod config;
mod server;

pub use backend::{connect, BackendKind};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use server::Server;
