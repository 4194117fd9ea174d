//! Server example with HTTP API and worker pool.
//!
//! This example demonstrates:
//! - Picking the backend from `TQ_BACKEND_URL`
//! - Running the ops HTTP API next to the worker pool
//! - Watching queue statistics and job snapshots over HTTP
//!
//! Run with: `cargo run -p demo-server`
//!
//! Environment:
//! - `TQ_API_ADDR`              (default `127.0.0.1:8080`)
//! - `TQ_BACKEND_URL`           (default `sqlite:tq.db?mode=rwc`)
//! - `TQ_NAMESPACE`             (default `tq`)
//! - `TQ_SHUTDOWN_TIMEOUT_SECS` (default `30`)
//!
//! API Endpoints:
//! - GET  /health                 - Health check
//! - GET  /api/stats              - Statistics of every registered queue
//! - GET  /api/stats/{queue}      - Statistics of one queue
//! - GET  /api/jobs/{id}          - Job snapshot
//! - POST /api/jobs/{id}/cancel   - Cancel a pending or retrying job

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tq_core::{EnqueueOptions, JobContext, JobResult, QueueOptions, Registry, TaskContext};
use tq_server::{connect, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

/// Thumbnail rendering for an uploaded product image.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RenderThumbnail {
    image_url: String,
    width: u32,
}

#[derive(Debug, Serialize)]
struct Rendered {
    url: String,
}

async fn render_thumbnail(job: RenderThumbnail, ctx: JobContext) -> JobResult<Rendered> {
    tracing::info!(image = %job.image_url, width = job.width, "Rendering thumbnail");
    for step in 1..=5u8 {
        if ctx.is_cancelled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        ctx.set_progress(step * 20).await?;
    }
    Ok(Rendered {
        url: format!("{}?w={}", job.image_url, job.width),
    })
}

async fn expire_carts(ctx: TaskContext) -> JobResult {
    tracing::info!(trigger_key = %ctx.trigger_key(), "Expiring abandoned carts");
    Ok(())
}

#[tokio::main]
async fn main() -> tq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = ServerConfig::from_env()?;
    let backend = connect(&config.backend_url, &config.namespace).await?;

    let mut registry = Registry::new(backend);
    let thumbnails = registry.define_queue(
        "thumbnails",
        QueueOptions::default().concurrency(4),
        render_thumbnail,
    )?;
    registry.define_task("expire-carts", "0 * * * *", expire_carts)?;

    for (i, width) in [160, 320, 640].into_iter().enumerate() {
        let id = thumbnails
            .add_with_options(
                &RenderThumbnail {
                    image_url: format!("https://cdn.example.com/products/{}.png", i),
                    width,
                },
                EnqueueOptions::default().delay(Duration::from_secs(i as u64 * 2)),
            )
            .await?;
        println!("enqueued thumbnail job: http://{}/api/jobs/{}", config.api_addr, id);
    }

    println!("\nStats: http://{}/api/stats", config.api_addr);
    println!("Press Ctrl+C to stop\n");

    Server::new(config, registry).run().await
}
