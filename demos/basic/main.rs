//! Basic example using the SQLite backend.
//!
//! This example demonstrates:
//! - Defining queues and a recurring task in a `Registry`
//! - Enqueueing jobs, with and without a delay
//! - Retries with backoff, progress reporting and cancellation
//! - Processing everything with a `WorkerPool`
//!
//! Run with: `cargo run -p demo-basic`

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tq_core::{
    EnqueueOptions, JobContext, JobError, JobResult, QueueOptions, Registry, RetryPolicy,
    SharedBackend, TaskContext, WorkerConfig, WorkerPool,
};
use tq_sqlite::SqliteBackend;
use tracing_subscriber::EnvFilter;

/// Order confirmation email.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderEmail {
    order_id: String,
    to: String,
}

/// Search index refresh for one product.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReindexProduct {
    sku: String,
    /// Number of attempts that fail before the indexer accepts the update.
    flaky_attempts: u32,
}

async fn send_order_email(job: OrderEmail, ctx: JobContext) -> JobResult<String> {
    println!("[email] #{} to {} (attempt {})", job.order_id, job.to, ctx.attempt());
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(format!("queued-for-{}", job.to))
}

async fn reindex_product(job: ReindexProduct, ctx: JobContext) -> JobResult {
    for step in 1..=4u8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.set_progress(step * 25).await?;
    }
    if ctx.attempt() <= job.flaky_attempts {
        println!("[search] {} rejected, attempt {}", job.sku, ctx.attempt());
        return Err(JobError::retryable("search cluster busy"));
    }
    println!("[search] {} indexed", job.sku);
    Ok(())
}

async fn sync_inventory(ctx: TaskContext) -> JobResult {
    println!(
        "[cron] {} fired for {} on {}",
        ctx.task_id(),
        ctx.trigger_key(),
        ctx.worker_id()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> tq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("tq SQLite example\n");

    // No setup required
    let backend = SharedBackend::new(SqliteBackend::in_memory("demo").await?);
    let mut registry = Registry::new(backend);

    let emails = registry.define_queue(
        "order-email",
        QueueOptions::default().concurrency(2),
        send_order_email,
    )?;
    let search = registry.define_queue(
        "search-index",
        QueueOptions::default()
            .max_attempts(4)
            .retry(RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(5)))
            .timeout(Duration::from_secs(10)),
        reindex_product,
    )?;
    registry.define_task("inventory-sync", "*/5 * * * * *", sync_inventory)?;

    for (order_id, to) in [("1001", "alice@example.com"), ("1002", "bob@example.com")] {
        let id = emails
            .add(&OrderEmail {
                order_id: order_id.to_string(),
                to: to.to_string(),
            })
            .await?;
        println!("enqueued email {}", id);
    }

    let late = emails
        .add_with_options(
            &OrderEmail {
                order_id: "1003".to_string(),
                to: "carol@example.com".to_string(),
            },
            EnqueueOptions::default().delay(Duration::from_secs(3)),
        )
        .await?;
    println!("enqueued delayed email {}", late);

    let cancelled = emails
        .add_with_options(
            &OrderEmail {
                order_id: "1004".to_string(),
                to: "dave@example.com".to_string(),
            },
            EnqueueOptions::default().delay(Duration::from_secs(60)),
        )
        .await?;
    println!("cancel {} -> {}", cancelled, emails.cancel_job(&cancelled).await?);

    let flaky = search
        .add(&ReindexProduct {
            sku: "SKU-RED-42".to_string(),
            flaky_attempts: 2,
        })
        .await?;
    println!("enqueued reindex {}\n", flaky);

    let pool = WorkerPool::builder()
        .registry(registry)
        .config(
            WorkerConfig::builder()
                .scheduler_interval(Duration::from_millis(500))
                .shutdown_timeout(Duration::from_secs(5))
                .build(),
        )
        .build()?;

    println!("Running for 15s (Ctrl+C to stop early)\n");
    pool.run_until(async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = tokio::time::sleep(Duration::from_secs(15)) => {}
        }
    })
    .await?;

    let email_stats = emails.stats().await?;
    let search_stats = search.stats().await?;
    println!("\norder-email: {:?}", email_stats);
    println!("search-index: {:?}", search_stats);

    if let Some(job) = search.get_job(&flaky).await? {
        println!(
            "reindex job: state={} attempts={} last_error={:?}",
            job.state.as_str(),
            job.attempts,
            job.last_error
        );
    }

    println!("\nDone");
    Ok(())
}
