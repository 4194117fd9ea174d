//! Redis example with several worker pools competing for the same work.
//!
//! This example demonstrates:
//! - Three pools sharing one Redis namespace, each with its own worker id
//! - Every job processed by exactly one pool
//! - A recurring task firing once per occurrence across all pools
//!
//! Run with: `cargo run -p demo-redis`
//! Requires Redis: `docker run -d -p 6379:6379 redis`

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tq_core::{
    JobContext, JobError, JobResult, Queue, QueueOptions, Registry, SharedBackend, TaskContext,
    WorkerConfig, WorkerPool,
};
use tq_redis::RedisBackend;
use tracing_subscriber::EnvFilter;

/// Payment capture for an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CapturePayment {
    order_id: String,
    amount_cents: u64,
}

async fn capture_payment(job: CapturePayment, ctx: JobContext) -> JobResult {
    tokio::time::sleep(Duration::from_millis(150)).await;
    // Every seventh order hits a transient gateway error once.
    if job.amount_cents % 7 == 0 && ctx.attempt() == 1 {
        println!("[{}] {} gateway timeout", ctx.worker_id(), job.order_id);
        return Err(JobError::retryable("payment gateway timeout"));
    }
    println!(
        "[{}] captured {} ({} cents)",
        ctx.worker_id(),
        job.order_id,
        job.amount_cents
    );
    Ok(())
}

async fn settle_payouts(ctx: TaskContext) -> JobResult {
    println!(
        "[{}] payout run for {}",
        ctx.worker_id(),
        ctx.trigger_key()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> tq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("tq Redis example\n");

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost".to_string());
    println!("Connecting to {}...", redis_url);

    let backend = match RedisBackend::new(&redis_url, "tq_demo").await {
        Ok(b) => SharedBackend::new(b),
        Err(e) => {
            eprintln!("Failed to connect: {}", e);
            eprintln!("Make sure Redis is running: docker run -d -p 6379:6379 redis");
            return Err(e);
        }
    };
    println!("Connected\n");

    let payments: Queue<CapturePayment> = Queue::producer(backend.clone(), "payments");
    for n in 1..=20u64 {
        payments
            .add(&CapturePayment {
                order_id: format!("ORD-{:03}", n),
                amount_cents: n * 1000 + n,
            })
            .await?;
    }
    println!("enqueued 20 payment captures\n");

    let mut pools = Vec::new();
    for name in ["pool-a", "pool-b", "pool-c"] {
        let mut registry = Registry::new(backend.clone());
        registry.define_queue("payments", QueueOptions::default().concurrency(2), capture_payment)?;
        registry.define_task("settle-payouts", "*/5 * * * * *", settle_payouts)?;

        let pool = WorkerPool::builder()
            .registry(registry)
            .config(
                WorkerConfig::builder()
                    .worker_id(name)
                    .shutdown_timeout(Duration::from_secs(5))
                    .build(),
            )
            .build()?;
        pools.push(pool);
    }

    println!("Running 3 pools for 20s (Ctrl+C to stop early)\n");
    let (tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut handles = Vec::new();
    for pool in pools {
        let mut rx = tx.subscribe();
        handles.push(tokio::spawn(async move {
            pool.run_until(async move {
                rx.recv().await.ok();
            })
            .await
        }));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(20)) => {}
    }
    tx.send(()).ok();
    for handle in handles {
        if let Ok(Err(e)) = handle.await {
            eprintln!("pool failed: {}", e);
        }
    }

    println!("\npayments: {:?}", payments.stats().await?);
    println!("Done");
    Ok(())
}
