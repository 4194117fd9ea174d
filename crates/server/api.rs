//! API module for tq server.

use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;
use tq_core::{Backend, JobId, QueueStats, SharedBackend, TqError};

/// Application state shared across handlers.
pub struct AppState {
    pub backend: SharedBackend,
    /// Queues defined in the registry, in definition order.
    pub queues: Vec<String>,
}

/// Response for health check.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Statistics of one queue.
#[derive(Serialize)]
pub struct QueueStatsResponse {
    pub queue: String,
    #[serde(flatten)]
    pub stats: QueueStats,
}

/// Response for all registered queues.
#[derive(Serialize)]
pub struct StatsResponse {
    pub queues: Vec<QueueStatsResponse>,
}

/// Response for a cancel request.
#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Generic API response.
#[derive(Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

impl ApiResponse {
    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Configure API routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/health", web::get().to(health))
            .service(
                web::scope("/api")
                    .route("/stats", web::get().to(all_stats))
                    .route("/stats/{queue}", web::get().to(queue_stats))
                    .route("/jobs/{id}", web::get().to(get_job))
                    .route("/jobs/{id}/cancel", web::post().to(cancel_job)),
            ),
    );
}

/// Health check endpoint.
async fn health() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse { status: "ok" })
}

/// Statistics for every registered queue.
async fn all_stats(state: web::Data<AppState>) -> impl Responder {
    let mut queues = Vec::with_capacity(state.queues.len());
    for queue in &state.queues {
        match state.backend.queue_stats(queue).await {
            Ok(stats) => queues.push(QueueStatsResponse {
                queue: queue.clone(),
                stats,
            }),
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "Failed to read queue stats");
                return HttpResponse::InternalServerError()
                    .json(ApiResponse::error(format!("Failed to get stats: {}", e)));
            }
        }
    }
    HttpResponse::Ok().json(StatsResponse { queues })
}

/// Statistics for one queue.
async fn queue_stats(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let queue = path.into_inner();
    match state.backend.queue_stats(&queue).await {
        Ok(stats) => HttpResponse::Ok().json(QueueStatsResponse { queue, stats }),
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::error(format!("Failed to get stats: {}", e))),
    }
}

/// Snapshot of a job record.
async fn get_job(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let Ok(job_id) = JobId::parse(&path) else {
        return HttpResponse::NotFound().json(ApiResponse::error("Job not found"));
    };

    match state.backend.get_job(&job_id).await {
        Ok(Some(job)) => HttpResponse::Ok().json(job),
        Ok(None) => HttpResponse::NotFound().json(ApiResponse::error("Job not found")),
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::error(format!("Failed to get job: {}", e))),
    }
}

/// Cancel a pending or retrying job.
async fn cancel_job(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let Ok(job_id) = JobId::parse(&path) else {
        return HttpResponse::NotFound().json(ApiResponse::error("Job not found"));
    };

    match state.backend.cancel(&job_id).await {
        Ok(()) => {
            tracing::info!(job_id = %job_id, "Job cancelled via API");
            HttpResponse::Ok().json(CancelResponse { cancelled: true })
        }
        Err(TqError::InvalidState { .. }) => {
            HttpResponse::Ok().json(CancelResponse { cancelled: false })
        }
        Err(TqError::JobNotFound(_)) => {
            HttpResponse::NotFound().json(ApiResponse::error("Job not found"))
        }
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::error(format!("Failed to cancel job: {}", e))),
    }
}
