//! Backend selection from a URL.

use tq_core::{Result, SharedBackend, TqError};
use tq_postgres::PostgresBackend;
use tq_redis::RedisBackend;
use tq_sqlite::SqliteBackend;

/// Which adapter a URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Sqlite,
    Redis,
}

impl BackendKind {
    /// Pick the adapter from the URL scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            "redis" | "rediss" => Ok(Self::Redis),
            _ => Err(TqError::Config(format!(
                "Unsupported backend URL scheme '{}'",
                scheme
            ))),
        }
    }
}

/// Connect to the backend named by `url`.
pub async fn connect(url: &str, namespace: &str) -> Result<SharedBackend> {
    let kind = BackendKind::from_url(url)?;
    tracing::info!(backend = ?kind, namespace, "Connecting to backend");

    let backend = match kind {
        BackendKind::Postgres => SharedBackend::new(PostgresBackend::new(url, namespace).await?),
        BackendKind::Sqlite => SharedBackend::new(SqliteBackend::new(url, namespace).await?),
        BackendKind::Redis => SharedBackend::new(RedisBackend::new(url, namespace).await?),
    };
    Ok(backend)
}
