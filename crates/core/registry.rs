//! The constructed-once registry of processing functions and scheduled tasks.
//!
//! A `Registry` is built at process startup, then handed to the
//! `WorkerPool`. Nothing is discovered through globals.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use crate::backend::SharedBackend;
use crate::error::{Result, TqError};
use crate::queue::{JobContext, JobError, Queue, QueueOptions};
use crate::scheduler::{parse_schedule, ScheduledTask, TaskContext};

/// Type-erased processing function: raw payload in, raw result out.
pub(crate) type BoxedHandler = Arc<
    dyn Fn(serde_json::Value, JobContext) -> BoxFuture<'static, std::result::Result<Option<serde_json::Value>, JobError>>
        + Send
        + Sync,
>;

/// Type-erased scheduled task body.
pub(crate) type BoxedTask =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, std::result::Result<(), JobError>> + Send + Sync>;

/// A queue bound to its processing function.
pub(crate) struct QueueEntry {
    pub(crate) name: String,
    pub(crate) options: QueueOptions,
    pub(crate) handler: BoxedHandler,
}

/// Registry of queues and scheduled tasks for one process.
pub struct Registry {
    backend: SharedBackend,
    queues: Vec<Arc<QueueEntry>>,
    tasks: Vec<Arc<ScheduledTask>>,
}

impl Registry {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            queues: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Bind a processing function to `name`.
    ///
    /// Payloads that fail to deserialize into `T` fail the job without
    /// retrying. A result that serializes to `null` is stored as none.
    pub fn define_queue<T, R, F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: QueueOptions,
        handler: F,
    ) -> Result<Queue<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, JobError>> + Send + 'static,
    {
        let name = name.into();
        if self.queues.iter().any(|q| q.name == name) {
            return Err(TqError::DuplicateQueue(name));
        }
        options.validate(&name)?;

        let handler: BoxedHandler = Arc::new(move |data, ctx| {
            let payload = match serde_json::from_value::<T>(data) {
                Ok(payload) => payload,
                Err(e) => {
                    let err = JobError::fatal(format!("invalid payload: {}", e));
                    return async move { Err(err) }.boxed();
                }
            };
            let fut = handler(payload, ctx);
            async move {
                let output = fut.await?;
                let value = serde_json::to_value(output)
                    .map_err(|e| JobError::fatal(format!("unserializable result: {}", e)))?;
                Ok((!value.is_null()).then_some(value))
            }
            .boxed()
        });

        tracing::debug!(
            queue = %name,
            concurrency = options.concurrency,
            max_attempts = options.max_attempts,
            "Queue defined"
        );

        let queue = Queue::new(name.clone(), options.max_attempts, self.backend.clone());
        self.queues.push(Arc::new(QueueEntry {
            name,
            options,
            handler,
        }));
        Ok(queue)
    }

    /// Declare a recurring task.
    ///
    /// `expression` uses cron syntax with a leading seconds field; classic
    /// 5-field expressions run at second 0.
    pub fn define_task<F, Fut>(
        &mut self,
        task_id: impl Into<String>,
        expression: &str,
        execute: F,
    ) -> Result<()>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), JobError>> + Send + 'static,
    {
        let id = task_id.into();
        if self.tasks.iter().any(|t| t.id == id) {
            return Err(TqError::DuplicateTask(id));
        }
        let schedule = parse_schedule(expression)?;

        let execute: BoxedTask = Arc::new(move |ctx| execute(ctx).boxed());
        tracing::debug!(task_id = %id, expression, "Scheduled task defined");

        self.tasks.push(Arc::new(ScheduledTask {
            id,
            expression: expression.to_string(),
            schedule,
            execute,
        }));
        Ok(())
    }

    /// Names of all defined queues, in definition order.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }

    /// Ids of all declared scheduled tasks, in definition order.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.tasks.is_empty()
    }

    pub(crate) fn queues(&self) -> &[Arc<QueueEntry>] {
        &self.queues
    }

    pub(crate) fn tasks(&self) -> &[Arc<ScheduledTask>] {
        &self.tasks
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("queues", &self.queue_names())
            .field("tasks", &self.task_ids())
            .finish()
    }
}
