//! Backend Task Client
//!
//! Wraps a [`BackendTaskClient`] with the retry and poll contract the
//! lifecycle controllers rely on:
//!
//! - `submit` retries transient failures with bounded exponential backoff
//!   and surfaces anything else immediately.
//! - `wait` polls a task until it finishes, is reported lost, the deadline
//!   passes or the caller cancels. Cancelling only abandons local polling;
//!   the backend task keeps running.

use crate::config::TaskConfig;
use crate::domain::ports::{
    BackendFault, BackendTaskClientRef, TaskId, TaskOutcome, TaskRequest, TaskState,
};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Terminal result of waiting on a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCompletion {
    Succeeded(TaskOutcome),
    Failed(BackendFault),
    /// The backend no longer knows the task
    Lost,
}

/// Submission and polling policy
#[derive(Debug, Clone)]
pub struct TaskClientConfig {
    pub submit_initial_interval: Duration,
    pub submit_max_interval: Duration,
    pub submit_max_elapsed: Duration,
    pub poll_initial_interval: Duration,
    pub poll_max_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for TaskClientConfig {
    fn default() -> Self {
        Self::from(&TaskConfig::default())
    }
}

impl From<&TaskConfig> for TaskClientConfig {
    fn from(config: &TaskConfig) -> Self {
        Self {
            submit_initial_interval: Duration::from_millis(config.submit_initial_interval_ms),
            submit_max_interval: Duration::from_millis(config.submit_max_interval_ms),
            submit_max_elapsed: Duration::from_millis(config.submit_max_elapsed_ms),
            poll_initial_interval: Duration::from_millis(config.poll_initial_interval_ms),
            poll_max_interval: Duration::from_millis(config.poll_max_interval_ms),
            poll_timeout: config.poll_timeout(),
        }
    }
}

impl TaskClientConfig {
    fn submit_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.submit_initial_interval)
            .with_max_interval(self.submit_max_interval)
            .with_max_elapsed_time(Some(self.submit_max_elapsed))
            .build()
    }

    fn poll_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.poll_initial_interval)
            .with_max_interval(self.poll_max_interval)
            .with_randomization_factor(0.2)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Retry/poll adapter over the backend
pub struct TaskClient {
    backend: BackendTaskClientRef,
    config: TaskClientConfig,
}

impl TaskClient {
    pub fn new(backend: BackendTaskClientRef, config: TaskClientConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &BackendTaskClientRef {
        &self.backend
    }

    pub fn config(&self) -> &TaskClientConfig {
        &self.config
    }

    /// Submit a task, retrying transient backend failures
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        let kind = request.kind();
        let task_id = backoff::future::retry(self.config.submit_backoff(), || {
            let request = request.clone();
            async move {
                self.backend.submit(request).await.map_err(|e| {
                    if e.is_transient() {
                        warn!("Transient failure submitting {} task: {}", kind, e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await?;

        debug!("Submitted {} task {}", kind, task_id);
        Ok(task_id)
    }

    /// Poll a task until it reaches a terminal state
    pub async fn wait(&self, task_id: &TaskId, cancel: &CancellationToken) -> Result<TaskCompletion> {
        let deadline = Instant::now() + self.config.poll_timeout;
        let mut schedule = self.config.poll_backoff();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!(
                    "stopped waiting for task {}: request cancelled",
                    task_id
                )));
            }

            match self.backend.poll(task_id).await {
                Ok(TaskState::Pending) => {}
                Ok(TaskState::Succeeded(outcome)) => return Ok(TaskCompletion::Succeeded(outcome)),
                Ok(TaskState::Failed(fault)) => return Ok(TaskCompletion::Failed(fault)),
                Ok(TaskState::NotFound) => {
                    warn!("Task {} not found on {}", task_id, self.backend.backend_name());
                    return Ok(TaskCompletion::Lost);
                }
                Err(e) if e.is_transient() => {
                    warn!("Transient failure polling task {}: {}", task_id, e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeadlineExceeded(format!(
                    "task {} did not finish within {:?}",
                    task_id, self.config.poll_timeout
                )));
            }

            let delay = schedule
                .next_backoff()
                .unwrap_or(self.config.poll_max_interval)
                .min(deadline - now);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!(
                        "stopped waiting for task {}: request cancelled",
                        task_id
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
