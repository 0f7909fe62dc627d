//! Supervised background loops
//!
//! A supervisor owns one cancellable loop. When the loop body returns an
//! error, panics or exits on its own, the supervisor logs it, waits a fixed
//! cooldown and launches the body again. Only `stop` ends supervision.

use crate::metrics::ControllerMetrics;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Supervisor {
    name: String,
    cooldown: Duration,
    restarts: Arc<AtomicU64>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<Arc<ControllerMetrics>>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            cooldown,
            restarts: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Launch `body` under supervision; a second call is ignored
    ///
    /// Each launch gets a child token of the supervisor's token.
    pub fn start<F, Fut>(&self, body: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            warn!("Supervisor {} already started", self.name);
            return;
        }

        let name = self.name.clone();
        let cooldown = self.cooldown;
        let restarts = self.restarts.clone();
        let cancel = self.cancel.clone();
        let metrics = self.metrics.clone();

        *handle = Some(tokio::spawn(async move {
            info!("Supervisor {} started", name);
            while !cancel.is_cancelled() {
                let run = tokio::spawn(body(cancel.child_token()));
                match run.await {
                    Ok(Ok(())) if cancel.is_cancelled() => break,
                    Ok(Ok(())) => warn!("{} exited unexpectedly", name),
                    Ok(Err(e)) => error!("{} failed: {:#}", name, e),
                    Err(e) if e.is_panic() => error!("{} panicked; recovered", name),
                    Err(e) => error!("{} was aborted: {}", name, e),
                }

                restarts.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &metrics {
                    metrics.record_supervisor_restart();
                }
                info!("Will restart {} in {:?}", name, cooldown);
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            info!("Supervisor {} stopped", name);
        }));
    }

    /// Signal the loop and its body to stop
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for supervision to end after [`Supervisor::stop`]
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Supervisor {} terminated abnormally: {}", self.name, e);
            }
        }
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }
}
