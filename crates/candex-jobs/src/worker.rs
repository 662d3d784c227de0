//! Long-running embedding worker.
//!
//! Repeatedly runs the batch processor. Sleeps only when an invocation
//! found nothing to claim, and broadcasts an event for every settled job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use candex_core::config::{env_flag, env_or};
use candex_core::{Error, JobKind, Result};

use crate::processor::{BatchProcessor, JobOutcomeStatus, ProcessReport};
use crate::DEFAULT_POLL_INTERVAL_MS;

/// Capacity of the worker event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_POLL_INTERVAL_MS` | `5000` | Polling interval when queue is empty |
    ///
    /// Batch bounds come from [`crate::ProcessorConfig::from_env`].
    pub fn from_env() -> Self {
        let enabled = env_flag("JOB_WORKER_ENABLED", true);

        let poll_interval_ms = env_or("JOB_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS);

        Self {
            poll_interval_ms,
            enabled,
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A job completed and its vector was stored.
    JobCompleted {
        job_id: Uuid,
        candidate_id: Uuid,
        kind: JobKind,
    },
    /// A job completed without re-embedding unchanged text.
    JobSkipped {
        job_id: Uuid,
        candidate_id: Uuid,
        kind: JobKind,
    },
    /// A job failed.
    JobFailed {
        job_id: Uuid,
        candidate_id: Uuid,
        kind: JobKind,
        error: String,
    },
    /// One processor invocation finished with at least one claimed job.
    BatchFinished { claimed: usize, failed: usize },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait for the worker task to exit.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {}", e)))
    }
}

/// Job worker that drives a [`BatchProcessor`] until shut down.
pub struct JobWorker {
    processor: BatchProcessor,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    pub fn new(processor: BatchProcessor, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            processor,
            config,
            event_tx,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        let task = tokio::spawn(async move {
            worker.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "jobs", component = "worker"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.processor.config().batch_size,
            max_jobs = self.processor.config().max_jobs,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            let idle = match self.processor.run_once().await {
                Ok(report) => {
                    let idle = report.claimed == 0;
                    self.broadcast(&report);
                    idle
                }
                Err(e) => {
                    error!(error = %e, "Job processing invocation failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    fn broadcast(&self, report: &ProcessReport) {
        if report.claimed == 0 {
            return;
        }
        for outcome in &report.outcomes {
            let event = match outcome.status {
                JobOutcomeStatus::Completed => WorkerEvent::JobCompleted {
                    job_id: outcome.job_id,
                    candidate_id: outcome.candidate_id,
                    kind: outcome.kind,
                },
                JobOutcomeStatus::Skipped => WorkerEvent::JobSkipped {
                    job_id: outcome.job_id,
                    candidate_id: outcome.candidate_id,
                    kind: outcome.kind,
                },
                JobOutcomeStatus::Failed => WorkerEvent::JobFailed {
                    job_id: outcome.job_id,
                    candidate_id: outcome.candidate_id,
                    kind: outcome.kind,
                    error: outcome.error.clone().unwrap_or_default(),
                },
            };
            let _ = self.event_tx.send(event);
        }
        debug!(claimed = report.claimed, failed = report.failed, "Batch finished");
        let _ = self.event_tx.send(WorkerEvent::BatchFinished {
            claimed: report.claimed,
            failed: report.failed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = WorkerConfig::default()
            .with_poll_interval(10)
            .with_enabled(false);
        assert_eq!(config.poll_interval_ms, 10);
        assert!(!config.enabled);
    }
}
