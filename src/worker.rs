//! Polling worker for the transition job table.
//!
//! [`Worker`] wakes up every poll interval, asks its [`JobQueue`] for the
//! jobs that are due and hands each one to the [`TransitionRunner`] on a
//! blocking thread, since actions and store commits are synchronous.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::runner::{RunOutcome, TransitionRunner};
use crate::store::Store;

/// Jobs of one service waiting in the store.
///
/// The queue owns no state of its own: every poll reloads the store so
/// jobs scheduled by other processes show up.
pub struct JobQueue {
    store: Arc<Store>,
    service_name: String,
}

impl JobQueue {
    pub fn new(store: Arc<Store>, service_name: impl Into<String>) -> Self {
        Self {
            store,
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Queued jobs past their `not_before`, and started jobs whose worker lost its lease.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        if let Err(e) = self.store.refresh() {
            warn!(error = %e, "Could not reload the store, using the cached state");
        }
        self.store
            .read(|state| state.due_jobs(&self.service_name, now))
    }
}

/// Consumes the jobs of one async service.
pub struct Worker {
    queue: JobQueue,
    runner: Arc<TransitionRunner>,
    poll_interval: Duration,
}

impl Worker {
    /// The queue reads from the runner's store.
    pub fn new(runner: TransitionRunner, service_name: impl Into<String>, poll_interval: Duration) -> Self {
        let queue = JobQueue::new(Arc::clone(runner.store()), service_name);
        Self {
            queue,
            runner: Arc::new(runner),
            poll_interval,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Run every job that is due right now, one after another.
    pub async fn run_once(&self) -> Vec<(Uuid, RunOutcome)> {
        let due = self.queue.due_jobs(Utc::now());
        let mut results = Vec::with_capacity(due.len());
        for job_id in due {
            let runner = Arc::clone(&self.runner);
            let outcome = match tokio::task::spawn_blocking(move || runner.run_async_transition(job_id)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Job task panicked");
                    let reason = e.to_string();
                    let runner = Arc::clone(&self.runner);
                    let abandoned = {
                        let reason = reason.clone();
                        tokio::task::spawn_blocking(move || runner.abandon(job_id, &reason)).await
                    };
                    if let Err(e) = abandoned {
                        error!(job_id = %job_id, error = %e, "Could not abandon job");
                    }
                    RunOutcome::Failed(reason)
                }
            };
            debug!(job_id = %job_id, outcome = ?outcome, "Job processed");
            results.push((job_id, outcome));
        }
        results
    }

    /// Poll until Ctrl-C.
    pub async fn run(&self) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Could not listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Poll until `shutdown` completes.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        info!(
            service = %self.queue.service_name(),
            worker = %self.runner.worker_id(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Transition worker started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Transition worker stopping");
                    break;
                }
                _ = interval.tick() => {
                    let results = self.run_once().await;
                    if results.is_empty() {
                        debug!("No due jobs");
                    } else {
                        info!(processed = results.len(), "Processed due jobs");
                    }
                }
            }
        }
    }
}
