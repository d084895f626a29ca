//! Worker loop.
//!
//! Each worker blocks on the shared Redis queue, claims one member at a
//! time and drives it through the status DAG: RUNNING on claim, then
//! FINISHED, STOPPED, CANCELLED or ERROR depending on what the handler
//! returns. Generic failures are re-enqueued with a bounded backoff until
//! the handler's retry budget is spent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::RngExt;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::job::{JobKind, JobStats, JobStatus, QueueMember};
use crate::keys::Namespace;
use crate::registry::{JobContext, OpCommandProbe, Registry, RunError};
use crate::stats::StatsManager;

use super::queue::WorkQueue;
use super::SharedPoolMetrics;

/// Upper bound every retry delay stays under.
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Delay before a failed attempt is retried: exponential in the number of
/// failures plus a little jitter, clamped under the bound.
pub(super) fn retry_backoff_secs(fails: u32) -> u64 {
    let base = (1u64 << fails.min(5)) * 2;
    let jitter = rand::rng().random_range(0..5);
    (base + jitter).min(MAX_RETRY_DELAY_SECS - 5)
}

/// A single worker of the pool.
pub(super) struct Worker {
    id: String,
    queue: Arc<WorkQueue>,
    registry: Arc<Registry>,
    stats: StatsManager,
    conn: ConnectionManager,
    namespace: Namespace,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    metrics: Arc<SharedPoolMetrics>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: String,
        queue: Arc<WorkQueue>,
        registry: Arc<Registry>,
        stats: StatsManager,
        conn: ConnectionManager,
        namespace: Namespace,
        shutdown_rx: broadcast::Receiver<()>,
        poll_interval: Duration,
        metrics: Arc<SharedPoolMetrics>,
    ) -> Self {
        Self {
            id,
            queue,
            registry,
            stats,
            conn,
            namespace,
            shutdown_rx,
            poll_interval,
            metrics,
        }
    }

    /// Main worker loop: poll, claim, process, until shutdown.
    pub(super) async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(member)) => self.process(member).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, member: QueueMember) {
        let job_id = member.id.clone();
        let started = Instant::now();

        let record = match self.stats.retrieve(&job_id).await {
            Ok(rec) if rec.is_empty() => self.record_for_member(&member).await,
            Ok(rec) => rec,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Stats unreadable at claim");
                self.record_for_member(&member).await
            }
        };

        if record.status.is_terminal() {
            debug!(job_id = %job_id, status = %record.status, "Skipping terminal job");
            return;
        }

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            job_name = %member.name,
            "Processing job"
        );

        let Some(known) = self.registry.lookup(&member.name) else {
            // A peer enqueued a job this node never registered.
            error!(job_id = %job_id, job_name = %member.name, "No handler registered for job");
            self.stats.set_status(&job_id, JobStatus::Error).await;
            self.cleanup(&member, &record).await;
            return;
        };

        // A validation failure is an immediate ERROR; it never consumes
        // retry budget.
        if known.params_required {
            if let Err(e) = self.registry.validate(&member.name, &member.args) {
                warn!(job_id = %job_id, error = %e, "Parameter validation failed");
                self.stats.set_status(&job_id, JobStatus::Error).await;
                self.cleanup(&member, &record).await;
                return;
            }
        }

        let Some(mut handler) = self.registry.make_handler(&member.name) else {
            error!(job_id = %job_id, job_name = %member.name, "Handler factory vanished");
            self.stats.set_status(&job_id, JobStatus::Error).await;
            self.cleanup(&member, &record).await;
            return;
        };

        self.stats.set_status(&job_id, JobStatus::Running).await;
        self.metrics.increment_active();

        let ctx = JobContext::new(job_id.clone(), self.stats.clone());
        let probe = OpCommandProbe::new(self.conn.clone(), self.namespace.clone(), job_id.clone());
        let result = handler.run(&ctx, &member.args, &probe).await;

        self.metrics.decrement_active();
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.stats.set_status(&job_id, JobStatus::Finished).await;
                self.cleanup(&member, &record).await;
                self.metrics.record_completion(elapsed);
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job finished"
                );
            }
            Err(RunError::Stopped) => {
                self.stats.set_status(&job_id, JobStatus::Stopped).await;
                self.cleanup(&member, &record).await;
                info!(worker_id = %self.id, job_id = %job_id, "Job stopped on command");
            }
            Err(RunError::Cancelled) => {
                self.stats.set_status(&job_id, JobStatus::Cancelled).await;
                self.cleanup(&member, &record).await;
                info!(worker_id = %self.id, job_id = %job_id, "Job cancelled on command");
            }
            Err(RunError::Failed(reason)) => {
                self.handle_failure(member, &record, handler.max_fails(), reason, elapsed)
                    .await;
            }
        }
    }

    /// Reconstructs stats for a member with no readable record.
    ///
    /// Periodic ticks are the expected case: sweeps materialise them with
    /// no launch-time stats, so a Scheduled record is created and saved
    /// here. Anything else means the launch write is lagging or the hash
    /// expired; the record is rebuilt from the member without persisting,
    /// so a late launch write is not clobbered.
    async fn record_for_member(&self, member: &QueueMember) -> JobStats {
        if crate::period::policy::is_periodic_instance_id(&member.id) {
            let mut record = JobStats::new(member.name.clone(), JobKind::Scheduled, false)
                .with_id(member.id.clone())
                .with_run_at(member.enqueued_at);
            record.enqueue_time = member.enqueued_at;
            self.stats.save(record.clone()).await;
            return record;
        }

        let mut record = JobStats::new(member.name.clone(), JobKind::Generic, false)
            .with_id(member.id.clone());
        record.enqueue_time = member.enqueued_at;
        record
    }

    async fn handle_failure(
        &self,
        member: QueueMember,
        record: &JobStats,
        max_fails: u32,
        reason: String,
        elapsed: Duration,
    ) {
        let job_id = member.id.clone();

        let fails = match self.queue.record_failure(&job_id).await {
            Ok(f) => f,
            Err(e) => {
                // Without the counter the retry budget is unknowable;
                // failing hard beats retrying forever.
                error!(job_id = %job_id, error = %e, "Cannot record failure");
                self.stats.set_status(&job_id, JobStatus::Error).await;
                self.cleanup(&member, record).await;
                self.metrics.record_failure(elapsed);
                return;
            }
        };

        if fails <= max_fails {
            let delay = retry_backoff_secs(fails);
            let run_at = Utc::now().timestamp() + delay as i64;
            let mut retry_member = member.clone();
            retry_member.enqueued_at = run_at;

            warn!(
                worker_id = %self.id,
                job_id = %job_id,
                reason = %reason,
                attempt = fails,
                retry_in_secs = delay,
                "Job failed, re-enqueueing"
            );

            if let Err(e) = self.queue.schedule(&retry_member, run_at).await {
                error!(job_id = %job_id, error = %e, "Re-enqueue failed");
                self.stats.set_status(&job_id, JobStatus::Error).await;
                self.cleanup(&member, record).await;
                self.metrics.record_failure(elapsed);
                return;
            }

            // Status stays PENDING with a refreshed update time.
            self.stats.set_status(&job_id, JobStatus::Pending).await;
        } else {
            error!(
                worker_id = %self.id,
                job_id = %job_id,
                reason = %reason,
                attempts = fails,
                "Job failed permanently"
            );
            self.stats.set_status(&job_id, JobStatus::Error).await;
            self.cleanup(&member, record).await;
            self.metrics.record_failure(elapsed);
        }
    }

    /// Terminal-state housekeeping: release the uniqueness guard, drop the
    /// op command and the failure counter. Best-effort.
    async fn cleanup(&self, member: &QueueMember, record: &JobStats) {
        if record.unique {
            if let Err(e) = self.queue.release_unique(&member.name, &member.args).await {
                warn!(job_id = %member.id, error = %e, "Unique guard release failed");
            }
        }
        if let Err(e) = self.queue.clear_command(&member.id).await {
            warn!(job_id = %member.id, error = %e, "Op command cleanup failed");
        }
        if let Err(e) = self.queue.clear_failures(&member.id).await {
            warn!(job_id = %member.id, error = %e, "Failure counter cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_stays_under_bound() {
        for fails in 0..50 {
            let delay = retry_backoff_secs(fails);
            assert!(
                delay < MAX_RETRY_DELAY_SECS,
                "fails={} produced delay {}",
                fails,
                delay
            );
        }
    }

    #[test]
    fn test_retry_backoff_grows_with_failures() {
        // Compare lower bounds: jitter is at most 4, growth is larger.
        let early = (1u64 << 1) * 2;
        let late = (1u64 << 4) * 2;
        assert!(late > early + 4);
    }
}
