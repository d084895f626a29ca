//! Worker pool.
//!
//! Fixed-size pool consuming the shared Redis work queue. The pool is the
//! single submission surface: immediate enqueue, delayed schedule and
//! periodic (cron) enqueue all go through it, and it reports every
//! lifecycle transition to the stats manager.

pub mod queue;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::ServiceError;
use crate::job::{JobKind, JobStats, JobStatus, OpCommand, QueueMember};
use crate::keys::Namespace;
use crate::params::Parameters;
use crate::period::Scheduler;
use crate::registry::{KnownJob, Registry};
use crate::stats::StatsManager;

pub use queue::{QueueError, UniqueOutcome, WorkQueue};

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Blocking-poll window on the immediate queue.
    pub poll_interval: Duration,
    /// How often due scheduled members are promoted.
    pub promote_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            poll_interval: Duration::from_secs(1),
            promote_interval: Duration::from_secs(2),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a config with the given worker count.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }
}

/// Counters shared between workers, exported through the status endpoint.
#[derive(Default)]
pub(crate) struct SharedPoolMetrics {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    active_workers: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolMetrics {
    pub(crate) fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot answered by `GET /api/v1/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Configured worker count.
    pub workers: usize,
    /// Workers executing a job right now.
    pub active_workers: usize,
    /// Jobs finished successfully since start.
    pub jobs_completed: u64,
    /// Jobs ended in ERROR since start.
    pub jobs_failed: u64,
    /// Members waiting on the immediate queue.
    pub pending: usize,
    /// Members waiting in the scheduled ZSET.
    pub scheduled: usize,
    /// Seconds since the pool started.
    pub uptime_secs: i64,
}

/// The worker pool and submission surface.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    conn: ConnectionManager,
    namespace: Namespace,
    queue: Arc<WorkQueue>,
    registry: Arc<Registry>,
    stats: StatsManager,
    scheduler: Arc<Scheduler>,
    shutdown_tx: broadcast::Sender<()>,
    metrics: Arc<SharedPoolMetrics>,
    is_running: AtomicBool,
    started_at: AtomicI64,
}

impl WorkerPool {
    /// Creates a pool over already-established collaborators.
    pub fn new(
        config: WorkerPoolConfig,
        conn: ConnectionManager,
        namespace: Namespace,
        registry: Arc<Registry>,
        stats: StatsManager,
        scheduler: Arc<Scheduler>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(conn.clone(), namespace.clone()));
        Self {
            config,
            conn,
            namespace,
            queue,
            registry,
            stats,
            scheduler,
            shutdown_tx,
            metrics: Arc::new(SharedPoolMetrics::default()),
            is_running: AtomicBool::new(false),
            started_at: AtomicI64::new(0),
        }
    }

    /// Spawns the workers and the scheduled-member promotion loop,
    /// returning their join handles so the bootstrap can drain them
    /// during the shutdown grace window.
    pub fn start(&self) -> Result<Vec<JoinHandle<()>>, ServiceError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::LaunchJob("pool is already running".into()));
        }

        let mut handles = Vec::with_capacity(self.config.workers + 1);
        for i in 0..self.config.workers {
            let worker = worker::Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.queue),
                Arc::clone(&self.registry),
                self.stats.clone(),
                self.conn.clone(),
                self.namespace.clone(),
                self.shutdown_tx.subscribe(),
                self.config.poll_interval,
                Arc::clone(&self.metrics),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        handles.push(self.spawn_promoter());

        self.started_at.store(Utc::now().timestamp(), Ordering::SeqCst);
        info!(workers = self.config.workers, "Worker pool started");
        Ok(handles)
    }

    fn spawn_promoter(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let interval = self.config.promote_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.promote_due().await {
                            Ok(0) => {}
                            Ok(n) => debug!(promoted = n, "Promoted due scheduled members"),
                            Err(e) => error!(error = %e, "Scheduled promotion failed"),
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Scheduled promoter stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Enqueues a job for immediate execution.
    pub async fn enqueue(
        &self,
        name: &str,
        params: Parameters,
        unique: bool,
    ) -> Result<JobStats, ServiceError> {
        self.check_submission(name, &params)?;

        let record = JobStats::new(name, JobKind::Generic, unique);
        if unique {
            if let Some(existing) = self.coalesce_unique(name, &params, &record.id).await? {
                return Ok(existing);
            }
        }

        let member = QueueMember {
            name: name.to_string(),
            id: record.id.clone(),
            args: params,
            enqueued_at: record.enqueue_time,
        };
        // Save before the push: the stats writer is FIFO, so the launch
        // record must be queued before any worker can report RUNNING.
        self.queue.store_body(&member).await?;
        self.stats.save(record.clone()).await;
        self.queue.enqueue(&member).await?;

        info!(job_id = %record.id, job_name = %name, "Job enqueued");
        Ok(record)
    }

    /// Enqueues a job to run `run_after_secs` seconds from now.
    pub async fn schedule(
        &self,
        name: &str,
        params: Parameters,
        run_after_secs: u64,
        unique: bool,
    ) -> Result<JobStats, ServiceError> {
        if run_after_secs == 0 {
            return Err(ServiceError::InvalidParams(
                "schedule delay must be positive".into(),
            ));
        }
        self.check_submission(name, &params)?;

        let run_at = Utc::now().timestamp() + run_after_secs as i64;
        let record = JobStats::new(name, JobKind::Scheduled, unique).with_run_at(run_at);
        if unique {
            if let Some(existing) = self.coalesce_unique(name, &params, &record.id).await? {
                return Ok(existing);
            }
        }

        let member = QueueMember {
            name: name.to_string(),
            id: record.id.clone(),
            args: params,
            enqueued_at: run_at,
        };
        self.queue.store_body(&member).await?;
        self.stats.save(record.clone()).await;
        self.queue.schedule(&member, run_at).await?;

        info!(job_id = %record.id, job_name = %name, run_at = run_at, "Job scheduled");
        Ok(record)
    }

    /// Creates a periodic policy and its parent stats record.
    pub async fn periodically_enqueue(
        &self,
        name: &str,
        params: Parameters,
        cron_spec: &str,
    ) -> Result<JobStats, ServiceError> {
        self.check_submission(name, &params)?;

        let (policy_id, next_run) = self.scheduler.schedule(name, params, cron_spec).await?;

        if next_run == 0 {
            // Identical policy already scheduled; hand back its parent.
            let existing = self.stats.retrieve(&policy_id).await?;
            if !existing.is_empty() {
                return Ok(existing);
            }
        }

        let record = JobStats::new(name, JobKind::Periodic, false)
            .with_id(policy_id)
            .with_run_at(next_run);
        self.stats.save(record.clone()).await;

        info!(policy_id = %record.id, job_name = %name, "Periodic job registered");
        Ok(record)
    }

    /// Stops a job. Unknown ids are a no-op.
    ///
    /// Pending jobs are pulled out of the queues and cancelled; running
    /// jobs get a cooperative stop command; periodic parents are
    /// unscheduled.
    pub async fn stop(&self, job_id: &str) -> Result<(), ServiceError> {
        let record = self.stats.retrieve(job_id).await?;
        if record.is_empty() {
            return Ok(());
        }

        if record.kind == JobKind::Periodic {
            self.scheduler.unschedule(job_id).await?;
            self.stats.set_status(job_id, JobStatus::Stopped).await;
            return Ok(());
        }

        match record.status {
            JobStatus::Pending => {
                let removed = self.queue.remove_queued(job_id).await?
                    || self.queue.remove_scheduled(job_id).await?;
                if removed {
                    self.stats.set_status(job_id, JobStatus::Cancelled).await;
                    self.release_aux(job_id, &record).await;
                } else {
                    // Claimed between the read and the removal; fall back
                    // to the cooperative path.
                    self.queue.push_command(job_id, OpCommand::Stop).await?;
                }
            }
            JobStatus::Running => {
                self.queue.push_command(job_id, OpCommand::Stop).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-enqueues a job that ended in Error or Stopped.
    pub async fn retry(&self, job_id: &str) -> Result<JobStats, ServiceError> {
        let mut record = self.stats.retrieve(job_id).await?;
        if record.is_empty() {
            return Err(ServiceError::JobNotFound(job_id.to_string()));
        }
        if !matches!(record.status, JobStatus::Error | JobStatus::Stopped) {
            return Err(ServiceError::LaunchJob(format!(
                "job '{}' is {} and cannot be retried",
                job_id, record.status
            )));
        }

        let member = self
            .queue
            .fetch_body(job_id)
            .await?
            .ok_or_else(|| ServiceError::LaunchJob("job launch body expired".into()))?;

        self.queue.clear_failures(job_id).await?;
        self.queue.clear_command(job_id).await?;
        // Pending goes into the stats queue before the push, so a fast
        // claim cannot be reordered behind it.
        self.stats.set_status(job_id, JobStatus::Pending).await;
        self.queue.enqueue(&member).await?;

        record.status = JobStatus::Pending;
        info!(job_id = %job_id, "Job re-enqueued for retry");
        Ok(record)
    }

    /// Fetches the stats of a job.
    pub async fn get_job_stats(&self, job_id: &str) -> Result<JobStats, ServiceError> {
        let record = self.stats.retrieve(job_id).await?;
        if record.is_empty() {
            return Err(ServiceError::JobNotFound(job_id.to_string()));
        }
        Ok(record)
    }

    /// Answers whether a job name is registered and whether it needs
    /// parameters.
    pub fn is_known_job(&self, name: &str) -> Option<KnownJob> {
        self.registry.lookup(name)
    }

    /// Current pool snapshot for the status endpoint.
    pub async fn status(&self) -> Result<PoolStatus, ServiceError> {
        let pending = self.queue.pending_len().await?;
        let scheduled = self.queue.scheduled_len().await?;
        let started = self.started_at.load(Ordering::SeqCst);
        let uptime = if started > 0 {
            Utc::now().timestamp() - started
        } else {
            0
        };

        Ok(PoolStatus {
            workers: self.config.workers,
            active_workers: self.metrics.active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: self.metrics.jobs_completed.load(Ordering::SeqCst),
            jobs_failed: self.metrics.jobs_failed.load(Ordering::SeqCst),
            pending,
            scheduled,
            uptime_secs: uptime,
        })
    }

    fn check_submission(&self, name: &str, params: &Parameters) -> Result<(), ServiceError> {
        let known = self
            .registry
            .lookup(name)
            .ok_or_else(|| ServiceError::UnknownJob(name.to_string()))?;
        if known.params_required {
            self.registry.validate(name, params)?;
        }
        Ok(())
    }

    async fn coalesce_unique(
        &self,
        name: &str,
        params: &Parameters,
        job_id: &str,
    ) -> Result<Option<JobStats>, ServiceError> {
        match self.queue.acquire_unique(name, params, job_id).await? {
            UniqueOutcome::Acquired => Ok(None),
            UniqueOutcome::Existing(existing_id) => {
                let mut existing = self.stats.retrieve(&existing_id).await?;
                if existing.is_empty() {
                    // The guard is authoritative; the in-flight job's
                    // stats write may simply not have landed yet.
                    debug!(job_id = %existing_id, "Coalesced before stats write landed");
                    existing = JobStats::new(name, JobKind::Generic, true).with_id(existing_id);
                }
                info!(
                    job_id = %existing.id,
                    job_name = %name,
                    "Unique submission coalesced with in-flight job"
                );
                Ok(Some(existing))
            }
        }
    }

    async fn release_aux(&self, job_id: &str, record: &JobStats) {
        if record.unique {
            if let Ok(Some(member)) = self.queue.fetch_body(job_id).await {
                if let Err(e) = self.queue.release_unique(&member.name, &member.args).await {
                    debug!(job_id = %job_id, error = %e, "Unique guard release failed");
                }
            }
        }
    }
}
