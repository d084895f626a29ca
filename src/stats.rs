//! Job stats manager.
//!
//! Persists per-job stats hashes in Redis. Writes are asynchronous: they
//! enter a bounded queue drained by a single writer task, so stats updates
//! for one job reach Redis in submission order and external observers see
//! a monotone status trajectory. Reads are synchronous HGETALLs.
//!
//! Writes are best-effort. A failed write is retried with a jittered
//! delay; after three total attempts it is dropped with a warning. A lost
//! stats write never blocks job execution.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand::RngExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{self, HookRegistration, Notification};
use crate::error::ServiceError;
use crate::job::{JobKind, JobStats, JobStatus};
use crate::keys::Namespace;

/// Capacity of the write queue. Producers block once it fills; that
/// backpressure is intentional.
const QUEUE_CAPACITY: usize = 1024;

/// Total attempts (first try included) before a write is dropped.
const MAX_WRITE_ATTEMPTS: u8 = 3;

/// Upper bound of the jittered retry delay.
const MAX_RETRY_DELAY_MS: u64 = 5000;

/// Base TTL of terminal-capable job stats hashes.
const STATS_TTL_SECS: i64 = 86_400;

/// One queued write operation.
#[derive(Debug, Clone)]
enum WriteOp {
    /// Full upsert of a stats hash, including TTL maintenance.
    Save(JobStats),
    /// Targeted status + update-time write.
    SetStatus { job_id: String, status: JobStatus },
    /// Targeted check-in message write.
    CheckIn { job_id: String, message: String },
}

#[derive(Debug, Clone)]
struct WriteItem {
    op: WriteOp,
    attempts: u8,
}

/// Handle to the stats subsystem. Cheap to clone; all clones feed the same
/// single writer.
#[derive(Clone)]
pub struct StatsManager {
    tx: mpsc::Sender<WriteItem>,
    conn: ConnectionManager,
    namespace: Namespace,
}

impl StatsManager {
    /// Starts the writer task and returns the manager handle plus the
    /// task's join handle.
    pub fn start(
        conn: ConnectionManager,
        namespace: Namespace,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer = Writer {
            rx,
            tx: tx.clone(),
            conn: conn.clone(),
            namespace: namespace.clone(),
        };
        let handle = tokio::spawn(writer.run(shutdown));
        (
            Self {
                tx,
                conn,
                namespace,
            },
            handle,
        )
    }

    /// Upserts the full stats hash for a job. Blocks only when the write
    /// queue is full.
    pub async fn save(&self, stats: JobStats) {
        self.enqueue(WriteOp::Save(stats)).await;
    }

    /// Updates a job's status and update time.
    pub async fn set_status(&self, job_id: &str, status: JobStatus) {
        self.enqueue(WriteOp::SetStatus {
            job_id: job_id.to_string(),
            status,
        })
        .await;
    }

    /// Records a handler check-in message.
    pub async fn check_in(&self, job_id: &str, message: String) {
        self.enqueue(WriteOp::CheckIn {
            job_id: job_id.to_string(),
            message,
        })
        .await;
    }

    async fn enqueue(&self, op: WriteOp) {
        if self
            .tx
            .send(WriteItem { op, attempts: 0 })
            .await
            .is_err()
        {
            warn!("Stats writer is gone; write discarded");
        }
    }

    /// Fetches a job's stats. An unknown id yields the zero-valued record
    /// with an empty id; callers distinguish.
    pub async fn retrieve(&self, job_id: &str) -> Result<JobStats, ServiceError> {
        let mut conn = self.conn.clone();
        let key = self.namespace.job_stats(job_id);
        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(JobStats::empty());
        }
        Ok(parse_stats_hash(&fields))
    }

    /// Stores a hook URL for a job and publishes the registration so peer
    /// nodes learn it.
    pub async fn register_hook(&self, job_id: &str, url: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.namespace.hooks(), job_id, url)
            .await?;

        let notification = Notification::RegisterHook(HookRegistration {
            job_id: job_id.to_string(),
            hook_url: url.to_string(),
        });
        bus::publish(&mut conn, &self.namespace, &notification).await?;
        debug!(job_id = %job_id, "Hook registered");
        Ok(())
    }

    /// Looks up the hook URL registered for a job, if any.
    pub async fn hook_url(&self, job_id: &str) -> Result<Option<String>, ServiceError> {
        let mut conn = self.conn.clone();
        let url: Option<String> = conn.hget(self.namespace.hooks(), job_id).await?;
        Ok(url)
    }
}

/// The single consumer of the write queue.
struct Writer {
    rx: mpsc::Receiver<WriteItem>,
    tx: mpsc::Sender<WriteItem>,
    conn: ConnectionManager,
    namespace: Namespace,
}

impl Writer {
    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Stats writer started");
        loop {
            tokio::select! {
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(item) => self.process(item).await,
                        None => break,
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Stats writer stopped");
    }

    async fn process(&mut self, mut item: WriteItem) {
        item.attempts += 1;
        if let Err(e) = self.apply(&item.op).await {
            if item.attempts >= MAX_WRITE_ATTEMPTS {
                warn!(
                    attempts = item.attempts,
                    error = %e,
                    "Stats write dropped after retries"
                );
                return;
            }

            let delay = Duration::from_millis(rand::rng().random_range(0..MAX_RETRY_DELAY_MS));
            debug!(
                attempts = item.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Stats write failed, re-queueing"
            );

            // Re-insert from a detached task so a full queue cannot
            // deadlock the writer against itself.
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(item).await;
            });
        }
    }

    async fn apply(&mut self, op: &WriteOp) -> Result<(), redis::RedisError> {
        let now = Utc::now().timestamp();
        match op {
            WriteOp::Save(stats) => {
                let key = self.namespace.job_stats(&stats.id);
                let fields = stats_hash_fields(stats);
                let mut pipe = redis::pipe();
                pipe.hset_multiple(&key, &fields).ignore();
                if let Some(ttl) = stats_ttl(stats, now) {
                    pipe.expire(&key, ttl as i64).ignore();
                }
                pipe.query_async::<_, ()>(&mut self.conn).await
            }
            WriteOp::SetStatus { job_id, status } => {
                let key = self.namespace.job_stats(job_id);
                self.conn
                    .hset_multiple::<_, _, _, ()>(
                        &key,
                        &[
                            ("status", status.persisted().to_string()),
                            ("update_time", now.to_string()),
                        ],
                    )
                    .await
            }
            WriteOp::CheckIn { job_id, message } => {
                let key = self.namespace.job_stats(job_id);
                self.conn
                    .hset_multiple::<_, _, _, ()>(
                        &key,
                        &[
                            ("check_in", message.clone()),
                            ("check_in_at", now.to_string()),
                            ("update_time", now.to_string()),
                        ],
                    )
                    .await
            }
        }
    }
}

/// Field list written into a stats hash. Lowercase names are part of the
/// wire layout.
fn stats_hash_fields(stats: &JobStats) -> Vec<(&'static str, String)> {
    vec![
        ("id", stats.id.clone()),
        ("name", stats.name.clone()),
        ("kind", stats.kind.to_string()),
        ("unique", stats.unique.to_string()),
        ("status", stats.status.persisted().to_string()),
        ("ref_link", stats.ref_link.clone()),
        ("enqueue_time", stats.enqueue_time.to_string()),
        ("update_time", stats.update_time.to_string()),
        ("run_at", stats.run_at.to_string()),
        ("check_in", stats.check_in.clone()),
        ("check_in_at", stats.check_in_at.to_string()),
    ]
}

/// TTL applied on save: one day for Generic, one day past the run time for
/// Scheduled, none for Periodic parents.
fn stats_ttl(stats: &JobStats, now: i64) -> Option<i64> {
    match stats.kind {
        JobKind::Generic => Some(STATS_TTL_SECS),
        JobKind::Scheduled => Some(STATS_TTL_SECS + (stats.run_at - now).max(0)),
        JobKind::Periodic => None,
    }
}

/// Rebuilds stats from a hash; absent or malformed fields fall back to
/// zero values rather than failing the read.
fn parse_stats_hash(fields: &HashMap<String, String>) -> JobStats {
    let get = |name: &str| fields.get(name).cloned().unwrap_or_default();
    let get_i64 = |name: &str| get(name).parse::<i64>().unwrap_or(0);

    JobStats {
        id: get("id"),
        name: get("name"),
        kind: get("kind").parse().unwrap_or(JobKind::Generic),
        unique: get("unique") == "true",
        status: JobStatus::parse(&get("status")).unwrap_or(JobStatus::Pending),
        ref_link: get("ref_link"),
        enqueue_time: get_i64("enqueue_time"),
        update_time: get_i64("update_time"),
        run_at: get_i64("run_at"),
        check_in: get("check_in"),
        check_in_at: get_i64("check_in_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;

    #[test]
    fn test_hash_fields_cover_wire_layout() {
        let stats = JobStats::new("replication", JobKind::Generic, true);
        let fields = stats_hash_fields(&stats);
        let names: Vec<&str> = fields.iter().map(|(n, _)| *n).collect();

        assert_eq!(
            names,
            vec![
                "id",
                "name",
                "kind",
                "unique",
                "status",
                "ref_link",
                "enqueue_time",
                "update_time",
                "run_at",
                "check_in",
                "check_in_at"
            ]
        );
    }

    #[test]
    fn test_hash_roundtrip_preserves_stats() {
        let mut stats = JobStats::new("replication", JobKind::Scheduled, false);
        stats.run_at = stats.enqueue_time + 300;
        stats.status = JobStatus::Running;
        stats.check_in = "halfway".into();
        stats.check_in_at = stats.enqueue_time + 10;

        let map: HashMap<String, String> = stats_hash_fields(&stats)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(parse_stats_hash(&map), stats);
    }

    #[test]
    fn test_persisted_status_is_screaming_snake() {
        let stats = JobStats::new("replication", JobKind::Generic, false);
        let fields = stats_hash_fields(&stats);
        let status = &fields.iter().find(|(n, _)| *n == "status").unwrap().1;
        assert_eq!(status, "PENDING");
    }

    #[test]
    fn test_ttl_rules() {
        let now = 1_700_000_000;

        let generic = JobStats::new("a", JobKind::Generic, false);
        assert_eq!(stats_ttl(&generic, now), Some(STATS_TTL_SECS));

        let mut scheduled = JobStats::new("b", JobKind::Scheduled, false);
        scheduled.run_at = now + 600;
        assert_eq!(stats_ttl(&scheduled, now), Some(STATS_TTL_SECS + 600));

        // A run time already in the past adds nothing.
        scheduled.run_at = now - 600;
        assert_eq!(stats_ttl(&scheduled, now), Some(STATS_TTL_SECS));

        let periodic = JobStats::new("c", JobKind::Periodic, false);
        assert_eq!(stats_ttl(&periodic, now), None);
    }

    #[test]
    fn test_parse_tolerates_missing_fields() {
        let mut map = HashMap::new();
        map.insert("id".to_string(), "j1".to_string());
        map.insert("status".to_string(), "garbage".to_string());

        let stats = parse_stats_hash(&map);
        assert_eq!(stats.id, "j1");
        assert_eq!(stats.status, JobStatus::Pending);
        assert_eq!(stats.enqueue_time, 0);
        assert!(!stats.is_empty());
    }
}
