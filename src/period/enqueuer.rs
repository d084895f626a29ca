//! Periodic enqueuer.
//!
//! Timer loop that turns cron policies into concrete scheduled instances.
//! Each sweep looks a few minutes ahead and ZADDs one member per due tick
//! into the scheduled queue. Tick ids are deterministic over (name,
//! policy, epoch), so the same tick produced by two nodes collapses to a
//! single ZSET member; the `last_periodic_enqueue` stamp additionally
//! keeps racing nodes from sweeping back-to-back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::RngExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ServiceError;
use crate::job::QueueMember;
use crate::keys::Namespace;

use super::policy::{self, PeriodicPolicy};
use super::store::PolicyStore;

/// Base sleep between sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Upper bound of the per-sweep jitter.
const SWEEP_JITTER_SECS: u64 = 30;

/// How far ahead a sweep materialises ticks.
const ENQUEUE_HORIZON_SECS: i64 = 240;

/// The timer loop over a policy-store snapshot.
pub struct PeriodicEnqueuer {
    conn: ConnectionManager,
    namespace: Namespace,
    store: Arc<PolicyStore>,
}

impl PeriodicEnqueuer {
    /// Creates an enqueuer reading from the given store.
    pub fn new(conn: ConnectionManager, namespace: Namespace, store: Arc<PolicyStore>) -> Self {
        Self {
            conn,
            namespace,
            store,
        }
    }

    /// Spawns the timer loop; it exits when the shutdown signal fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Periodic enqueuer started");
            loop {
                let jitter = Duration::from_secs(rand::rng().random_range(0..SWEEP_JITTER_SECS));
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL + jitter) => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "Periodic enqueue sweep failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Periodic enqueuer stopped");
                        return;
                    }
                }
            }
        })
    }

    /// One sweep: materialise every tick due before the horizon.
    ///
    /// A Redis error aborts the sweep (the next timer wake retries); a
    /// cron parse error only skips that policy, since specs were already
    /// validated at schedule time.
    pub async fn sweep(&self) -> Result<(), ServiceError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn.clone();

        let last: Option<i64> = conn
            .get(self.namespace.last_periodic_enqueue())
            .await?;
        if let Some(last) = last {
            if now - last < SWEEP_INTERVAL.as_secs() as i64 {
                debug!(last = last, "Another node swept recently, skipping tick");
                return Ok(());
            }
        }

        let horizon = now + ENQUEUE_HORIZON_SECS;
        let mut enqueued = 0usize;

        for policy in self.store.list() {
            enqueued += self.enqueue_policy_ticks(&mut conn, &policy, now, horizon).await?;
        }

        conn.set::<_, _, ()>(self.namespace.last_periodic_enqueue(), now)
            .await?;

        if enqueued > 0 {
            info!(instances = enqueued, "Periodic sweep enqueued instances");
        }
        Ok(())
    }

    async fn enqueue_policy_ticks(
        &self,
        conn: &mut ConnectionManager,
        policy: &PeriodicPolicy,
        now: i64,
        horizon: i64,
    ) -> Result<usize, ServiceError> {
        let schedule = match policy::parse_cron(&policy.cron_spec) {
            Ok(s) => s,
            Err(e) => {
                // Validated at schedule time; a parse failure here means a
                // peer wrote something newer than we understand.
                warn!(policy_id = %policy.policy_id, error = %e, "Unparseable cron spec skipped");
                return Ok(0);
            }
        };

        let mut count = 0usize;
        let mut t = now;
        while let Some(tick) = policy::next_run_after(&schedule, t) {
            if tick >= horizon {
                break;
            }

            let member = QueueMember {
                name: policy.job_name.clone(),
                id: policy::make_periodic_job_id(&policy.job_name, &policy.policy_id, tick),
                args: policy.job_params.clone(),
                enqueued_at: tick,
            };
            let raw = serde_json::to_string(&member)?;

            // Same member from any node: ZADD collapses the duplicates.
            conn.zadd::<_, _, _, ()>(self.namespace.scheduled_queue(), raw, tick)
                .await?;

            count += 1;
            t = tick;
        }
        Ok(count)
    }
}
