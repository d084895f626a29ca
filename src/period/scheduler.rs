//! Periodic scheduler.
//!
//! Public surface for cron policies. A policy lives in two ZSETs sharing
//! one score (the serialised policy, and its id as an inverse index), and
//! every mutation is a single MULTI that also publishes a change
//! notification, so peer nodes update their stores in the same step that
//! Redis changes.

use std::sync::Arc;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, Notification};
use crate::error::ServiceError;
use crate::keys::Namespace;
use crate::params::Parameters;

use super::policy::{self, PeriodicPolicy};
use super::store::PolicyStore;

/// Owns policy persistence and the in-memory store.
pub struct Scheduler {
    conn: ConnectionManager,
    namespace: Namespace,
    store: Arc<PolicyStore>,
}

impl Scheduler {
    /// Creates a scheduler over a shared connection and an empty store.
    pub fn new(conn: ConnectionManager, namespace: Namespace) -> Self {
        Self {
            conn,
            namespace,
            store: Arc::new(PolicyStore::new()),
        }
    }

    /// The policy store; the enqueuer reads snapshots through this.
    pub fn store(&self) -> Arc<PolicyStore> {
        Arc::clone(&self.store)
    }

    /// Registers the store-maintenance dispatchers on the bus, so every
    /// schedule/unschedule published anywhere lands in this node's store.
    pub fn wire_bus(&self, bus: MessageBus) -> MessageBus {
        let add_to = Arc::clone(&self.store);
        let remove_from = Arc::clone(&self.store);
        bus.on_schedule_policy(move |policy| {
            debug!(policy_id = %policy.policy_id, "Policy added via notification");
            add_to.add(policy);
            Ok(())
        })
        .on_unschedule_policy(move |policy| {
            debug!(policy_id = %policy.policy_id, "Policy removed via notification");
            remove_from.remove(&policy.policy_id);
            Ok(())
        })
    }

    /// Creates a cron policy.
    ///
    /// Returns the policy id and the next fire epoch. When an identical
    /// policy (same name, params and cron) already exists, the existing id
    /// is returned with a next-run of 0 and nothing is written.
    pub async fn schedule(
        &self,
        job_name: &str,
        params: Parameters,
        cron_spec: &str,
    ) -> Result<(String, i64), ServiceError> {
        if job_name.is_empty() {
            return Err(ServiceError::InvalidParams("job name must not be empty".into()));
        }
        if cron_spec.is_empty() {
            return Err(ServiceError::InvalidParams("cron spec must not be empty".into()));
        }
        let schedule = policy::parse_cron(cron_spec)?;

        let mut candidate = PeriodicPolicy::new(job_name, params, cron_spec);
        let member = candidate.zset_member()?;

        let mut conn = self.conn.clone();
        let existing_score: Option<i64> = conn
            .zscore(self.namespace.periodic_policies(), &member)
            .await?;

        if let Some(score) = existing_score {
            let ids: Vec<String> = conn
                .zrangebyscore(self.namespace.periodic_policy_score(), score, score)
                .await?;
            if let Some(id) = ids.into_iter().next() {
                debug!(policy_id = %id, "Identical policy already scheduled");
                return Ok((id, 0));
            }
            // The member exists but its id index entry is gone; fall
            // through and re-create both under a fresh score.
            warn!(score = score, "Policy present without id index, re-creating");
        }

        let now = Utc::now();
        let score = policy::next_score(now);
        candidate.policy_id = policy::policy_id_for_score(score);

        let event = Notification::SchedulePolicy(candidate.clone()).encode()?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(self.namespace.periodic_policies(), &member, score)
            .ignore()
            .zadd(
                self.namespace.periodic_policy_score(),
                &candidate.policy_id,
                score,
            )
            .ignore()
            .publish(self.namespace.periodic_notifications(), &event)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        let next_run = policy::next_run_after(&schedule, now.timestamp()).unwrap_or(0);
        info!(
            policy_id = %candidate.policy_id,
            job_name = %job_name,
            next_run = next_run,
            "Periodic policy scheduled"
        );
        Ok((candidate.policy_id, next_run))
    }

    /// Removes a cron policy by id.
    pub async fn unschedule(&self, policy_id: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn.clone();
        let score: Option<i64> = conn
            .zscore(self.namespace.periodic_policy_score(), policy_id)
            .await?;
        let score = score.ok_or_else(|| ServiceError::JobNotFound(policy_id.to_string()))?;

        // Recover the full policy so the notification carries it.
        let members: Vec<String> = conn
            .zrangebyscore(self.namespace.periodic_policies(), score, score)
            .await?;
        let mut policy = members
            .first()
            .and_then(|raw| serde_json::from_str::<PeriodicPolicy>(raw).ok())
            .unwrap_or_else(|| PeriodicPolicy::new("", Parameters::new(), ""));
        policy.policy_id = policy_id.to_string();

        let event = Notification::UnschedulePolicy(policy).encode()?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(self.namespace.periodic_policies(), score, score)
            .ignore()
            .zrembyscore(self.namespace.periodic_policy_score(), score, score)
            .ignore()
            .publish(self.namespace.periodic_notifications(), &event)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        info!(policy_id = %policy_id, "Periodic policy unscheduled");
        Ok(())
    }

    /// Loads every persisted policy into the store.
    ///
    /// The two ZSETs are joined in memory by score to reattach ids to the
    /// deserialised policies. Returns the number of policies loaded.
    pub async fn load(&self) -> Result<usize, ServiceError> {
        let mut conn = self.conn.clone();

        let raw_policies: Vec<(String, i64)> = conn
            .zrange_withscores(self.namespace.periodic_policies(), 0, -1)
            .await?;
        let raw_ids: Vec<(String, i64)> = conn
            .zrange_withscores(self.namespace.periodic_policy_score(), 0, -1)
            .await?;

        let ids_by_score: std::collections::HashMap<i64, String> =
            raw_ids.into_iter().map(|(id, score)| (score, id)).collect();

        let mut loaded = Vec::new();
        for (raw, score) in raw_policies {
            let mut policy: PeriodicPolicy = match serde_json::from_str(&raw) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable policy entry");
                    continue;
                }
            };
            match ids_by_score.get(&score) {
                Some(id) => policy.policy_id = id.clone(),
                None => {
                    warn!(score = score, "Skipping policy without id index entry");
                    continue;
                }
            }
            loaded.push(policy);
        }

        let count = loaded.len();
        self.store.add_all(loaded);
        info!(policies = count, "Periodic policies loaded");
        Ok(count)
    }

    /// Removes every policy from Redis. Operational tooling only; no
    /// notification is published.
    pub async fn clear(&self) -> Result<(), ServiceError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.namespace.periodic_policies())
            .ignore()
            .del(self.namespace.periodic_policy_score())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
