//! Redis-backed work queue.
//!
//! Two structures per namespace: a FIFO list for immediate jobs
//! (LPUSH/BRPOP) and a ZSET of scheduled members scored by their run
//! epoch. A promotion pass atomically pops due scheduled members and
//! pushes them onto the FIFO, so workers only ever block on one list.
//!
//! Uniqueness is a SET-NX guard keyed by a digest over (name, params);
//! the guard value is the id of the in-flight job, which is what a
//! coalesced submission gets back.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ServiceError;
use crate::job::{OpCommand, QueueMember};
use crate::keys::Namespace;
use crate::params::{self, Parameters};

/// TTL of auxiliary per-job keys (unique guards, op commands, job bodies).
const AUX_KEY_TTL_SECS: usize = 86_400;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis operation failed.
    #[error("redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialise or deserialise a queue member.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<QueueError> for ServiceError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Redis(e) => ServiceError::RedisTransient(e),
            QueueError::Serialization(e) => ServiceError::HandleJsonData(e.to_string()),
        }
    }
}

/// Outcome of a uniqueness acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniqueOutcome {
    /// The guard was taken; the submission proceeds.
    Acquired,
    /// An identical job is in flight; its id is returned.
    Existing(String),
}

/// The shared Redis work queue of one namespace.
pub struct WorkQueue {
    conn: ConnectionManager,
    namespace: Namespace,
}

impl WorkQueue {
    /// Creates a queue over a shared connection.
    pub fn new(conn: ConnectionManager, namespace: Namespace) -> Self {
        Self { conn, namespace }
    }

    /// Pushes a member onto the immediate FIFO.
    pub async fn enqueue(&self, member: &QueueMember) -> Result<(), QueueError> {
        let raw = serde_json::to_string(member)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.namespace.work_queue(), raw)
            .await?;
        Ok(())
    }

    /// Blocks up to `timeout` for the next immediate member.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<QueueMember>, QueueError> {
        let mut conn = self.conn.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let popped: Option<(String, String)> = conn
            .brpop(self.namespace.work_queue(), timeout_secs as f64)
            .await?;

        match popped {
            Some((_, raw)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Adds a member to the scheduled ZSET at its run epoch.
    ///
    /// ZADD semantics make this idempotent for deterministic member ids:
    /// the same tick written twice stays one entry.
    pub async fn schedule(&self, member: &QueueMember, run_at: i64) -> Result<(), QueueError> {
        let raw = serde_json::to_string(member)?;
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(self.namespace.scheduled_queue(), raw, run_at)
            .await?;
        Ok(())
    }

    /// Moves every due scheduled member onto the immediate FIFO.
    ///
    /// ZPOPMIN is the claim: a member popped here is owned by this node.
    /// A member popped too early is put back and ends the pass, since the
    /// ZSET is score-ordered.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn.clone();
        let mut promoted = 0usize;

        loop {
            let popped: Vec<(String, i64)> = conn
                .zpopmin(self.namespace.scheduled_queue(), 1)
                .await?;
            let Some((raw, score)) = popped.into_iter().next() else {
                break;
            };

            if score > now {
                conn.zadd::<_, _, _, ()>(self.namespace.scheduled_queue(), raw, score)
                    .await?;
                break;
            }

            conn.lpush::<_, _, ()>(self.namespace.work_queue(), raw)
                .await?;
            promoted += 1;
        }

        Ok(promoted)
    }

    /// Removes an immediate member by job id. Returns true when found.
    pub async fn remove_queued(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.lrange(self.namespace.work_queue(), 0, -1).await?;

        for raw in members {
            if let Ok(member) = serde_json::from_str::<QueueMember>(&raw) {
                if member.id == job_id {
                    conn.lrem::<_, _, ()>(self.namespace.work_queue(), 1, &raw)
                        .await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Removes a scheduled member by job id. Returns true when found.
    pub async fn remove_scheduled(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrange(self.namespace.scheduled_queue(), 0, -1)
            .await?;

        for raw in members {
            if let Ok(member) = serde_json::from_str::<QueueMember>(&raw) {
                if member.id == job_id {
                    conn.zrem::<_, _, ()>(self.namespace.scheduled_queue(), &raw)
                        .await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Claims the uniqueness guard for (name, params), or reports the id
    /// of the in-flight job already holding it.
    pub async fn acquire_unique(
        &self,
        name: &str,
        params: &Parameters,
        job_id: &str,
    ) -> Result<UniqueOutcome, QueueError> {
        let key = self.namespace.unique_job(&unique_digest(name, params)?);
        let mut conn = self.conn.clone();

        let taken: bool = conn.set_nx(&key, job_id).await?;
        if taken {
            conn.expire::<_, ()>(&key, AUX_KEY_TTL_SECS as i64).await?;
            return Ok(UniqueOutcome::Acquired);
        }

        let existing: Option<String> = conn.get(&key).await?;
        match existing {
            Some(id) => Ok(UniqueOutcome::Existing(id)),
            // Guard expired between SETNX and GET; treat as acquired.
            None => {
                conn.set_nx::<_, _, bool>(&key, job_id).await?;
                conn.expire::<_, ()>(&key, AUX_KEY_TTL_SECS as i64).await?;
                Ok(UniqueOutcome::Acquired)
            }
        }
    }

    /// Releases the uniqueness guard once a job is terminal.
    pub async fn release_unique(&self, name: &str, params: &Parameters) -> Result<(), QueueError> {
        let key = self.namespace.unique_job(&unique_digest(name, params)?);
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&key).await?;
        Ok(())
    }

    /// Stores the launch body of a job so stop/retry can find it later.
    pub async fn store_body(&self, member: &QueueMember) -> Result<(), QueueError> {
        let raw = serde_json::to_string(member)?;
        let key = self.namespace.job_body(&member.id);
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(&key, raw, AUX_KEY_TTL_SECS as u64)
            .await?;
        Ok(())
    }

    /// Fetches a stored launch body.
    pub async fn fetch_body(&self, job_id: &str) -> Result<Option<QueueMember>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.namespace.job_body(job_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Raises a cooperative op command for a job.
    pub async fn push_command(&self, job_id: &str, command: OpCommand) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            self.namespace.job_command(job_id),
            command.as_str(),
            AUX_KEY_TTL_SECS as u64,
        )
        .await?;
        Ok(())
    }

    /// Clears any op command for a job.
    pub async fn clear_command(&self, job_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.namespace.job_command(job_id)).await?;
        Ok(())
    }

    /// Tracks one more failed attempt; returns the total so far.
    pub async fn record_failure(&self, job_id: &str) -> Result<u32, QueueError> {
        let key = self.namespace.job_fails(job_id);
        let mut conn = self.conn.clone();
        let fails: u32 = conn.incr(&key, 1u32).await?;
        conn.expire::<_, ()>(&key, AUX_KEY_TTL_SECS as i64).await?;
        Ok(fails)
    }

    /// Clears the failure counter of a job.
    pub async fn clear_failures(&self, job_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.namespace.job_fails(job_id)).await?;
        Ok(())
    }

    /// Number of members waiting on the immediate FIFO.
    pub async fn pending_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(self.namespace.work_queue()).await?)
    }

    /// Number of members waiting in the scheduled ZSET.
    pub async fn scheduled_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(self.namespace.scheduled_queue()).await?)
    }
}

/// Digest over canonical (name, params); equal submissions collide here.
pub fn unique_digest(name: &str, params: &Parameters) -> Result<String, serde_json::Error> {
    let canonical = params::to_canonical_json(params)?;
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use std::collections::BTreeMap;

    #[test]
    fn test_unique_digest_deterministic() {
        let params = params::single("image", "testing:v1");
        let a = unique_digest("replication", &params).expect("digest");
        let b = unique_digest("replication", &params).expect("digest");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_unique_digest_varies_with_name_and_params() {
        let params = params::single("image", "testing:v1");
        let base = unique_digest("replication", &params).expect("digest");

        let other_name = unique_digest("gc", &params).expect("digest");
        assert_ne!(base, other_name);

        let other_params = params::single("image", "testing:v2");
        let changed = unique_digest("replication", &other_params).expect("digest");
        assert_ne!(base, changed);
    }

    #[test]
    fn test_unique_digest_ignores_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), ParamValue::Int(2));
        a.insert("a".to_string(), ParamValue::Int(1));

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), ParamValue::Int(1));
        b.insert("b".to_string(), ParamValue::Int(2));

        assert_eq!(
            unique_digest("j", &a).expect("digest"),
            unique_digest("j", &b).expect("digest")
        );
    }

    #[test]
    fn test_queue_error_converts_to_service_error() {
        let json_err = serde_json::from_str::<QueueMember>("{").unwrap_err();
        let service: ServiceError = QueueError::Serialization(json_err).into();
        assert_eq!(service.code(), 10002);
    }
}
