//! Redis key layout for a job-service namespace.
//!
//! Every instance that shares a Redis database scopes its keys under a
//! namespace prefix. This module is the only place key names are built;
//! callers never assemble keys by hand, so the wire layout has a single
//! authority.

/// Key layout helper for one deployment namespace.
///
/// The prefix always carries exactly one trailing colon, regardless of how
/// the configured namespace string was spelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Creates a namespace from a user-supplied string.
    ///
    /// Trailing colons are collapsed so `"ns"`, `"ns:"` and `"ns::"` all
    /// yield the prefix `"ns:"`.
    pub fn new(namespace: impl AsRef<str>) -> Self {
        let trimmed = namespace.as_ref().trim_end_matches(':');
        Self {
            prefix: format!("{}:", trimmed),
        }
    }

    /// Returns the normalised prefix, including the trailing colon.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Base key of the periodic subsystem.
    pub fn period(&self) -> String {
        format!("{}period", self.prefix)
    }

    /// ZSET of serialised periodic policies, scored by policy score.
    pub fn periodic_policies(&self) -> String {
        format!("{}period:policies", self.prefix)
    }

    /// ZSET of policy ids sharing the score of their policy (inverse index).
    pub fn periodic_policy_score(&self) -> String {
        format!("{}period:policies_score", self.prefix)
    }

    /// Pub/sub channel carrying policy change notifications.
    pub fn periodic_notifications(&self) -> String {
        format!("{}period:policies:notifications", self.prefix)
    }

    /// Coordination lock key for the periodic subsystem.
    pub fn periodic_lock(&self) -> String {
        format!("{}period:lock", self.prefix)
    }

    /// Hash holding the stats of a single job.
    pub fn job_stats(&self, job_id: &str) -> String {
        format!("{}job_stats:{}", self.prefix, job_id)
    }

    /// ZSET of JSON-encoded scheduled jobs, scored by their run epoch.
    pub fn scheduled_queue(&self) -> String {
        format!("{}scheduled", self.prefix)
    }

    /// Epoch seconds of the last successful periodic enqueue sweep.
    pub fn last_periodic_enqueue(&self) -> String {
        format!("{}last_periodic_enqueue", self.prefix)
    }

    /// List serving as the immediate FIFO work queue.
    pub fn work_queue(&self) -> String {
        format!("{}queue", self.prefix)
    }

    /// Guard key for a unique job, keyed by the digest of (name, params).
    pub fn unique_job(&self, digest: &str) -> String {
        format!("{}unique:{}", self.prefix, digest)
    }

    /// Key carrying a cooperative op command (stop/cancel) for a job.
    pub fn job_command(&self, job_id: &str) -> String {
        format!("{}job_cmds:{}", self.prefix, job_id)
    }

    /// Counter of failed attempts for a job.
    pub fn job_fails(&self, job_id: &str) -> String {
        format!("{}job_fails:{}", self.prefix, job_id)
    }

    /// Stored launch body of a job, kept for stop/retry.
    pub fn job_body(&self, job_id: &str) -> String {
        format!("{}job_body:{}", self.prefix, job_id)
    }

    /// Hash mapping job ids to their registered hook URLs.
    pub fn hooks(&self) -> String {
        format!("{}hooks", self.prefix)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.prefix)
    }
}
