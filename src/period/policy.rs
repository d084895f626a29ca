//! Periodic policy model.
//!
//! A policy is a durable cron rule: job name, parameters and a six-field
//! cron spec. Policies live in two Redis ZSETs sharing one score (the
//! policy JSON, and the policy id as an inverse index). The score doubles
//! as a lifecycle timestamp and as the seed of the policy id.

use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::params::Parameters;

/// A durable cron rule generating scheduled job instances over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicPolicy {
    /// Policy identifier; empty until assigned, and never part of the
    /// ZSET member encoding.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_id: String,
    /// Name of the job each tick launches.
    pub job_name: String,
    /// Parameters every tick runs with.
    #[serde(default)]
    pub job_params: Parameters,
    /// Six-field cron spec: `sec min hr dom mon dow`.
    pub cron_spec: String,
}

impl PeriodicPolicy {
    /// Creates an unassigned policy.
    pub fn new(job_name: impl Into<String>, job_params: Parameters, cron_spec: impl Into<String>) -> Self {
        Self {
            policy_id: String::new(),
            job_name: job_name.into(),
            job_params,
            cron_spec: cron_spec.into(),
        }
    }

    /// Canonical encoding used as the policies-ZSET member.
    ///
    /// The id is stripped first: two policies with identical (name,
    /// params, cron) must collapse to one member regardless of when they
    /// were assigned ids.
    pub fn zset_member(&self) -> Result<String, serde_json::Error> {
        let mut body = self.clone();
        body.policy_id.clear();
        serde_json::to_string(&body)
    }
}

/// Computes a policy score: current epoch seconds plus a small random
/// offset, so two policies created in the same second stay distinct.
pub fn next_score(now: DateTime<Utc>) -> i64 {
    now.timestamp() + rand::rng().random_range(0..1000)
}

/// Derives the policy id for a score.
pub fn policy_id_for_score(score: i64) -> String {
    BASE64.encode(format!("periodic:policy:{}", score))
}

/// Deterministic id of one periodic tick.
///
/// Equal inputs produce byte-equal ids, which is what makes concurrent
/// sweeps across nodes collapse in the scheduled ZSET.
pub fn make_periodic_job_id(job_name: &str, policy_id: &str, epoch: i64) -> String {
    format!("periodic:job:{}:{}:{}", job_name, policy_id, epoch)
}

/// True for ids produced by `make_periodic_job_id`. Periodic instances
/// have no launch-time stats record, so claimers need to tell them apart.
pub fn is_periodic_instance_id(job_id: &str) -> bool {
    job_id.starts_with("periodic:job:")
}

/// Parses a six-field cron spec.
pub fn parse_cron(spec: &str) -> Result<Schedule, ServiceError> {
    Schedule::from_str(spec).map_err(|e| ServiceError::CronParse {
        spec: spec.to_string(),
        reason: e.to_string(),
    })
}

/// Next fire epoch strictly after `t`, if the schedule has one.
pub fn next_run_after(schedule: &Schedule, t: i64) -> Option<i64> {
    let from = Utc.timestamp_opt(t, 0).single()?;
    schedule.after(&from).next().map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;
    use base64::Engine as _;

    fn sample_policy() -> PeriodicPolicy {
        PeriodicPolicy::new("fake_job", params::single("image", "testing:v1"), "5 * * * * *")
    }

    #[test]
    fn test_zset_member_excludes_id() {
        let mut with_id = sample_policy();
        with_id.policy_id = policy_id_for_score(1_700_000_123);
        let without_id = sample_policy();

        assert_eq!(
            with_id.zset_member().expect("encode"),
            without_id.zset_member().expect("encode")
        );
        assert!(!with_id.zset_member().expect("encode").contains("policy_id"));
    }

    #[test]
    fn test_zset_member_roundtrip_reattaches_id() {
        let member = sample_policy().zset_member().expect("encode");
        let mut parsed: PeriodicPolicy = serde_json::from_str(&member).expect("decode");
        assert!(parsed.policy_id.is_empty());

        parsed.policy_id = policy_id_for_score(42);
        assert_eq!(parsed.job_name, "fake_job");
        assert_eq!(parsed.cron_spec, "5 * * * * *");
    }

    #[test]
    fn test_score_offsets_within_bound() {
        let now = Utc::now();
        for _ in 0..50 {
            let score = next_score(now);
            let offset = score - now.timestamp();
            assert!((0..1000).contains(&offset), "offset {} out of range", offset);
        }
    }

    #[test]
    fn test_policy_id_is_base64_of_score_string() {
        let id = policy_id_for_score(1_700_000_000);
        let decoded = BASE64.decode(&id).expect("valid base64");
        assert_eq!(decoded, b"periodic:policy:1700000000");
    }

    #[test]
    fn test_periodic_job_id_total_and_deterministic() {
        let a = make_periodic_job_id("replication", "cG9saWN5", 1_700_000_000);
        let b = make_periodic_job_id("replication", "cG9saWN5", 1_700_000_000);
        assert_eq!(a, b);
        assert_eq!(a, "periodic:job:replication:cG9saWN5:1700000000");

        let other_tick = make_periodic_job_id("replication", "cG9saWN5", 1_700_000_060);
        assert_ne!(a, other_tick);

        assert!(is_periodic_instance_id(&a));
        assert!(!is_periodic_instance_id("8f14e45fceea167a5a36dedd4bea2543"));
    }

    #[test]
    fn test_parse_cron_six_fields() {
        parse_cron("5 * * * * *").expect("six-field spec parses");
        parse_cron("0 30 4 * * *").expect("daily spec parses");

        let err = parse_cron("not a cron").unwrap_err();
        assert!(matches!(err, ServiceError::CronParse { .. }));
        assert_eq!(err.code(), 10008);
    }

    #[test]
    fn test_next_run_walks_forward() {
        // Fires at second 5 of every minute.
        let schedule = parse_cron("5 * * * * *").expect("parse");
        let base = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("timestamp")
            .timestamp();

        let first = next_run_after(&schedule, base).expect("next run");
        assert_eq!(first, base + 5);

        let second = next_run_after(&schedule, first).expect("run after first");
        assert_eq!(second, first + 60);
    }
}
