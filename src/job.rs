//! Core job model.
//!
//! Defines the shapes shared by the pool, stats manager and HTTP surface:
//!
//! - `JobKind` / `JobStatus`: classification and lifecycle states
//! - `JobStats`: the persistent per-job record kept in a Redis hash
//! - `QueueMember`: the JSON shape queue and schedule entries use on the wire
//! - `JobRequest` / `JobActionRequest`: client submission payloads
//! - `OpCommand`: cooperative stop/cancel commands observed by handlers

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::Parameters;

/// How a job entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Enqueued for immediate execution.
    Generic,
    /// Enqueued with a run-at time in the future.
    Scheduled,
    /// A cron policy that spawns scheduled instances over time.
    Periodic,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Generic => write!(f, "Generic"),
            JobKind::Scheduled => write!(f, "Scheduled"),
            JobKind::Periodic => write!(f, "Periodic"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Generic" => Ok(JobKind::Generic),
            "Scheduled" => Ok(JobKind::Scheduled),
            "Periodic" => Ok(JobKind::Periodic),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

/// Lifecycle state of a job.
///
/// Transitions follow a fixed DAG: Pending → Running → one of Finished,
/// Error, Stopped or Cancelled; Pending may also go straight to Cancelled
/// when a job is stopped before any worker claims it. Periodic parents
/// never reach a terminal state themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted, waiting for a worker.
    Pending,
    /// Claimed by a worker, handler executing.
    Running,
    /// Handler returned success.
    Finished,
    /// Handler failed and the retry budget is spent.
    Error,
    /// Handler honoured a stop command.
    Stopped,
    /// Stopped before execution, or handler honoured a cancel command.
    Cancelled,
}

impl JobStatus {
    /// The form persisted in the stats hash.
    pub fn persisted(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Error => "ERROR",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parses either the persisted or the JSON rendering.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "FINISHED" => Some(JobStatus::Finished),
            "ERROR" => Some(JobStatus::Error),
            "STOPPED" => Some(JobStatus::Stopped),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Returns true once a job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Error | JobStatus::Stopped | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Finished => "Finished",
            JobStatus::Error => "Error",
            JobStatus::Stopped => "Stopped",
            JobStatus::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_empty(s: &String) -> bool {
    s.is_empty()
}

/// Persistent record of one job's lifecycle.
///
/// Stored as a Redis hash under `{ns}:job_stats:{id}` with lowercase field
/// names, and rendered as the `stats` object in API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    /// Globally unique job identifier.
    pub id: String,
    /// Handler name selected at submission.
    pub name: String,
    /// Submission kind.
    pub kind: JobKind,
    /// Whether the submission asked for in-flight uniqueness.
    pub unique: bool,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Optional URL back to the submitter.
    #[serde(default, skip_serializing_if = "is_empty")]
    pub ref_link: String,
    /// Epoch seconds at submission.
    pub enqueue_time: i64,
    /// Epoch seconds of the latest state change.
    pub update_time: i64,
    /// Scheduled run epoch; zero for non-scheduled jobs.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub run_at: i64,
    /// Last message the handler checked in.
    #[serde(default, skip_serializing_if = "is_empty")]
    pub check_in: String,
    /// Epoch seconds of the last check-in.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub check_in_at: i64,
}

impl JobStats {
    /// Creates stats for a freshly submitted job in `Pending` state.
    pub fn new(name: impl Into<String>, kind: JobKind, unique: bool) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: new_job_id(),
            name: name.into(),
            kind,
            unique,
            status: JobStatus::Pending,
            ref_link: String::new(),
            enqueue_time: now,
            update_time: now,
            run_at: 0,
            check_in: String::new(),
            check_in_at: 0,
        }
    }

    /// Overrides the generated identifier; used for periodic parents whose
    /// id is the policy id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the scheduled run epoch.
    pub fn with_run_at(mut self, run_at: i64) -> Self {
        self.run_at = run_at;
        self
    }

    /// Sets the reference link back to the submitter.
    pub fn with_ref_link(mut self, link: impl Into<String>) -> Self {
        self.ref_link = link.into();
        self
    }

    /// A zero-valued record: what `retrieve` yields for an unknown job.
    /// Callers distinguish by the empty id.
    pub fn empty() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            kind: JobKind::Generic,
            unique: false,
            status: JobStatus::Pending,
            ref_link: String::new(),
            enqueue_time: 0,
            update_time: 0,
            run_at: 0,
            check_in: String::new(),
            check_in_at: 0,
        }
    }

    /// Returns true for the zero-valued record.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

/// Generates a fresh job identifier.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The JSON shape queue lists and the scheduled ZSET store on the wire.
///
/// Changing the field set is a compatibility break with peer instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMember {
    /// Handler name.
    pub name: String,
    /// Job identifier.
    pub id: String,
    /// Job parameters.
    #[serde(default)]
    pub args: Parameters,
    /// For scheduled entries, the run epoch; otherwise the submit epoch.
    pub enqueued_at: i64,
}

/// Cooperative termination command a handler can observe mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCommand {
    /// Finish the current unit of work and return the stop sentinel.
    Stop,
    /// Abandon work and return the cancel sentinel.
    Cancel,
}

impl OpCommand {
    /// Wire form stored under the job-command key.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCommand::Stop => "stop",
            OpCommand::Cancel => "cancel",
        }
    }

    /// Parses the wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop" => Some(OpCommand::Stop),
            "cancel" => Some(OpCommand::Cancel),
            _ => None,
        }
    }
}

/// Client submission payload: `POST /api/v1/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// The job to launch.
    pub job: JobPayload,
}

/// Body of a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    /// Handler name; must be registered.
    pub name: String,
    /// Handler parameters.
    #[serde(default)]
    pub parameters: Parameters,
    /// Submission mode and its knobs.
    pub metadata: JobMetadata,
    /// Optional hook URL notified on state changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hook: Option<String>,
}

/// Submission mode selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Generic, Scheduled or Periodic.
    pub kind: JobKind,
    /// Coalesce with an identical in-flight job.
    #[serde(default)]
    pub unique: bool,
    /// Seconds until a Scheduled job runs; required for that kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_delay: Option<u64>,
    /// Six-field cron spec; required for Periodic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_spec: Option<String>,
}

/// Action request on an existing job: `POST /api/v1/jobs/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobActionRequest {
    /// The action to apply.
    pub action: JobAction,
}

/// Supported job actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    /// Cooperatively stop a pending or running job.
    Stop,
    /// Re-enqueue a job that ended in Error or Stopped.
    Retry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    #[test]
    fn test_status_persisted_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Finished,
            JobStatus::Error,
            JobStatus::Stopped,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.persisted()), Some(status));
            // The JSON rendering parses too.
            assert_eq!(JobStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_stats_new_defaults() {
        let stats = JobStats::new("replication", JobKind::Generic, false);

        assert!(!stats.id.is_empty());
        assert_eq!(stats.status, JobStatus::Pending);
        assert_eq!(stats.enqueue_time, stats.update_time);
        assert_eq!(stats.run_at, 0);
        assert!(!stats.is_empty());
        assert!(JobStats::empty().is_empty());
    }

    #[test]
    fn test_stats_json_rendering() {
        let stats = JobStats::new("replication", JobKind::Generic, false);
        let json = serde_json::to_value(&stats).expect("serialize");

        assert_eq!(json["status"], "Pending");
        assert_eq!(json["kind"], "Generic");
        assert_eq!(json["name"], "replication");
        // Empty optionals are omitted from responses.
        assert!(json.get("ref_link").is_none());
        assert!(json.get("run_at").is_none());
        assert!(json.get("check_in").is_none());
    }

    #[test]
    fn test_job_ids_unique() {
        let a = new_job_id();
        let b = new_job_id();
        assert_ne!(a, b);
        assert!(!a.contains('-'));
    }

    #[test]
    fn test_queue_member_wire_shape() {
        let member = QueueMember {
            name: "replication".into(),
            id: "periodic:job:replication:cG9saWN5:1700000000".into(),
            args: params::single("image", "testing:v1"),
            enqueued_at: 1_700_000_000,
        };

        let json = serde_json::to_string(&member).expect("serialize");
        let parsed: QueueMember = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, member);

        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        for field in ["name", "id", "args", "enqueued_at"] {
            assert!(value.get(field).is_some(), "missing wire field {}", field);
        }
    }

    #[test]
    fn test_job_request_parses_client_shape() {
        let body = r#"{
            "job": {
                "name": "ReplicationJob",
                "parameters": {"k": "v"},
                "metadata": {"kind": "Generic", "unique": false}
            }
        }"#;

        let req: JobRequest = serde_json::from_str(body).expect("parse");
        assert_eq!(req.job.name, "ReplicationJob");
        assert_eq!(req.job.metadata.kind, JobKind::Generic);
        assert!(!req.job.metadata.unique);
        assert!(req.job.metadata.cron_spec.is_none());
        assert!(req.job.status_hook.is_none());
    }

    #[test]
    fn test_action_request_lowercase() {
        let stop: JobActionRequest = serde_json::from_str(r#"{"action":"stop"}"#).expect("parse");
        assert_eq!(stop.action, JobAction::Stop);

        let retry: JobActionRequest =
            serde_json::from_str(r#"{"action":"retry"}"#).expect("parse");
        assert_eq!(retry.action, JobAction::Retry);

        assert!(serde_json::from_str::<JobActionRequest>(r#"{"action":"pause"}"#).is_err());
    }

    #[test]
    fn test_op_command_roundtrip() {
        assert_eq!(OpCommand::parse("stop"), Some(OpCommand::Stop));
        assert_eq!(OpCommand::parse("cancel"), Some(OpCommand::Cancel));
        assert_eq!(OpCommand::parse("STOP"), None);
        assert_eq!(OpCommand::Stop.as_str(), "stop");
    }
}
