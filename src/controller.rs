//! Request controller.
//!
//! The façade between the HTTP surface and the core: validates client
//! requests here so the pool and stats manager can assume well-formed
//! input, then delegates to the matching subsystem.

use std::sync::Arc;

use tracing::warn;

use crate::error::ServiceError;
use crate::job::{JobKind, JobRequest, JobStats};
use crate::params::Parameters;
use crate::pool::{PoolStatus, WorkerPool};
use crate::stats::StatsManager;

/// How a validated request should be launched.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchMode {
    /// Immediate enqueue.
    Immediate { unique: bool },
    /// Delayed enqueue after the given number of seconds.
    Delayed { run_after_secs: u64, unique: bool },
    /// Recurring enqueue driven by a cron spec.
    Periodic { cron_spec: String },
}

/// Validates a submission and derives its launch mode.
///
/// Pure so the request-shape rules are testable without a live pool.
pub fn validate_request(request: &JobRequest) -> Result<LaunchMode, ServiceError> {
    if request.job.name.trim().is_empty() {
        return Err(ServiceError::InvalidParams(
            "job name must not be empty".into(),
        ));
    }

    let metadata = &request.job.metadata;
    match metadata.kind {
        JobKind::Generic => Ok(LaunchMode::Immediate {
            unique: metadata.unique,
        }),
        JobKind::Scheduled => match metadata.schedule_delay {
            Some(delay) if delay > 0 => Ok(LaunchMode::Delayed {
                run_after_secs: delay,
                unique: metadata.unique,
            }),
            Some(_) => Err(ServiceError::InvalidParams(
                "schedule_delay must be positive".into(),
            )),
            None => Err(ServiceError::InvalidParams(
                "scheduled jobs require schedule_delay".into(),
            )),
        },
        JobKind::Periodic => match &metadata.cron_spec {
            Some(spec) if !spec.trim().is_empty() => Ok(LaunchMode::Periodic {
                cron_spec: spec.clone(),
            }),
            _ => Err(ServiceError::InvalidParams(
                "periodic jobs require cron_spec".into(),
            )),
        },
    }
}

/// Routes client operations to the pool and the stats manager.
pub struct Controller {
    pool: Arc<WorkerPool>,
    stats: StatsManager,
}

impl Controller {
    /// Creates a controller over a started pool.
    pub fn new(pool: Arc<WorkerPool>, stats: StatsManager) -> Self {
        Self { pool, stats }
    }

    /// Launches a job according to its metadata.
    pub async fn launch_job(&self, request: JobRequest) -> Result<JobStats, ServiceError> {
        let mode = validate_request(&request)?;
        let name = request.job.name.clone();
        let params: Parameters = request.job.parameters.clone();

        let stats = match mode {
            LaunchMode::Immediate { unique } => self.pool.enqueue(&name, params, unique).await?,
            LaunchMode::Delayed {
                run_after_secs,
                unique,
            } => {
                self.pool
                    .schedule(&name, params, run_after_secs, unique)
                    .await?
            }
            LaunchMode::Periodic { cron_spec } => {
                self.pool
                    .periodically_enqueue(&name, params, &cron_spec)
                    .await?
            }
        };

        if let Some(hook) = &request.job.status_hook {
            // Hook registration is best-effort: the job is already
            // launched and must not be failed retroactively.
            if let Err(e) = self.stats.register_hook(&stats.id, hook).await {
                warn!(job_id = %stats.id, error = %e, "Hook registration failed");
            }
        }

        Ok(stats)
    }

    /// Fetches the stats of a job.
    pub async fn get_job(&self, job_id: &str) -> Result<JobStats, ServiceError> {
        require_job_id(job_id)?;
        self.pool.get_job_stats(job_id).await
    }

    /// Stops a job; unknown ids are accepted as a no-op.
    pub async fn stop_job(&self, job_id: &str) -> Result<(), ServiceError> {
        require_job_id(job_id)?;
        self.pool.stop(job_id).await
    }

    /// Retries a job that ended in Error or Stopped.
    pub async fn retry_job(&self, job_id: &str) -> Result<JobStats, ServiceError> {
        require_job_id(job_id)?;
        self.pool.retry(job_id).await
    }

    /// Pool health snapshot.
    pub async fn check_status(&self) -> Result<PoolStatus, ServiceError> {
        self.pool.status().await
    }
}

fn require_job_id(job_id: &str) -> Result<(), ServiceError> {
    if job_id.trim().is_empty() {
        return Err(ServiceError::InvalidParams(
            "job id must not be empty".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobMetadata, JobPayload};
    use crate::params;

    fn request(kind: JobKind, delay: Option<u64>, cron: Option<&str>) -> JobRequest {
        JobRequest {
            job: JobPayload {
                name: "replication".into(),
                parameters: params::single("k", "v"),
                metadata: JobMetadata {
                    kind,
                    unique: false,
                    schedule_delay: delay,
                    cron_spec: cron.map(String::from),
                },
                status_hook: None,
            },
        }
    }

    #[test]
    fn test_generic_request_maps_to_immediate() {
        let mode = validate_request(&request(JobKind::Generic, None, None)).expect("valid");
        assert_eq!(mode, LaunchMode::Immediate { unique: false });
    }

    #[test]
    fn test_scheduled_request_requires_delay() {
        let ok = validate_request(&request(JobKind::Scheduled, Some(90), None)).expect("valid");
        assert_eq!(
            ok,
            LaunchMode::Delayed {
                run_after_secs: 90,
                unique: false
            }
        );

        let missing = validate_request(&request(JobKind::Scheduled, None, None)).unwrap_err();
        assert_eq!(missing.code(), 10006);

        let zero = validate_request(&request(JobKind::Scheduled, Some(0), None)).unwrap_err();
        assert_eq!(zero.code(), 10006);
    }

    #[test]
    fn test_periodic_request_requires_cron() {
        let ok =
            validate_request(&request(JobKind::Periodic, None, Some("5 * * * * *"))).expect("ok");
        assert_eq!(
            ok,
            LaunchMode::Periodic {
                cron_spec: "5 * * * * *".into()
            }
        );

        let missing = validate_request(&request(JobKind::Periodic, None, None)).unwrap_err();
        assert_eq!(missing.code(), 10006);

        let blank = validate_request(&request(JobKind::Periodic, None, Some("  "))).unwrap_err();
        assert_eq!(blank.code(), 10006);
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut req = request(JobKind::Generic, None, None);
        req.job.name = "  ".into();
        let err = validate_request(&req).unwrap_err();
        assert_eq!(err.code(), 10006);
    }

    #[test]
    fn test_empty_job_id_rejected() {
        assert!(require_job_id("").is_err());
        assert!(require_job_id("  ").is_err());
        assert!(require_job_id("abc").is_ok());
    }
}
