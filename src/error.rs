//! Service-level error taxonomy.
//!
//! Subsystems carry their own `thiserror` enums (queue, config, scheduler);
//! everything that can surface to a client is funnelled into `ServiceError`
//! here, which owns the numeric code taxonomy and the HTTP status mapping.
//! Codes start at 10000 and are part of the API contract.

use thiserror::Error;

/// Errors surfaced through the HTTP API or raised at dispatch boundaries.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A handler honoured a stop command; surfaced as status STOPPED.
    #[error("job '{0}' stopped")]
    JobStopped(String),

    /// The request body could not be read.
    #[error("failed to read request body: {0}")]
    ReadRequestBody(String),

    /// JSON encoding or decoding failed.
    #[error("failed to handle JSON data: {0}")]
    HandleJsonData(String),

    /// The controller was not wired in before dispatch.
    #[error("no backend handler configured")]
    MissingBackendHandler,

    /// The pool rejected an otherwise well-formed enqueue.
    #[error("failed to launch job: {0}")]
    LaunchJob(String),

    /// The submitted job name has no registered handler.
    #[error("job '{0}' is not registered")]
    UnknownJob(String),

    /// Parameter validation failed.
    #[error("invalid job parameters: {0}")]
    InvalidParams(String),

    /// A Redis dial, ping or command failed after internal retries.
    #[error("redis error: {0}")]
    RedisTransient(#[from] redis::RedisError),

    /// A cron spec failed to parse at schedule time.
    #[error("invalid cron spec '{spec}': {reason}")]
    CronParse { spec: String, reason: String },

    /// No job exists under the requested identifier.
    #[error("job '{0}' not found")]
    JobNotFound(String),
}

impl ServiceError {
    /// Stable numeric code reported in error payloads.
    pub fn code(&self) -> u32 {
        match self {
            ServiceError::JobStopped(_) => 10000,
            ServiceError::ReadRequestBody(_) => 10001,
            ServiceError::HandleJsonData(_) => 10002,
            ServiceError::MissingBackendHandler => 10003,
            ServiceError::LaunchJob(_) => 10004,
            ServiceError::UnknownJob(_) => 10005,
            ServiceError::InvalidParams(_) => 10006,
            ServiceError::RedisTransient(_) => 10007,
            ServiceError::CronParse { .. } => 10008,
            ServiceError::JobNotFound(_) => 10009,
        }
    }

    /// HTTP status the error renders with.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::UnknownJob(_)
            | ServiceError::InvalidParams(_)
            | ServiceError::CronParse { .. } => 400,
            ServiceError::JobNotFound(_) => 404,
            ServiceError::JobStopped(_)
            | ServiceError::ReadRequestBody(_)
            | ServiceError::HandleJsonData(_)
            | ServiceError::MissingBackendHandler
            | ServiceError::LaunchJob(_)
            | ServiceError::RedisTransient(_) => 500,
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::HandleJsonData(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_start_at_10000_and_are_distinct() {
        let errors = [
            ServiceError::JobStopped("j".into()),
            ServiceError::ReadRequestBody("eof".into()),
            ServiceError::HandleJsonData("bad".into()),
            ServiceError::MissingBackendHandler,
            ServiceError::LaunchJob("full".into()),
            ServiceError::UnknownJob("x".into()),
            ServiceError::InvalidParams("missing".into()),
            ServiceError::CronParse {
                spec: "x".into(),
                reason: "bad".into(),
            },
            ServiceError::JobNotFound("j".into()),
        ];

        let mut codes: Vec<u32> = errors.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c >= 10000));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ServiceError::UnknownJob("x".into()).http_status(), 400);
        assert_eq!(ServiceError::InvalidParams("p".into()).http_status(), 400);
        assert_eq!(
            ServiceError::CronParse {
                spec: "nope".into(),
                reason: "fields".into()
            }
            .http_status(),
            400
        );
        assert_eq!(ServiceError::JobNotFound("j".into()).http_status(), 404);
        assert_eq!(ServiceError::MissingBackendHandler.http_status(), 500);
        assert_eq!(ServiceError::LaunchJob("x".into()).http_status(), 500);
    }

    #[test]
    fn test_json_error_converts() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let service: ServiceError = err.into();
        assert_eq!(service.code(), 10002);
    }
}
