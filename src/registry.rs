//! Job handler registry.
//!
//! Maps job names to handler factories plus per-handler metadata. The
//! registry is populated during bootstrap and read-only afterwards, so no
//! locking is needed. Every execution constructs a fresh handler from its
//! factory; handlers must not retain state across jobs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::warn;

use crate::error::ServiceError;
use crate::job::OpCommand;
use crate::keys::Namespace;
use crate::params::Parameters;
use crate::stats::StatsManager;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A handler is already registered under this name.
    #[error("job '{0}' is already registered")]
    Duplicate(String),

    /// Registration with an empty name.
    #[error("job name must not be empty")]
    EmptyName,
}

/// Outcome a handler reports from `run`.
#[derive(Debug, Error)]
pub enum RunError {
    /// The handler observed a stop command and wound down.
    #[error("job execution stopped on command")]
    Stopped,

    /// The handler observed a cancel command and abandoned its work.
    #[error("job execution cancelled on command")]
    Cancelled,

    /// Any other failure; consumes retry budget.
    #[error("{0}")]
    Failed(String),
}

impl RunError {
    /// Convenience constructor for generic failures.
    pub fn failed(msg: impl Into<String>) -> Self {
        RunError::Failed(msg.into())
    }
}

/// Per-run execution context handed to a handler.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    stats: StatsManager,
}

impl JobContext {
    /// Creates a context bound to one job.
    pub fn new(job_id: impl Into<String>, stats: StatsManager) -> Self {
        Self {
            job_id: job_id.into(),
            stats,
        }
    }

    /// The id of the job being executed.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Reports a progress message, persisted in the job's stats.
    pub async fn check_in(&self, message: impl Into<String>) {
        self.stats.check_in(&self.job_id, message.into()).await;
    }
}

/// Lets a handler observe cooperative termination requests.
///
/// The pool constructs one probe per execution; handlers poll it at a
/// granularity of their own choosing and honour a command by returning the
/// matching `RunError` sentinel.
#[derive(Clone)]
pub struct OpCommandProbe {
    conn: ConnectionManager,
    namespace: Namespace,
    job_id: String,
}

impl OpCommandProbe {
    /// Creates a probe for one job.
    pub fn new(conn: ConnectionManager, namespace: Namespace, job_id: impl Into<String>) -> Self {
        Self {
            conn,
            namespace,
            job_id: job_id.into(),
        }
    }

    /// Returns the pending command for this job, if any.
    ///
    /// A Redis failure is reported as "no command": termination stays
    /// cooperative and a transient outage must not break a running job.
    pub async fn check(&self) -> Option<OpCommand> {
        let key = self.namespace.job_command(&self.job_id);
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(raw)) => OpCommand::parse(&raw),
            Ok(None) => None,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Op command check failed");
                None
            }
        }
    }
}

/// A unit of executable work.
///
/// One instance is constructed per execution attempt; implementations must
/// not keep cross-job state.
#[async_trait]
pub trait JobHandler: Send {
    /// Additional attempts allowed after the first failure.
    fn max_fails(&self) -> u32;

    /// Validates parameters before execution. Only called when the handler
    /// was registered with `params_required`.
    fn validate(&self, params: &Parameters) -> Result<(), ServiceError>;

    /// Executes the job. Poll `probe` to honour stop/cancel requests.
    async fn run(
        &mut self,
        ctx: &JobContext,
        params: &Parameters,
        probe: &OpCommandProbe,
    ) -> Result<(), RunError>;
}

/// Factory constructing a fresh handler per execution.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn JobHandler> + Send + Sync>;

struct Entry {
    factory: HandlerFactory,
    params_required: bool,
}

/// Metadata answer for "is this job name known?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownJob {
    /// Whether submissions must carry validated parameters.
    pub params_required: bool,
}

/// Name → handler factory map, immutable after bootstrap.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler factory under a job name.
    ///
    /// Duplicate names fail: handler wiring mistakes should surface at
    /// bootstrap, not at dispatch.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        params_required: bool,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn JobHandler> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.entries.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.entries.insert(
            name,
            Entry {
                factory: Arc::new(factory),
                params_required,
            },
        );
        Ok(())
    }

    /// Looks a job name up.
    pub fn lookup(&self, name: &str) -> Option<KnownJob> {
        self.entries.get(name).map(|e| KnownJob {
            params_required: e.params_required,
        })
    }

    /// Constructs a fresh handler for a job name.
    pub fn make_handler(&self, name: &str) -> Option<Box<dyn JobHandler>> {
        self.entries.get(name).map(|e| (e.factory)())
    }

    /// Validates parameters against a fresh handler instance.
    ///
    /// Returns `UnknownJob` for unregistered names; passes parameters
    /// through untouched when the handler does not require them.
    pub fn validate(&self, name: &str, params: &Parameters) -> Result<(), ServiceError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ServiceError::UnknownJob(name.to_string()))?;
        if !entry.params_required {
            return Ok(());
        }
        (entry.factory)().validate(params)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered job names, for the status endpoint.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts invocations and fails a configurable number of times.
    struct FlakyJob {
        max_fails: u32,
        fail_times: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for FlakyJob {
        fn max_fails(&self) -> u32 {
            self.max_fails
        }

        fn validate(&self, params: &Parameters) -> Result<(), ServiceError> {
            if params.is_empty() {
                return Err(ServiceError::InvalidParams("parameters required".into()));
            }
            Ok(())
        }

        async fn run(
            &mut self,
            _ctx: &JobContext,
            _params: &Parameters,
            _probe: &OpCommandProbe,
        ) -> Result<(), RunError> {
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(RunError::failed("induced failure"));
            }
            Ok(())
        }
    }

    fn flaky_factory() -> Box<dyn JobHandler> {
        Box::new(FlakyJob {
            max_fails: 2,
            fail_times: Arc::new(AtomicU32::new(0)),
        })
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        registry
            .register("replication", true, flaky_factory)
            .expect("register");

        let known = registry.lookup("replication").expect("known job");
        assert!(known.params_required);
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["replication".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = Registry::new();
        registry
            .register("replication", false, flaky_factory)
            .expect("first registration");

        let err = registry
            .register("replication", false, flaky_factory)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref name) if name == "replication"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.register("", false, flaky_factory),
            Err(RegistryError::EmptyName)
        ));
    }

    #[test]
    fn test_fresh_handler_per_call() {
        let mut registry = Registry::new();
        registry
            .register("replication", true, flaky_factory)
            .expect("register");

        let a = registry.make_handler("replication").expect("handler");
        let b = registry.make_handler("replication").expect("handler");
        assert_eq!(a.max_fails(), 2);
        assert_eq!(b.max_fails(), 2);
        assert!(registry.make_handler("missing").is_none());
    }

    #[test]
    fn test_validate_paths() {
        let mut registry = Registry::new();
        registry
            .register("strict", true, flaky_factory)
            .expect("register strict");
        registry
            .register("lax", false, flaky_factory)
            .expect("register lax");

        // Unknown name.
        assert!(matches!(
            registry.validate("missing", &Parameters::new()),
            Err(ServiceError::UnknownJob(_))
        ));

        // Required + empty params fails through the handler.
        assert!(matches!(
            registry.validate("strict", &Parameters::new()),
            Err(ServiceError::InvalidParams(_))
        ));

        // Required + params passes.
        registry
            .validate("strict", &crate::params::single("k", "v"))
            .expect("valid params accepted");

        // Not required: params ignored entirely.
        registry
            .validate("lax", &Parameters::new())
            .expect("lax job accepts empty params");
    }
}
