//! jobforge: Redis-backed distributed job service.
//!
//! Accepts job submissions over an HTTP API, persists them in a Redis
//! work queue and dispatches them to a fixed-size pool of in-process
//! workers. Jobs come in three flavours: immediate, delayed and
//! cron-periodic. All coordination state lives in Redis under a shared
//! namespace prefix, so multiple instances can cooperate over one
//! database.

pub mod api;
pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod keys;
pub mod logger;
pub mod params;
pub mod period;
pub mod pool;
pub mod registry;
pub mod stats;

pub use config::Config;
pub use controller::Controller;
pub use error::ServiceError;
pub use job::{JobKind, JobStats, JobStatus};
pub use keys::Namespace;
pub use params::{ParamValue, Parameters};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use registry::{JobContext, JobHandler, OpCommandProbe, Registry, RunError};
pub use stats::StatsManager;
