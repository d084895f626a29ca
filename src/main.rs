//! jobforge service entry point.
//!
//! Loads configuration, initialises logging, wires the subsystems
//! together and serves the API until SIGINT/SIGTERM. Every long-running
//! unit observes one shutdown broadcast and is given a bounded grace
//! window to wind down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use jobforge::bus::MessageBus;
use jobforge::config::Config;
use jobforge::controller::Controller;
use jobforge::error::ServiceError;
use jobforge::job::OpCommand;
use jobforge::keys::Namespace;
use jobforge::params::Parameters;
use jobforge::period::{PeriodicEnqueuer, Scheduler};
use jobforge::pool::{WorkerPool, WorkerPoolConfig};
use jobforge::registry::{JobContext, JobHandler, OpCommandProbe, Registry, RunError};
use jobforge::stats::StatsManager;
use jobforge::{api, logger};

/// Time every unit gets to exit after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Redis-backed distributed job service.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Distributed job service over a Redis work queue")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

/// Built-in handler that sleeps for `duration_secs` while honouring
/// cooperative stop and cancel commands. Registered so a fresh deployment
/// has something to smoke-test against.
struct SleepJob;

#[async_trait]
impl JobHandler for SleepJob {
    fn max_fails(&self) -> u32 {
        1
    }

    fn validate(&self, params: &Parameters) -> Result<(), ServiceError> {
        match params.get("duration_secs").and_then(|v| v.as_int()) {
            Some(secs) if secs >= 0 => Ok(()),
            Some(_) => Err(ServiceError::InvalidParams(
                "duration_secs must not be negative".into(),
            )),
            None => Err(ServiceError::InvalidParams(
                "duration_secs is required".into(),
            )),
        }
    }

    async fn run(
        &mut self,
        ctx: &JobContext,
        params: &Parameters,
        probe: &OpCommandProbe,
    ) -> Result<(), RunError> {
        let total = params
            .get("duration_secs")
            .and_then(|v| v.as_int())
            .unwrap_or(0);

        for elapsed in 0..total {
            match probe.check().await {
                Some(OpCommand::Stop) => return Err(RunError::Stopped),
                Some(OpCommand::Cancel) => return Err(RunError::Cancelled),
                None => {}
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            if elapsed % 10 == 9 {
                ctx.check_in(format!("slept {}s of {}s", elapsed + 1, total))
                    .await;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let log_file = logger::init(&config.logger).context("initialising logger")?;
    info!(
        log_file = %log_file.display(),
        namespace = %config.pool.redis_pool.namespace,
        "jobforge starting"
    );

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let namespace = Namespace::new(&config.pool.redis_pool.namespace);

    let redis_client = redis::Client::open(config.pool.redis_pool.url())
        .context("parsing redis endpoint")?;
    let conn = ConnectionManager::new(redis_client.clone())
        .await
        .context("dialing redis")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut task_handles = Vec::new();

    // Stats manager: single writer behind a bounded queue.
    let (stats, stats_handle) =
        StatsManager::start(conn.clone(), namespace.clone(), shutdown_tx.subscribe());
    task_handles.push(stats_handle);

    // Periodic scheduler: load persisted policies, then keep the store
    // coherent through the message bus.
    let scheduler = Arc::new(Scheduler::new(conn.clone(), namespace.clone()));
    let loaded = scheduler.load().await.context("loading periodic policies")?;
    info!(policies = loaded, "Periodic subsystem ready");

    let bus = scheduler
        .wire_bus(MessageBus::new(
            redis_client,
            conn.clone(),
            namespace.clone(),
        ))
        .on_register_hook(|hook| {
            // The hook map itself lives in Redis; peers only need to see
            // the registration happen.
            tracing::debug!(job_id = %hook.job_id, hook_url = %hook.hook_url, "Hook registered by a peer");
            Ok(())
        });
    task_handles.push(tokio::spawn(bus.run(shutdown_tx.subscribe())));

    let enqueuer = PeriodicEnqueuer::new(conn.clone(), namespace.clone(), scheduler.store());
    task_handles.push(enqueuer.spawn(shutdown_tx.subscribe()));

    // Handler registry is sealed before the pool starts.
    let mut registry = Registry::new();
    registry
        .register("sleep", true, || Box::new(SleepJob))
        .context("registering built-in handlers")?;
    let registry = Arc::new(registry);

    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig::new(config.pool.workers),
        conn,
        namespace,
        registry,
        stats.clone(),
        Arc::clone(&scheduler),
        shutdown_tx.clone(),
    ));
    let pool_handles = pool.start().context("starting worker pool")?;
    task_handles.extend(pool_handles);

    task_handles.push(logger::spawn_sweeper(
        config.logger.base_path.clone(),
        config.logger.archive_period,
        shutdown_tx.subscribe(),
    ));

    let controller = Arc::new(Controller::new(pool, stats));
    let server_shutdown = shutdown_tx.subscribe();
    let server_config = config.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(&server_config, controller, server_shutdown).await {
            error!(error = %e, "API server failed");
        }
    });

    wait_for_signal().await;
    info!("Shutdown signal received");

    // One broadcast reaches every unit; give them the grace window.
    let _ = shutdown_tx.send(());

    let drain = async {
        let _ = server_handle.await;
        for handle in task_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Grace window elapsed with tasks still running"
        );
    }

    info!("jobforge stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
