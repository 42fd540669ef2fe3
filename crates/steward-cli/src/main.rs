//! steward - job-retention controller with optional leader election
//!
//! Runs entirely in-process: the jobs live in an in-memory change source and
//! `--replicas` candidates compete for one in-memory lease, so leader
//! election and failover can be watched in the logs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Duration as ChronoDuration;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use steward_core::app::{Controller, ControllerBuilder, RetentionReconciler, supervise};
use steward_core::election::{
    DEFAULT_COMPONENT, DEFAULT_LOCK_NAME, ElectionConfig, IDENTITY_ENV, LeaderElector, NAMESPACE_ENV,
};
use steward_core::error::ConfigError;
use steward_core::impls::{InMemoryChangeSource, InMemoryLeaseStore};
use steward_core::ports::{ChangeSource, Clock, JobClient, LeaseStore, SystemClock};
use steward_core::Job;

#[derive(Parser, Debug, Clone)]
#[command(name = "steward")]
#[command(about = "Deletes completed jobs past their retention, run by one elected replica", long_about = None)]
#[command(version)]
struct Cli {
    /// Candidate identity; defaults to <host name>_<unique suffix>
    #[arg(long, env = IDENTITY_ENV)]
    holder_identity: Option<String>,

    /// Name of the lease lock
    #[arg(long, default_value = DEFAULT_LOCK_NAME)]
    lease_lock_name: String,

    /// Namespace of the lease lock; required with --leader-elect
    #[arg(long, env = NAMESPACE_ENV)]
    lease_lock_namespace: Option<String>,

    /// Group name used in logs
    #[arg(long, default_value = DEFAULT_COMPONENT)]
    component: String,

    #[arg(long, default_value_t = 15)]
    lease_duration_secs: u64,

    #[arg(long, default_value_t = 10)]
    renew_deadline_secs: u64,

    #[arg(long, default_value_t = 2)]
    retry_period_secs: u64,

    /// How often every cached job is re-delivered to the controller
    #[arg(long, default_value_t = 30)]
    resync_period_secs: u64,

    /// Seconds a completed job is kept before deletion (default 10 days)
    #[arg(long, default_value_t = 864_000)]
    retention: u64,

    /// Concurrent reconcile workers
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Run the controller only while holding the lease
    #[arg(long)]
    leader_elect: bool,

    /// Candidates to start in this process when --leader-elect is set
    #[arg(long, default_value_t = 3)]
    replicas: usize,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_level.into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, shutting down");
            }
            shutdown.cancel();
        }
    });

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jobs = seed_jobs(clock.as_ref());
    let resync = jobs.spawn_resync(Duration::from_secs(cli.resync_period_secs), shutdown.clone());

    // 起動前に一度組み立てて設定ミスを検出する
    let controller = retention_controller(&cli, &jobs, &clock)?;

    if cli.leader_elect {
        drop(controller);
        run_elected(&cli, &jobs, &clock, shutdown).await?;
    } else {
        controller.watch(jobs.as_ref());
        controller.run(shutdown).await?;
    }

    if let Err(err) = resync.await {
        error!(error = %err, "resync task failed");
    }
    Ok(())
}

fn retention_controller(
    cli: &Cli,
    jobs: &Arc<InMemoryChangeSource<Job>>,
    clock: &Arc<dyn Clock>,
) -> Result<Controller, ConfigError> {
    let client: Arc<dyn JobClient> = jobs.clone();
    let synced = Arc::clone(jobs);
    ControllerBuilder::new("job-retention")
        .reconciler(
            RetentionReconciler::new(client, Arc::clone(clock))
                .with_retention(Duration::from_secs(cli.retention)),
        )
        .readiness(move || synced.has_synced())
        .workers(cli.workers)
        .ignore_deletes()
        .build()
}

async fn run_elected(
    cli: &Cli,
    jobs: &Arc<InMemoryChangeSource<Job>>,
    clock: &Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let mut tasks = JoinSet::new();

    for replica in 0..cli.replicas.max(1) {
        let config = election_config(cli, replica)
            .resolve()
            .context("invalid leader election configuration")?;
        info!(identity = %config.identity, lock = %config.lock_key(), "starting candidate");
        let (elector, events) = LeaderElector::new(config, Arc::clone(&store), Arc::clone(clock))?;

        let token = shutdown.clone();
        tasks.spawn(async move { elector.run(token).await });

        let (cli, jobs, clock) = (cli.clone(), Arc::clone(jobs), Arc::clone(clock));
        tasks.spawn(supervise(events, move |ctx| {
            let controller = retention_controller(&cli, &jobs, &clock);
            let jobs = Arc::clone(&jobs);
            async move {
                let controller = match controller {
                    Ok(controller) => controller,
                    Err(err) => {
                        error!(error = %err, "failed to build controller");
                        return;
                    }
                };
                controller.watch(jobs.as_ref());
                if let Err(err) = controller.run(ctx.token().clone()).await {
                    error!(identity = %ctx.identity(), error = %err, "controller stopped");
                }
            }
        }));
    }

    while tasks.join_next().await.is_some() {}
    Ok(())
}

fn election_config(cli: &Cli, replica: usize) -> ElectionConfig {
    let namespace = cli.lease_lock_namespace.clone().unwrap_or_default();
    let mut config = ElectionConfig::new(namespace)
        .with_lock_name(&cli.lease_lock_name)
        .with_component(&cli.component)
        .with_timing(
            Duration::from_secs(cli.lease_duration_secs),
            Duration::from_secs(cli.renew_deadline_secs),
            Duration::from_secs(cli.retry_period_secs),
        );
    if let Some(identity) = &cli.holder_identity {
        config = match cli.replicas {
            0 | 1 => config.with_identity(identity),
            _ => config.with_identity(format!("{identity}-{replica}")),
        };
    }
    config
}

/// A few jobs in every interesting state.
fn seed_jobs(clock: &dyn Clock) -> Arc<InMemoryChangeSource<Job>> {
    let now = clock.now();
    let jobs = Arc::new(InMemoryChangeSource::new());
    jobs.upsert(Job::completed("batch", "nightly-report-0301", now - ChronoDuration::days(11)));
    jobs.upsert(Job::completed("batch", "nightly-report-0310", now - ChronoDuration::hours(1)));
    jobs.upsert(Job::completed("etl", "backfill", now - ChronoDuration::days(30)));
    jobs.upsert(Job::running("etl", "ingest"));
    jobs.mark_synced();
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_controller_builds_from_default_flags() {
        let cli = Cli::parse_from(["steward"]);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let jobs = seed_jobs(clock.as_ref());

        assert!(retention_controller(&cli, &jobs, &clock).is_ok());
    }

    #[test]
    fn zero_workers_is_rejected_before_start() {
        let cli = Cli::parse_from(["steward", "--workers", "0"]);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let jobs = seed_jobs(clock.as_ref());

        assert!(retention_controller(&cli, &jobs, &clock).is_err());
    }

    #[test]
    fn replica_identities_get_an_index_suffix() {
        let cli = Cli::parse_from([
            "steward",
            "--holder-identity",
            "node",
            "--lease-lock-namespace",
            "default",
            "--replicas",
            "2",
        ]);
        let config = election_config(&cli, 1).resolve_with(|_| None).unwrap();
        assert_eq!(config.identity, "node-1");
    }
}
