//! Run orchestration: pool → population → traffic → monitor → shutdown.

use std::future::Future;
use std::ops::Deref;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::StoreManager;
use crate::config::RunConfig;
use crate::error::PressureError;
use crate::monitor::{run_monitor, MonitorSummary, OpsCounter};
use crate::pool::{ConnectionPool, PoolConfig, PoolState};
use crate::populate::{populate, PopulationReport, HASH_KEY};
use crate::readers::{spawn_readers, ReaderStats};
use crate::slow_consumer::{spawn_slow_consumers, SlowConsumerReport};

/// How long workers get to observe cancellation before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of a finished run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub population: Option<PopulationReport>,
    /// Shutdown was requested before traffic started.
    pub interrupted: bool,
    pub monitor: MonitorSummary,
    pub readers: Vec<ReaderStats>,
    pub slow_clients: Vec<SlowConsumerReport>,
    pub slow_client_failures: usize,
    pub pool: PoolState,
}

/// Owns the pool for the duration of a run and closes it on every exit path.
struct PoolGuard(ConnectionPool<StoreManager>);

impl Deref for PoolGuard {
    type Target = ConnectionPool<StoreManager>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Run until Ctrl-C, or until `config.duration` elapses when set.
pub async fn run(config: RunConfig) -> anyhow::Result<RunSummary> {
    let duration = config.duration;
    run_with_shutdown(config, async move {
        match duration {
            Some(limit) => tokio::select! {
                res = tokio::signal::ctrl_c() => res,
                _ = tokio::time::sleep(limit) => Ok(()),
            },
            None => tokio::signal::ctrl_c().await,
        }
    })
    .await
}

/// Run the full workload until `shutdown` resolves.
pub async fn run_with_shutdown<F>(config: RunConfig, shutdown: F) -> anyhow::Result<RunSummary>
where
    F: Future<Output = Result<(), std::io::Error>> + Send,
{
    config.validate()?;
    tokio::pin!(shutdown);

    let manager = StoreManager::new(config.addr(), config.op_timeout);
    let pool_config = PoolConfig {
        max_size: config.pool_capacity(),
        max_idle: config.connections.max(1),
        min_idle: 1,
        acquire_timeout: config.pool_timeout,
    };
    let pool = ConnectionPool::build(manager, pool_config)
        .await
        .with_context(|| format!("initialize connection pool for {}", config.addr()))?;
    let pool = PoolGuard(pool);
    tracing::info!(
        addr = %config.addr(),
        capacity = pool.config().max_size,
        "connection pool ready"
    );

    let population = if config.skip_population {
        println!("Skipping population stage.");
        None
    } else {
        let populated = tokio::select! {
            res = populate(&pool, &config) => Some(res.context("populate dataset")?),
            res = &mut shutdown => {
                log_shutdown_error(res);
                None
            }
        };
        let Some(report) = populated else {
            tracing::warn!("shutdown requested during population; traffic not started");
            pool.close();
            return Ok(RunSummary {
                population: None,
                interrupted: true,
                monitor: MonitorSummary::default(),
                readers: Vec::new(),
                slow_clients: Vec::new(),
                slow_client_failures: 0,
                pool: pool.state(),
            });
        };
        println!(
            "Populated DB with large hash: {}, containing {} fields (~{:.2} MB)",
            HASH_KEY, report.hash_fields, report.hash_size_mib
        );
        Some(report)
    };

    let cancel = CancellationToken::new();
    // Stops every worker if this function unwinds early.
    let _stop_workers = cancel.clone().drop_guard();

    let mut slow = if config.slow_connections > 0 {
        spawn_slow_consumers(&config, cancel.clone())
    } else {
        JoinSet::new()
    };
    let counter = OpsCounter::new();
    let mut readers = spawn_readers(
        config.connections,
        pool.clone(),
        config.keys_count,
        counter.clone(),
        cancel.clone(),
    );
    tracing::info!(
        readers = config.connections,
        slow_clients = config.slow_connections,
        "traffic started"
    );

    let monitor = run_monitor(counter, config.report_interval, cancel.clone(), |ops| {
        println!("Throughput: {ops} ops/sec");
    });
    let stop = async {
        log_shutdown_error((&mut shutdown).await);
        cancel.cancel();
    };
    let (monitor, ()) = tokio::join!(monitor, stop);

    println!("Shutting down...");
    pool.close();

    let reader_stats = drain_workers(&mut readers, "reader").await;
    let slow_results = drain_workers(&mut slow, "slow client").await;
    let mut slow_clients = Vec::new();
    let mut slow_client_failures = 0;
    for result in slow_results {
        match result {
            Ok(report) => slow_clients.push(report),
            Err(_) => slow_client_failures += 1,
        }
    }

    Ok(RunSummary {
        population,
        interrupted: false,
        monitor,
        readers: reader_stats,
        slow_clients,
        slow_client_failures,
        pool: pool.state(),
    })
}

/// Join every worker, aborting stragglers after the grace period.
async fn drain_workers<T: 'static>(set: &mut JoinSet<T>, kind: &'static str) -> Vec<T> {
    let mut out = Vec::with_capacity(set.len());
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok(value))) => out.push(value),
            Ok(Some(Err(err))) if err.is_cancelled() => {}
            Ok(Some(Err(err))) => {
                let err = PressureError::Shutdown(format!("{kind} task failed: {err}"));
                tracing::warn!(error = %err, "worker did not stop cleanly");
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(kind, remaining = set.len(), "aborting workers after shutdown grace period");
                set.abort_all();
                while set.join_next().await.is_some() {}
                break;
            }
        }
    }
    out
}

fn log_shutdown_error(res: Result<(), std::io::Error>) {
    if let Err(err) = res {
        let err = PressureError::Shutdown(format!("shutdown signal failed: {err}"));
        tracing::warn!(error = %err, "stopping anyway");
    }
}
