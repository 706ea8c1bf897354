//! Steady-state read traffic over pooled connections.

use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::StoreManager;
use crate::error::PressureError;
use crate::monitor::OpsCounter;
use crate::pool::ConnectionPool;
use crate::populate::scalar_key;

/// Pause after a failed borrow or read so an unreachable store is not hammered.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Per-worker totals returned when a reader stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub worker: usize,
    pub reads: u64,
    pub errors: u64,
}

/// Spawn `workers` readers issuing `GET key-<random>` until `cancel` fires.
pub fn spawn_readers(
    workers: usize,
    pool: ConnectionPool<StoreManager>,
    keys_count: usize,
    counter: OpsCounter,
    cancel: CancellationToken,
) -> JoinSet<ReaderStats> {
    let mut set = JoinSet::new();
    for worker in 0..workers {
        let pool = pool.clone();
        let counter = counter.clone();
        let cancel = cancel.clone();
        set.spawn(async move { run_reader(worker, pool, keys_count, counter, cancel).await });
    }
    set
}

async fn run_reader(
    worker: usize,
    pool: ConnectionPool<StoreManager>,
    keys_count: usize,
    counter: OpsCounter,
    cancel: CancellationToken,
) -> ReaderStats {
    let mut rng = SmallRng::from_entropy();
    let mut stats = ReaderStats {
        worker,
        ..ReaderStats::default()
    };
    let keys_count = keys_count.max(1);

    while !cancel.is_cancelled() {
        let acquired = tokio::select! {
            _ = cancel.cancelled() => break,
            acquired = pool.acquire() => acquired,
        };
        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(PressureError::PoolClosed) => break,
            Err(err) => {
                stats.errors += 1;
                tracing::warn!(worker, op = "acquire", error = %err, "reader failed to borrow connection");
                backoff(&cancel).await;
                continue;
            }
        };

        let key = scalar_key(rng.gen_range(0..keys_count));
        // Dropping `conn` mid-command on cancellation destroys it rather
        // than returning a socket with an unread reply to the pool.
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = conn.get(&key) => read,
        };

        match read {
            Ok(_) => {
                pool.release(conn, true).await;
                stats.reads += 1;
                counter.incr();
            }
            Err(err) => {
                pool.release(conn, false).await;
                stats.errors += 1;
                tracing::warn!(worker, op = "GET", key = %key, error = ?err, "reader read failed");
                backoff(&cancel).await;
            }
        }
    }

    tracing::debug!(worker, reads = stats.reads, errors = stats.errors, "reader stopped");
    stats
}

async fn backoff(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
    }
}
