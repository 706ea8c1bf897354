//! Dataset population: flush, scalar keys, then the sharded wide hash.

use std::ops::Range;
use std::time::Instant;

use anyhow::Context;
use tokio::task::JoinSet;

use crate::client::{StoreConnection, StoreManager};
use crate::config::RunConfig;
use crate::datagen::generate_random_string;
use crate::error::PressureError;
use crate::pool::ConnectionPool;

/// Name of the wide aggregate drained by slow consumers.
pub const HASH_KEY: &str = "large-hash";

pub fn scalar_key(index: usize) -> String {
    format!("key-{index}")
}

pub fn hash_field(index: usize) -> String {
    format!("field-{index}")
}

/// What the population phase wrote.
#[derive(Clone, Debug, PartialEq)]
pub struct PopulationReport {
    pub keys: usize,
    pub hash_fields: usize,
    pub hash_size_mib: f64,
    /// Hash shard workers that ran; empty ranges are not counted.
    pub shards: usize,
}

/// Split `[0, total)` into `shards` contiguous ranges of `total / shards`
/// fields each; the last range absorbs the remainder. `shards == 0` falls
/// back to a single range.
pub fn shard_ranges(total: usize, shards: usize) -> Vec<Range<usize>> {
    let shards = shards.max(1);
    let per_shard = total / shards;
    (0..shards)
        .map(|i| {
            let start = i * per_shard;
            let end = if i == shards - 1 {
                total
            } else {
                start + per_shard
            };
            start..end
        })
        .collect()
}

/// Flush the store and write the full dataset. Any failure aborts the phase.
pub async fn populate(
    pool: &ConnectionPool<StoreManager>,
    config: &RunConfig,
) -> Result<PopulationReport, PressureError> {
    let started = Instant::now();

    let mut conn = pool
        .acquire()
        .await
        .map_err(|err| PressureError::population("acquire", err))?;
    let scalars = write_scalars(&mut conn, config).await;
    pool.release(conn, scalars.is_ok()).await;
    scalars?;

    let ranges = shard_ranges(config.hash_fields, config.connections);
    let mut workers = JoinSet::new();
    for (shard, range) in ranges.into_iter().enumerate() {
        if range.is_empty() {
            continue;
        }
        let pool = pool.clone();
        let field_size = config.hash_field_size;
        workers.spawn(async move { write_hash_shard(pool, shard, range, field_size).await });
    }

    let shards = workers.len();

    // Barrier: every shard must finish before traffic starts.
    while let Some(joined) = workers.join_next().await {
        let outcome = joined
            .map_err(|err| PressureError::population("hash shard join", err))
            .and_then(|res| res);
        if let Err(err) = outcome {
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            return Err(err);
        }
    }

    let report = PopulationReport {
        keys: config.keys_count,
        hash_fields: config.hash_fields,
        hash_size_mib: config.hash_size_mib(),
        shards,
    };
    tracing::info!(
        keys = report.keys,
        hash_fields = report.hash_fields,
        shards = report.shards,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "population complete"
    );
    Ok(report)
}

async fn write_scalars(conn: &mut StoreConnection, config: &RunConfig) -> Result<(), PressureError> {
    conn.flushdb()
        .await
        .map_err(|err| PressureError::population("flush", err))?;
    println!("Database flushed.");

    let value = generate_random_string(config.data_size);
    for i in 0..config.keys_count {
        let key = scalar_key(i);
        conn.set(&key, value.as_bytes())
            .await
            .with_context(|| format!("SET {key}"))
            .map_err(|err| PressureError::population("scalar keys", err))?;
    }
    println!("Populated DB with {} keys.", config.keys_count);
    Ok(())
}

async fn write_hash_shard(
    pool: ConnectionPool<StoreManager>,
    shard: usize,
    fields: Range<usize>,
    field_size: usize,
) -> Result<(), PressureError> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|err| PressureError::population("hash shard acquire", err))?;

    let mut result = Ok(());
    for j in fields.clone() {
        let field = hash_field(j);
        let value = generate_random_string(field_size);
        if let Err(err) = conn.hset(HASH_KEY, &field, value.as_bytes()).await {
            result = Err(PressureError::population(
                "wide hash",
                err.context(format!("HSET {HASH_KEY} {field} (shard {shard})")),
            ));
            break;
        }
    }

    let healthy = result.is_ok();
    pool.release(conn, healthy).await;
    if healthy {
        tracing::debug!(shard, start = fields.start, end = fields.end, "hash shard written");
    }
    result
}
