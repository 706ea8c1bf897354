//! Error taxonomy shared by the pool, the workload phases, and the runner.

use std::time::Duration;

/// Typed failures callers need to branch on.
///
/// Read workers match on these to tell a closed pool (stop) apart from
/// transient noise (log and continue); the runner wraps them in
/// `anyhow::Error` with added context.
#[derive(Debug, thiserror::Error)]
pub enum PressureError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no pooled connection became available within {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("connection to {addr} failed")]
    Connection {
        addr: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("population failed during {stage}")]
    Population {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("slow client {index} failed")]
    SlowConsumer {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("shutdown: {0}")]
    Shutdown(String),
}

impl PressureError {
    pub fn population(stage: &'static str, source: impl Into<anyhow::Error>) -> Self {
        PressureError::Population {
            stage,
            source: source.into(),
        }
    }
}
