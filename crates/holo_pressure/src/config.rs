//! Command-line options and the validated run configuration.

use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::error::PressureError;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-pressure")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
}

/// CLI options for a pressure run.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Store host (RESP endpoint).
    #[arg(long, env = "HOLO_PRESSURE_HOST")]
    pub host: String,

    /// Store port.
    #[arg(long, env = "HOLO_PRESSURE_PORT")]
    pub port: u16,

    /// Size of the shared scalar payload in bytes.
    #[arg(long, env = "HOLO_PRESSURE_DATA_SIZE", default_value_t = 1024)]
    pub data_size: usize,

    /// Number of parallel read workers (and wide-hash population shards).
    #[arg(long, env = "HOLO_PRESSURE_CONNECTIONS", default_value_t = 10)]
    pub connections: usize,

    /// Number of raw-socket slow consumers draining `HGETALL large-hash`.
    #[arg(long, env = "HOLO_PRESSURE_SLOW_CONNECTIONS", default_value_t = 0)]
    pub slow_connections: usize,

    /// Number of scalar keys to populate and read.
    #[arg(long, env = "HOLO_PRESSURE_KEYS_COUNT")]
    pub keys_count: usize,

    /// Skip the population stage and read whatever the store already holds.
    #[arg(long, env = "HOLO_PRESSURE_SKIP_POPULATION")]
    pub skip_population: bool,

    /// Smallest per-read chunk used by slow consumers.
    #[arg(long, env = "HOLO_PRESSURE_RECV_CHUNK_SIZE_MIN", default_value_t = 1)]
    pub recv_chunk_size_min: usize,

    /// Largest per-read chunk used by slow consumers.
    #[arg(long, env = "HOLO_PRESSURE_RECV_CHUNK_SIZE_MAX", default_value_t = 1)]
    pub recv_chunk_size_max: usize,

    /// Seconds slow consumers sleep between reads (fractions allowed).
    #[arg(long, env = "HOLO_PRESSURE_RECV_SLEEP_TIME", default_value_t = 1.0)]
    pub recv_sleep_time: f64,

    /// Number of fields written into `large-hash`.
    #[arg(long, env = "HOLO_PRESSURE_HASH_FIELDS", default_value_t = 1_000_000)]
    pub hash_fields: usize,

    /// Size of each `large-hash` field value in bytes.
    #[arg(long, env = "HOLO_PRESSURE_HASH_FIELD_SIZE", default_value_t = 100)]
    pub hash_field_size: usize,

    /// Per-command timeout on pooled connections (network + server response).
    #[arg(long, env = "HOLO_PRESSURE_OP_TIMEOUT", default_value = "10s")]
    pub op_timeout: humantime::Duration,

    /// Bound on waiting for a pooled connection. Waits forever when unset.
    #[arg(long, env = "HOLO_PRESSURE_POOL_TIMEOUT")]
    pub pool_timeout: Option<humantime::Duration>,

    /// Stop after this long. Runs until Ctrl-C when unset.
    #[arg(long, env = "HOLO_PRESSURE_DURATION")]
    pub duration: Option<humantime::Duration>,

    /// Throughput sampling interval.
    #[arg(long, env = "HOLO_PRESSURE_REPORT_INTERVAL", default_value = "1s")]
    pub report_interval: humantime::Duration,
}

impl RunArgs {
    /// Validate the options and produce an immutable [`RunConfig`].
    pub fn into_config(self) -> Result<RunConfig, PressureError> {
        let config = RunConfig {
            host: self.host,
            port: self.port,
            data_size: self.data_size,
            connections: self.connections,
            slow_connections: self.slow_connections,
            keys_count: self.keys_count,
            skip_population: self.skip_population,
            recv_chunk_size_min: self.recv_chunk_size_min,
            recv_chunk_size_max: self.recv_chunk_size_max,
            recv_sleep_time: secs_to_duration(self.recv_sleep_time)?,
            hash_fields: self.hash_fields,
            hash_field_size: self.hash_field_size,
            op_timeout: self.op_timeout.into(),
            pool_timeout: self.pool_timeout.map(Into::into),
            duration: self.duration.map(Into::into),
            report_interval: self.report_interval.into(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Fully validated parameters for one run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub host: String,
    pub port: u16,
    pub data_size: usize,
    pub connections: usize,
    pub slow_connections: usize,
    pub keys_count: usize,
    pub skip_population: bool,
    pub recv_chunk_size_min: usize,
    pub recv_chunk_size_max: usize,
    pub recv_sleep_time: Duration,
    pub hash_fields: usize,
    pub hash_field_size: usize,
    pub op_timeout: Duration,
    pub pool_timeout: Option<Duration>,
    pub duration: Option<Duration>,
    pub report_interval: Duration,
}

impl RunConfig {
    /// Defaults matching the CLI, for embedding and tests.
    pub fn new(host: impl Into<String>, port: u16, keys_count: usize) -> Self {
        Self {
            host: host.into(),
            port,
            data_size: 1024,
            connections: 10,
            slow_connections: 0,
            keys_count,
            skip_population: false,
            recv_chunk_size_min: 1,
            recv_chunk_size_max: 1,
            recv_sleep_time: Duration::from_secs(1),
            hash_fields: 1_000_000,
            hash_field_size: 100,
            op_timeout: Duration::from_secs(10),
            pool_timeout: None,
            duration: None,
            report_interval: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> Result<(), PressureError> {
        if self.host.trim().is_empty() {
            return Err(PressureError::Config("--host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(PressureError::Config("--port must be > 0".into()));
        }
        if self.keys_count == 0 {
            return Err(PressureError::Config("--keys-count must be > 0".into()));
        }
        if self.slow_connections > 0 {
            if self.recv_chunk_size_min == 0 {
                return Err(PressureError::Config(
                    "--recv-chunk-size-min must be > 0".into(),
                ));
            }
            if self.recv_chunk_size_max < self.recv_chunk_size_min {
                return Err(PressureError::Config(format!(
                    "--recv-chunk-size-max ({}) must be >= --recv-chunk-size-min ({})",
                    self.recv_chunk_size_max, self.recv_chunk_size_min
                )));
            }
        }
        if self.op_timeout.is_zero() {
            return Err(PressureError::Config("--op-timeout must be > 0".into()));
        }
        if self.report_interval.is_zero() {
            return Err(PressureError::Config("--report-interval must be > 0".into()));
        }
        Ok(())
    }

    /// `host:port` as passed to `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Pool capacity: peak pooled usage across readers and slow clients.
    pub fn pool_capacity(&self) -> usize {
        (self.connections + self.slow_connections).max(1)
    }

    /// Approximate size of the populated wide hash in MiB.
    pub fn hash_size_mib(&self) -> f64 {
        (self.hash_fields as f64 * self.hash_field_size as f64) / (1024.0 * 1024.0)
    }
}

fn secs_to_duration(secs: f64) -> Result<Duration, PressureError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        PressureError::Config(format!(
            "--recv-sleep-time must be a finite, non-negative number of seconds (got {secs})"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<RunConfig, PressureError> {
        let mut argv = vec![
            "holo-pressure",
            "run",
            "--host",
            "127.0.0.1",
            "--port",
            "6379",
            "--keys-count",
            "100",
        ];
        argv.extend_from_slice(extra);
        let Args { cmd } = Args::try_parse_from(argv).expect("parse args");
        let Command::Run(args) = cmd;
        args.into_config()
    }

    #[test]
    fn defaults_follow_cli() {
        let config = parse(&[]).expect("valid config");
        assert_eq!(config.data_size, 1024);
        assert_eq!(config.connections, 10);
        assert_eq!(config.slow_connections, 0);
        assert_eq!(config.recv_chunk_size_min, 1);
        assert_eq!(config.recv_chunk_size_max, 1);
        assert_eq!(config.recv_sleep_time, Duration::from_secs(1));
        assert_eq!(config.hash_fields, 1_000_000);
        assert_eq!(config.hash_field_size, 100);
        assert_eq!(config.report_interval, Duration::from_secs(1));
        assert!(config.pool_timeout.is_none());
        assert!(config.duration.is_none());
        assert!(!config.skip_population);
        assert_eq!(config.addr(), "127.0.0.1:6379");
    }

    #[test]
    fn fractional_sleep_and_flags() {
        let config = parse(&[
            "--recv-sleep-time",
            "0.25",
            "--skip-population",
            "--duration",
            "30s",
        ])
        .expect("valid config");
        assert_eq!(config.recv_sleep_time, Duration::from_millis(250));
        assert!(config.skip_population);
        assert_eq!(config.duration, Some(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_zero_keys() {
        let err = parse(&["--keys-count", "0"]).unwrap_err();
        assert!(matches!(err, PressureError::Config(_)), "{err}");
    }

    #[test]
    fn rejects_inverted_chunk_range_only_with_slow_clients() {
        let err = parse(&[
            "--slow-connections",
            "2",
            "--recv-chunk-size-min",
            "9",
            "--recv-chunk-size-max",
            "1",
        ])
        .unwrap_err();
        assert!(matches!(err, PressureError::Config(_)), "{err}");

        parse(&["--recv-chunk-size-min", "9", "--recv-chunk-size-max", "1"])
            .expect("chunk sizes unused without slow clients");
    }

    #[test]
    fn rejects_negative_sleep() {
        let err = parse(&["--recv-sleep-time=-1"]).unwrap_err();
        assert!(matches!(err, PressureError::Config(_)), "{err}");
    }

    #[test]
    fn pool_capacity_never_zero() {
        let mut config = RunConfig::new("localhost", 6379, 1);
        config.connections = 0;
        config.slow_connections = 0;
        assert_eq!(config.pool_capacity(), 1);
        config.connections = 4;
        config.slow_connections = 2;
        assert_eq!(config.pool_capacity(), 6);
    }
}
