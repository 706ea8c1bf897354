//! Load harness entry point.
//!
//! Populates the store, then drives pooled GET traffic and optional slow
//! HGETALL consumers, printing throughput once per interval until Ctrl-C.

use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;
use holo_pressure::config::{Args, Command};
use holo_pressure::{RunArgs, RunConfig};

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> ExitCode {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("Starting holo-pressure...");
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let usage_error = err.use_stderr();
            let _ = err.print();
            return if usage_error {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let result = match args.cmd {
        // Run the workload until interrupted.
        Command::Run(args) => run(args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error running holo-pressure: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.into_config()?;
    print_banner(&config);

    println!("Starting test execution...");
    let summary = holo_pressure::run(config).await?;

    let reads: u64 = summary.readers.iter().map(|r| r.reads).sum();
    let read_errors: u64 = summary.readers.iter().map(|r| r.errors).sum();
    tracing::info!(
        ticks = summary.monitor.ticks,
        sampled_ops = summary.monitor.total_ops,
        peak_ops = summary.monitor.peak_ops,
        reads,
        read_errors,
        slow_clients_finished = summary.slow_clients.len(),
        slow_client_failures = summary.slow_client_failures,
        pool_closed = summary.pool.closed,
        "run finished"
    );
    println!("Shutdown complete.");
    Ok(())
}

fn print_banner(config: &RunConfig) {
    println!("Configuration:");
    println!("  Host: {}", config.host);
    println!("  Port: {}", config.port);
    println!("  Keys Count: {}", config.keys_count);
    println!("  Data Size: {} bytes", config.data_size);
    println!("  Connections: {}", config.connections);
    println!("  Slow Connections: {}", config.slow_connections);
    if config.slow_connections > 0 {
        println!(
            "  Slow Recv: {}..={} bytes every {:?}",
            config.recv_chunk_size_min, config.recv_chunk_size_max, config.recv_sleep_time
        );
    }
    println!(
        "  Large Hash: {} fields x {} bytes",
        config.hash_fields, config.hash_field_size
    );
    println!("  Skip Population: {}", config.skip_population);
    if let Some(duration) = config.duration {
        println!("  Duration: {}", humantime::format_duration(duration));
    }
}
