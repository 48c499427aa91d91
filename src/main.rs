//! Circuit Relay CLI - exercises the delivery protocol end to end.
//!
//! This is the binary entry point. See the `circuit_relay` library for the
//! protocol itself.

use std::time::Duration;

use anyhow::{Context, Result};
use circuit_relay::simulate::{self, SimulationOptions};
use circuit_relay::Config;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "circuit-relay")]
#[command(version)]
#[command(about = "Reliable render batch delivery and circuit reconnection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a prerender, boot, loss, disconnect and reconnect scenario in-process
    Simulate {
        /// Batches to produce after the first render
        #[arg(long, default_value_t = 20)]
        batches: u64,
        /// Probability that a message is lost in transit (0.0 - 1.0)
        #[arg(long, default_value_t = 0.1)]
        drop_rate: f64,
        /// Sever the connection after this many batches
        #[arg(long)]
        disconnect_after: Option<u64>,
        /// Pause between batches in milliseconds
        #[arg(long, default_value_t = 5)]
        interval_ms: u64,
        /// Override the acknowledgement timeout in milliseconds
        #[arg(long)]
        ack_timeout_ms: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("CIRCUIT_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            batches,
            drop_rate,
            disconnect_after,
            interval_ms,
            ack_timeout_ms,
        } => {
            let mut config = Config::load()?;
            if let Some(ms) = ack_timeout_ms {
                config.ack_timeout_ms = ms;
            }
            let options = SimulationOptions {
                batches,
                drop_rate,
                disconnect_after,
                interval: Duration::from_millis(interval_ms),
                ..SimulationOptions::default()
            };

            let rt = tokio::runtime::Runtime::new()?;
            let report = rt.block_on(simulate::run(&config, &options))?;

            println!("Batches enqueued:     {}", report.enqueued);
            println!("Batches applied:      {}", report.applied.len());
            println!("Still outstanding:    {}", report.outstanding);
            println!("Reconnect attempts:   {}", report.reconnect_attempts);
            println!("Acks given up:        {}", report.acks_exhausted);
            println!("Circuit failed:       {}", report.circuit_failed);
            println!(
                "Exactly once, in order: {}",
                if report.is_exactly_once() { "yes" } else { "no" }
            );
        }
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
