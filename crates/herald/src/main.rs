//! Herald binary entry point.
//!
//! Usage: herald [--brokers <list>] [--config <file>] ping [--topic <t>] [--payload <p>]
//!
//! `ping` publishes the same payload on an interval, waits for each
//! acknowledgment, and closes the producer cleanly on Ctrl-C.

use anyhow::Context;
use clap::{Parser, Subcommand};
use herald::{DeliveryError, Producer, ProducerConfig, Record};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Herald: batching message producer.
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(about = "Durable message producer with per-record delivery tracking")]
struct Args {
    /// Broker endpoints, comma separated (host[:port]).
    #[arg(long, env = "HERALD_BROKERS", value_delimiter = ',', global = true)]
    brokers: Option<Vec<String>>,

    /// JSON config file. Environment overrides still apply.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Write JSON lines logs to this file instead of plain stderr output.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Wait up to this many seconds for every broker to accept connections.
    #[arg(long, global = true)]
    wait_ready_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a payload repeatedly and report each delivery.
    Ping(PingArgs),
}

#[derive(clap::Args, Debug)]
struct PingArgs {
    #[arg(long, default_value = "ledgerfun")]
    topic: String,

    #[arg(long, default_value = "ping!")]
    payload: String,

    /// Pin records to this partition.
    #[arg(long)]
    partition: Option<u32>,

    /// Pause between sends, in milliseconds.
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// How long to wait for each acknowledgment, in seconds.
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Stop after this many sends. Runs until interrupted when absent.
    #[arg(long)]
    count: Option<u64>,

    /// Time allowed for in-flight records on shutdown, in seconds.
    #[arg(long, default_value = "10")]
    close_timeout_secs: u64,
}

fn load_config(args: &Args) -> anyhow::Result<ProducerConfig> {
    let mut config = match &args.config {
        Some(path) => ProducerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ProducerConfig::from_env().context("reading HERALD_* environment")?,
    };

    if let Some(brokers) = &args.brokers {
        config.brokers = brokers.clone();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn ping(producer: &Producer, args: &PingArgs) -> anyhow::Result<()> {
    let wait = Duration::from_secs(args.timeout_secs);
    let interval = Duration::from_millis(args.interval_ms);
    let mut sent = 0u64;

    loop {
        let mut record = Record::new(args.topic.clone(), args.payload.as_bytes().to_vec());
        if let Some(partition) = args.partition {
            record = record.with_partition(partition);
        }

        let mut handle = producer.send_record(record)?;
        match handle.wait(wait).await {
            Ok(ack) => {
                info!(
                    topic = %ack.destination.topic,
                    offset = ?ack.offset,
                    attempts = ack.attempts,
                    "sent"
                );
            }
            Err(DeliveryError::Timeout(elapsed)) => {
                warn!(record_id = %handle.record_id(), ?elapsed, "No acknowledgment yet, withdrawing");
                handle.cancel();
            }
            Err(e) => {
                error!(record_id = %handle.record_id(), error = %e, "Delivery failed");
            }
        }

        sent += 1;
        if args.count.is_some_and(|count| sent >= count) {
            return Ok(());
        }

        tokio::time::sleep(interval).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let format = match args.log_file {
        Some(_) => observability::LogFormat::Json,
        None => observability::LogFormat::Compact,
    };
    observability::init_with_config(observability::LogConfig {
        service_name: "herald".into(),
        default_level: args.log_level.clone(),
        format,
        log_path: args.log_file.clone(),
        also_stderr: true,
    })
    .context("initializing logging")?;

    let config = load_config(&args)?;
    info!(
        brokers = ?config.brokers,
        client_id = %config.client_id,
        acks = ?config.required_acks,
        "Configuration loaded"
    );

    let producer = Producer::start(config)?;

    if let Some(secs) = args.wait_ready_secs {
        producer.wait_ready(Duration::from_secs(secs)).await?;
    }

    let Command::Ping(ping_args) = &args.command;
    let close_timeout = Duration::from_secs(ping_args.close_timeout_secs);

    let outcome = tokio::select! {
        result = ping(&producer, ping_args) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, closing...");
            Ok(())
        }
    };

    if let Err(e) = producer.close(close_timeout).await {
        warn!(error = %e, "Shutdown incomplete");
    }

    outcome
}
