//! Sensor Relay CLI
//!
//! Command-line producer and consumers for a running relay:
//! - Send readings
//! - Watch the live stream
//! - Record the stream and export it
//! - Print a default config file

use anyhow::Context;
use clap::{Parser, Subcommand};
use sensor_relay::{generate_default_config, ExportFormat, History, RelayClient};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sensor-relay-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send, watch and record readings through a sensor relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Relay WebSocket URL
    #[arg(long, default_value = "ws://localhost:8080", global = true)]
    pub url: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send readings (from arguments, or one per line on stdin)
    Send {
        /// Values to send
        values: Vec<String>,
        /// Delay between readings in milliseconds
        #[arg(short, long, default_value = "0")]
        interval_ms: u64,
    },

    /// Print each reading as it arrives
    Watch {
        /// Stop after this many readings
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Record readings, then export them
    Record {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Export format (csv, json)
        #[arg(short, long, default_value = "csv")]
        format: ExportFormat,
        /// Stop after this many readings (default: until Ctrl+C)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensor_relay=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            values,
            interval_ms,
        } => send(&cli.url, values, Duration::from_millis(interval_ms)).await,
        Commands::Watch { count } => watch(&cli.url, count).await,
        Commands::Record {
            output,
            format,
            limit,
        } => record(&cli.url, &output, format, limit).await,
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(())
        }
    }
}

async fn send(url: &str, values: Vec<String>, interval: Duration) -> anyhow::Result<()> {
    let mut client = RelayClient::connect(url).await?;
    let mut sent = 0usize;

    if values.is_empty() {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            client.send_text(line).await?;
            sent += 1;
            pause(interval).await;
        }
    } else {
        for value in values {
            client.send_text(value).await?;
            sent += 1;
            pause(interval).await;
        }
    }

    client.close().await?;
    eprintln!("Sent {} reading(s) to {}", sent, url);
    Ok(())
}

async fn pause(interval: Duration) {
    if !interval.is_zero() {
        tokio::time::sleep(interval).await;
    }
}

fn report_close(client: &RelayClient) {
    match client.close_frame() {
        Some(frame) => eprintln!(
            "Relay closed the connection ({}: {})",
            u16::from(frame.code),
            frame.reason.as_str()
        ),
        None => eprintln!("Connection to the relay was closed"),
    }
}

async fn watch(url: &str, count: Option<usize>) -> anyhow::Result<()> {
    let mut client = RelayClient::connect(url).await?;
    eprintln!("Connected to {}, waiting for data...", url);

    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            frame = client.next_frame() => match frame? {
                Some(frame) => {
                    println!("{}", frame.to_text_lossy());
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
                None => {
                    report_close(&client);
                    return Ok(());
                }
            },
        }
    }

    client.close().await?;
    Ok(())
}

async fn record(
    url: &str,
    output: &Path,
    format: ExportFormat,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let mut client = RelayClient::connect(url).await?;
    let mut history = History::new();
    eprintln!("Recording from {} (Ctrl+C to stop)", url);

    let mut closed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            frame = client.next_frame() => match frame {
                Ok(Some(frame)) => {
                    let reading = history.push(&frame);
                    eprintln!("{}. {}", reading.index, reading.value);
                    if limit.is_some_and(|n| history.len() >= n) {
                        break;
                    }
                }
                Ok(None) => {
                    report_close(&client);
                    closed = true;
                    break;
                }
                // Keep what was recorded even if the relay went away
                Err(e) => {
                    eprintln!("Connection error: {}", e);
                    closed = true;
                    break;
                }
            },
        }
    }

    if !closed {
        client.close().await?;
    }

    history
        .save(output, format)
        .with_context(|| format!("exporting to {}", output.display()))?;
    println!(
        "Saved {} reading(s) to {} ({})",
        history.len(),
        output.display(),
        format
    );
    Ok(())
}
