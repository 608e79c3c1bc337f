//! Ring Monitor - decode a relayed ring stream or fit a clock model
//!
//! ## Usage
//!
//! ```bash
//! # Wait for the relay helper on port 9000 and print events as JSON lines
//! ring-monitor listen --port 9000 --protocol opcode-v2
//!
//! # Fit a clock model from recorded calibration samples
//! ring-monitor fit --input samples.json
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` to change the filter.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use ring_core::calibration::evaluate;
use ring_core::{CalibrationConfig, CalibrationReport, CalibrationSample, ProtocolKind, RelayFraming};
use ring_session::{RelayTransport, RingSession, SessionConfig, SessionState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ring-monitor")]
#[command(about = "Decode smart-ring telemetry and fit device clock models")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept one relay helper connection and print decoded events
    Listen {
        /// TCP port the relay helper connects to
        #[arg(short, long, default_value_t = 9000)]
        port: u16,

        /// Firmware family: legacy, opcode-v2 or zhw
        #[arg(long, default_value = "opcode-v2", value_parser = parse_protocol)]
        protocol: ProtocolKind,

        /// Relay framing: headered or raw
        #[arg(long, default_value = "headered", value_parser = parse_framing)]
        framing: RelayFraming,

        /// Session configuration JSON (overrides --protocol)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Device label used in logs and reports
        #[arg(long, default_value = "relay")]
        address: String,
    },

    /// Fit a clock model from a JSON array of calibration samples
    Fit {
        #[arg(short, long)]
        input: PathBuf,

        /// Latency cutoff in seconds
        #[arg(long)]
        max_latency: Option<f64>,

        /// Accepted samples below which the fit is flagged insufficient
        #[arg(long)]
        min_samples: Option<usize>,
    },
}

fn parse_protocol(name: &str) -> Result<ProtocolKind, String> {
    ProtocolKind::from_name(name).ok_or_else(|| format!("unknown protocol '{name}'"))
}

fn parse_framing(name: &str) -> Result<RelayFraming, String> {
    RelayFraming::from_name(name).ok_or_else(|| format!("unknown framing '{name}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ring_session=info,ring_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Args::parse().command {
        Commands::Listen {
            port,
            protocol,
            framing,
            config,
            address,
        } => listen(port, protocol, framing, config, address).await,
        Commands::Fit {
            input,
            max_latency,
            min_samples,
        } => fit(input, max_latency, min_samples),
    }
}

async fn listen(
    port: u16,
    protocol: ProtocolKind,
    framing: RelayFraming,
    config: Option<PathBuf>,
    address: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::new(address, protocol),
    };

    let transport = RelayTransport::bind(&format!("0.0.0.0:{port}"), framing).await?;
    tracing::info!("Waiting for relay helper on port {}", port);

    let session = RingSession::new(config, Arc::new(transport));
    let mut events = session.subscribe();
    session.connect().await?;
    session.start_streaming().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if session.state() == SessionState::Disconnected {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing session");
                session.disconnect().await?;
                break;
            }
        }
    }

    let stats = session.stats();
    eprintln!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

fn fit(
    input: PathBuf,
    max_latency: Option<f64>,
    min_samples: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(&input)?;
    let samples: Vec<CalibrationSample> = serde_json::from_str(&content)?;

    let mut config = CalibrationConfig::default();
    if let Some(max_latency) = max_latency {
        config.max_latency = max_latency;
    }
    if let Some(min_samples) = min_samples {
        config.min_samples = min_samples;
    }
    config.validate()?;

    let outcome = evaluate(&samples, &config);
    for warning in &outcome.warnings {
        tracing::warn!("{:?}", warning);
    }

    let device = input.display().to_string();
    match CalibrationReport::from_outcome(device, &outcome, Utc::now()) {
        Some(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        None => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Err(format!("no clock model from {} sample(s)", samples.len()).into())
        }
    }
}
