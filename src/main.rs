// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_pipeline::config::LoggingConfig;
use telemetry_pipeline::{load_config_with_env, Pipeline, Priority, Record, TracingObserver};

/// Telemetry Pipeline - persist JSON-lines records and deliver them to the configured collectors
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// JSON-lines file with records to send (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Seconds to wait for the channels to drain before shutting down
    #[arg(long, default_value_t = 30)]
    drain_timeout: u64,
}

/// One input line
#[derive(Debug, Deserialize)]
struct InputRecord {
    destination: String,
    category: String,
    #[serde(default)]
    priority: Priority,
    payload: serde_json::Value,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default)]
    target_key: Option<String>,
}

impl From<InputRecord> for Record {
    fn from(input: InputRecord) -> Self {
        let mut record = Record::new(input.destination, input.category, input.payload)
            .with_priority(input.priority);
        record.metadata = input.metadata;
        record.auth_token = input.auth_token;
        record.target_key = input.target_key;
        record
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format.as_str() {
        "json" => builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e)),
        _ => builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e)),
    }
}

async fn enqueue_lines<R: AsyncBufRead + Unpin>(pipeline: &Pipeline, reader: R) -> Result<(usize, usize)> {
    let mut lines = reader.lines();
    let mut stored = 0;
    let mut rejected = 0;
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let input: InputRecord = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                warn!("Skipping line {}: {}", line_no, e);
                rejected += 1;
                continue;
            }
        };
        match pipeline.enqueue(input.into()).await {
            Some(_) => stored += 1,
            None => rejected += 1,
        }
    }

    Ok((stored, rejected))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let config = load_config_with_env(&args.config)?;

    init_logging(&config.logging)?;

    info!("Starting Telemetry Pipeline");
    info!("Loaded configuration from: {:?}", args.config);
    info!("Store backend: {} ({})", config.store.backend, config.store.path);

    let pipeline = Pipeline::start(&config, Arc::new(TracingObserver))?;
    info!("Install ID: {}", pipeline.install_id());

    let (stored, rejected) = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            enqueue_lines(&pipeline, BufReader::new(file)).await?
        }
        None => enqueue_lines(&pipeline, BufReader::new(tokio::io::stdin())).await?,
    };
    info!("Stored {} records ({} rejected)", stored, rejected);

    pipeline.flush_all();

    let timeout = Duration::from_secs(args.drain_timeout);
    tokio::select! {
        drained = pipeline.wait_drained(timeout) => {
            if drained {
                info!("All channels drained");
            } else {
                warn!("Drain timeout after {:?}, undelivered records stay in the store", timeout);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    for status in pipeline.status().await {
        info!(
            "Channel '{}': delivered={} discarded={} dropped={} pending={}",
            status.destination,
            status.delivered_records,
            status.discarded_records,
            status.dropped_records,
            status.pending
        );
    }

    // Cleanup
    pipeline.shutdown().await?;
    info!("Telemetry Pipeline shut down successfully");

    Ok(())
}
