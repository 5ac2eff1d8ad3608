//! Signal Engine - JSON lines driver
//!
//! Reads evaluation requests from stdin, one JSON document per line, and
//! writes one result per line to stdout:
//! - an object `{"instrument": "BTC", "scores": [...], "as_of": "..."}` is evaluated alone
//! - an array of such objects is evaluated as a batch, leader first
//!
//! Configuration comes from the file named by `SIGNAL_ENGINE_CONFIG` (optional)
//! plus `SIGNAL_ENGINE__*` environment overrides. Logs go to stderr.

use anyhow::Context;
use serde::Deserialize;
use signal_engine::{AggregationResult, EngineConfig, EvaluationRequest, SignalEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Engine entry point
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Signal Engine...");

    let config_path = std::env::var("SIGNAL_ENGINE_CONFIG").ok().map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref()).context("Invalid engine configuration")?;
    info!(
        "Leader: {}, instruments: {}",
        config.correlation.leader,
        config.instruments.keys().cloned().collect::<Vec<_>>().join(", ")
    );

    let engine = Arc::new(SignalEngine::new(config)?);
    run(&engine).await?;

    let snapshot = engine.metrics().snapshot().await;
    info!("Finished: {}", serde_json::to_string(&snapshot)?);
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Input {
    Batch(Vec<EvaluationRequest>),
    Single(EvaluationRequest),
}

async fn run(engine: &Arc<SignalEngine>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let results: Vec<Option<AggregationResult>> = match serde_json::from_str::<Input>(line) {
            Ok(Input::Single(request)) => vec![Some(engine.evaluate(request).await)],
            Ok(Input::Batch(requests)) => engine.evaluate_batch(requests).await,
            Err(e) => {
                warn!("Skipping malformed request: {}", e);
                let error = serde_json::json!({ "error": e.to_string() });
                stdout.write_all(format!("{}\n", error).as_bytes()).await?;
                continue;
            }
        };

        for result in results {
            let mut out = match result {
                Some(result) => serde_json::to_string(&result)?,
                None => serde_json::json!({ "error": "evaluation failed" }).to_string(),
            };
            out.push('\n');
            stdout.write_all(out.as_bytes()).await?;
        }
        stdout.flush().await?;
    }
    Ok(())
}
