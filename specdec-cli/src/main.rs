//! Process entry point for the speculative-decoding orchestrator: loads
//! configuration, wires a `TargetModel` and a `DraftModel`, and drives one
//! generation to completion, printing the typed event stream as JSON lines.

mod config;
mod draft_backend;

use std::sync::Arc;

use clap::Parser;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use specdec_core::draft::CandleDraftAdapter;
use specdec_core::events::Event;
use specdec_core::prompt_format::{formatter_for, TargetFamily};
use specdec_core::sink::EventSink;
use specdec_core::target::HttpTargetModel;
use specdec_core::{CancellationToken, Speculator, SpeculatorConfig};

use crate::config::AppConfig;
use crate::draft_backend::WordlistDraftBackend;

/// `specdec run "<prompt>"` drives a single generation against the
/// environment-configured target and prints its event stream to stdout.
#[derive(Parser, Debug)]
#[command(author, version, about = "Speculative-decoding orchestrator", long_about = None)]
struct Cli {
    /// The prompt to generate a continuation for.
    prompt: String,

    /// Override speculation_k for this invocation (§6.3 default: 8).
    #[arg(long)]
    k: Option<usize>,

    /// Override temperature for this invocation (§6.3 default: 0.7).
    #[arg(long)]
    temperature: Option<f64>,

    /// Override max_tokens for this invocation (§6.3 default: 512).
    #[arg(long)]
    max_tokens: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let app_config = AppConfig::from_env()?;

    let k = cli.k.unwrap_or(app_config.speculation_k);
    let temperature = cli.temperature.unwrap_or(app_config.temperature);
    let max_tokens = cli.max_tokens.unwrap_or(app_config.max_tokens);

    info!(
        target_model = %app_config.target_model,
        draft_model = %app_config.draft_model,
        k, temperature, max_tokens,
        "booting speculative-decoding orchestrator"
    );

    let target = Arc::new(HttpTargetModel::new(
        app_config.target_base_url.clone(),
        app_config.target_api_key.clone(),
        app_config.target_model.clone(),
        app_config.verify_timeout,
    ));

    let draft_rng = Isaac64Rng::from_entropy();
    let draft_backend = WordlistDraftBackend::default();
    let draft_adapter = CandleDraftAdapter::new(draft_backend, draft_rng, 20);
    let draft = Arc::new(Mutex::new(draft_adapter));

    let family = TargetFamily::from_model_id(&app_config.target_model);
    let formatter = formatter_for(family);

    let speculator = Speculator::new(
        draft,
        target,
        formatter,
        SpeculatorConfig {
            eos_token_ids: app_config.eos_token_ids.clone(),
            metrics_window: app_config.metrics_window,
            verify_timeout: app_config.verify_timeout,
            system_prompt: "You are a helpful assistant.".to_string(),
        },
    );

    let sink = StdoutEventSink;
    let cancel = CancellationToken::new();

    speculator
        .run(&cli.prompt, k, temperature, max_tokens, &sink, &cancel)
        .await?;

    Ok(())
}

/// Prints each event as a single line of JSON — the simplest possible
/// transport, suitable for piping into a front-end process over stdout the
/// way the rest of the `EventSink` family assumes a consumer sits on the
/// other end of some byte stream.
struct StdoutEventSink;

#[async_trait::async_trait]
impl EventSink for StdoutEventSink {
    async fn emit(&self, event: Event) -> specdec_core::Result<()> {
        let line = serde_json::to_string(&event)
            .map_err(|e| specdec_core::SpecdecError::InvalidRemote(e.to_string()))?;
        println!("{line}");
        Ok(())
    }
}
