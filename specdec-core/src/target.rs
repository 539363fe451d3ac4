//! The TargetModel client (§4.3): a completions-style HTTP verifier.
//!
//! Connection pooling and auth plumbing are out of scope (spec §1); what is
//! in scope is the semantic contract — native-template prompt construction,
//! requesting enough top-logprobs to judge and resample, temperature
//! flooring, and the single-retry policy of §7. Request/response shape is
//! grounded on the OpenAI-style completions clients in the retrieval pack
//! (`other_examples/78020a88_Aandreba-libopenai__src-completion.rs.rs`,
//! `other_examples/58c29ab3_tukanoidd-openai_api_rs__src-request.rs.rs`),
//! which is the same shape the teacher's own `reqwest` dependency is meant
//! to speak to a hosted inference API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::{TargetPositionInfo, TopAlt};
use crate::error::{Result, SpecdecError};

/// Minimum logprobs requested per position (§4.3: "top-N with N >= 20").
pub const MIN_TOP_N: u32 = 20;
/// Temperature floor used when the caller requests 0 (§4.3, §9): many
/// providers refuse to return logprobs at literal T=0.
pub const TEMPERATURE_FLOOR: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub positions: Vec<TargetPositionInfo>,
    pub latency_ms: f64,
}

/// `verify(prompt_text, k_plus_one, temperature) -> VerificationResult`.
///
/// `prompt_text` arrives already formatted for the target's native template
/// (§4.1 step 2: "build the target-model input as a single formatted
/// prompt") — the `TargetModel` sends it as-is and does no further
/// templating of its own.
#[async_trait]
pub trait TargetModel: Send + Sync {
    async fn verify(
        &self,
        prompt_text: &str,
        k_plus_one: usize,
        temperature: f64,
    ) -> Result<VerificationResult>;
}

/// A `reqwest`-backed completions client speaking an OpenAI-compatible
/// `/v1/completions` surface with `logprobs` requested per position.
pub struct HttpTargetModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    verify_timeout: Duration,
}

impl HttpTargetModel {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            verify_timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/completions", self.base_url.trim_end_matches('/'))
    }

    async fn send_once(&self, body: &CompletionsRequest<'_>) -> Result<CompletionsResponse> {
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .timeout(self.verify_timeout)
            .send()
            .await
            .map_err(|e| SpecdecError::TransientRemote(e.to_string()))?;

        if resp.status().is_server_error() || resp.status() == reqwest::StatusCode::REQUEST_TIMEOUT {
            return Err(SpecdecError::TransientRemote(format!(
                "status {}",
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(SpecdecError::InvalidRemote(format!(
                "status {}",
                resp.status()
            )));
        }

        resp.json::<CompletionsResponse>()
            .await
            .map_err(|e| SpecdecError::InvalidRemote(e.to_string()))
    }
}

#[async_trait]
impl TargetModel for HttpTargetModel {
    async fn verify(
        &self,
        prompt_text: &str,
        k_plus_one: usize,
        temperature: f64,
    ) -> Result<VerificationResult> {
        let effective_temperature = if temperature <= 0.0 {
            TEMPERATURE_FLOOR
        } else {
            temperature
        };
        let body = CompletionsRequest {
            model: &self.model,
            prompt: prompt_text,
            max_tokens: k_plus_one as u32,
            temperature: effective_temperature,
            logprobs: MIN_TOP_N,
            echo: false,
        };

        let start = Instant::now();
        let mut result = self.send_once(&body).await;
        if let Err(SpecdecError::TransientRemote(ref msg)) = result {
            warn!(error = %msg, "target model transport failed, retrying once");
            tokio::time::sleep(Duration::from_millis(250)).await;
            result = self.send_once(&body).await;
        }
        let resp = result?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let positions = parse_positions(resp, k_plus_one)?;
        Ok(VerificationResult {
            positions,
            latency_ms,
        })
    }
}

fn parse_positions(resp: CompletionsResponse, _k_plus_one: usize) -> Result<Vec<TargetPositionInfo>> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| SpecdecError::InvalidRemote("no choices in response".into()))?;
    let logprobs = choice
        .logprobs
        .ok_or_else(|| SpecdecError::InvalidRemote("response carried no logprobs".into()))?;

    if logprobs.tokens.len() != logprobs.token_logprobs.len()
        || logprobs.tokens.len() != logprobs.top_logprobs.len()
    {
        return Err(SpecdecError::InvalidRemote(
            "mismatched logprob array lengths".into(),
        ));
    }

    let mut positions = Vec::with_capacity(logprobs.tokens.len());
    for (i, token_text) in logprobs.tokens.iter().enumerate() {
        let mut alts: Vec<TopAlt> = logprobs.top_logprobs[i]
            .iter()
            .map(|(text, (id, lp))| TopAlt {
                token_id: *id,
                token: text.clone(),
                logprob: *lp as f32,
            })
            .collect();
        alts.sort_by(|a, b| b.logprob.total_cmp(&a.logprob));

        let entropy = -alts
            .iter()
            .map(|a| a.logprob.exp() * a.logprob)
            .sum::<f32>();

        positions.push(TargetPositionInfo {
            position: i,
            token_id: logprobs.token_ids.get(i).copied().unwrap_or(0),
            token_text: token_text.clone(),
            top_alternatives: alts,
            entropy,
        });
    }
    Ok(positions)
}

#[derive(Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f64,
    logprobs: u32,
    echo: bool,
}

#[derive(Deserialize)]
struct CompletionsResponse {
    choices: Vec<CompletionsChoice>,
}

#[derive(Deserialize)]
struct CompletionsChoice {
    #[serde(default)]
    logprobs: Option<CompletionsLogprobs>,
}

/// A provider-agnostic shape: per-position sampled token/id plus a map of
/// alternative token text to `(token_id, logprob)`. Real providers vary in
/// exact field names; adapting this struct's `Deserialize` to a specific
/// provider's wire format is a formatting concern, not a semantic one.
#[derive(Deserialize)]
struct CompletionsLogprobs {
    tokens: Vec<String>,
    token_logprobs: Vec<f64>,
    #[serde(default)]
    token_ids: Vec<u32>,
    top_logprobs: Vec<std::collections::HashMap<String, (u32, f64)>>,
}
