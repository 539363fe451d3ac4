//! The DraftModel adapter (§4.2): normalizes raw logits into a proper
//! log-probability distribution, samples under temperature, and reports
//! entropy + a top-N alternatives list for visualization.
//!
//! The local tensor runtime itself (quantization, the actual forward pass)
//! is an out-of-scope external collaborator per spec §1 — this module only
//! owns the numerically load-bearing part: log-softmax normalization and
//! temperature-scaled sampling, grounded directly on
//! `mistralrs-core/src/sampler.rs` (`Sampler::sample`, `get_top_logprobs`),
//! adapted from base-10 logs to natural logs (`ln`) because this spec's
//! entropy and acceptance-ratio invariants are defined in nats.

use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::context::{DraftToken, TopAlt};
use crate::error::{Result, SpecdecError};

/// The out-of-scope boundary to the local tensor library: given the full
/// running context (prompt + committed + in-round draft tokens so far),
/// return one position's raw logit vector. Implementations own KV-cache
/// reuse, quantization, and device placement; none of that is this crate's
/// concern (spec §1, §4.2 "must carry KV-cache... for acceptable latency").
pub trait DraftBackend: Send {
    fn next_logits(&mut self, running_context: &[u32]) -> candle_core::Result<Tensor>;
    fn decode(&self, ids: &[u32]) -> candle_core::Result<String>;
    fn token_text(&self, id: u32) -> candle_core::Result<String>;
    /// Applies the draft tokenizer's chat template to a raw prompt, per
    /// §4.2's `get_tokenizer_prompt`.
    fn tokenizer_prompt(&self, prompt: &str) -> candle_core::Result<(String, Vec<u32>)>;
}

/// `draft(context_ids, k, temperature) -> Vec<DraftToken>`, plus the
/// tokenizer operations the orchestrator needs from the draft side.
pub trait DraftModel: Send {
    fn draft(
        &mut self,
        context_ids: &[u32],
        k: usize,
        temperature: f64,
    ) -> Result<(Vec<DraftToken>, f64)>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn tokenizer_prompt(&self, prompt: &str) -> Result<(String, Vec<u32>)>;
}

/// Default `DraftModel` implementation: wraps any `DraftBackend` and
/// performs the normalize/sample/entropy/top-k work that §4.2 requires of
/// every implementation, so individual backends cannot silently skip
/// log-softmax (the correctness requirement of §4.2 and §9).
pub struct CandleDraftAdapter<B, R> {
    backend: B,
    rng: R,
    top_n: usize,
}

impl<B: DraftBackend, R: Rng> CandleDraftAdapter<B, R> {
    pub fn new(backend: B, rng: R, top_n: usize) -> Self {
        Self {
            backend,
            rng,
            top_n: top_n.max(10),
        }
    }

    fn log_softmax(&self, logits: &Tensor, temperature: f64) -> candle_core::Result<Vec<f32>> {
        let logits = logits.to_dtype(DType::F32)?;
        let scaled = if temperature > 0.0 {
            (&logits / temperature)?
        } else {
            logits
        };
        let log_probs = candle_nn::ops::log_softmax(&scaled, candle_core::D::Minus1)?;
        log_probs.to_vec1::<f32>()
    }

    fn sample_one(
        &mut self,
        log_probs: &[f32],
        temperature: f64,
    ) -> (u32, f32) {
        if temperature <= 0.0 {
            let (idx, lp) = log_probs
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(i, p)| (i as u32, *p))
                .expect("non-empty vocabulary");
            return (idx, lp);
        }
        let weights: Vec<f32> = log_probs.iter().map(|lp| lp.exp()).collect();
        let dist = WeightedIndex::new(&weights).expect("normalized distribution");
        let idx = dist.sample(&mut self.rng) as u32;
        (idx, log_probs[idx as usize])
    }

    fn top_alternatives(&self, log_probs: &[f32]) -> candle_core::Result<Vec<TopAlt>> {
        let mut idx: Vec<usize> = (0..log_probs.len()).collect();
        idx.sort_by(|&a, &b| log_probs[b].total_cmp(&log_probs[a]));
        idx.truncate(self.top_n);
        idx.into_iter()
            .map(|i| {
                Ok(TopAlt {
                    token_id: i as u32,
                    token: self.backend.token_text(i as u32)?,
                    logprob: log_probs[i],
                })
            })
            .collect()
    }

    fn entropy_nats(log_probs: &[f32]) -> f32 {
        -log_probs
            .iter()
            .map(|lp| if lp.is_finite() { lp.exp() * lp } else { 0.0 })
            .sum::<f32>()
    }
}

impl<B: DraftBackend, R: Rng + Send> DraftModel for CandleDraftAdapter<B, R> {
    fn draft(
        &mut self,
        context_ids: &[u32],
        k: usize,
        temperature: f64,
    ) -> Result<(Vec<DraftToken>, f64)> {
        let start = std::time::Instant::now();
        let mut running = context_ids.to_vec();
        let mut out = Vec::with_capacity(k);

        for position in 0..k {
            let logits = self
                .backend
                .next_logits(&running)
                .map_err(|e| SpecdecError::LocalInference(e.to_string()))?;
            let log_probs = self
                .log_softmax(&logits, temperature)
                .map_err(|e| SpecdecError::LocalInference(e.to_string()))?;
            let (token_id, logprob_sampled) = self.sample_one(&log_probs, temperature);
            let token_text = self
                .backend
                .token_text(token_id)
                .map_err(|e| SpecdecError::LocalInference(e.to_string()))?;
            let top_alternatives = self
                .top_alternatives(&log_probs)
                .map_err(|e| SpecdecError::LocalInference(e.to_string()))?;
            let entropy = Self::entropy_nats(&log_probs);

            out.push(DraftToken {
                position,
                token_id,
                token_text,
                logprob_sampled,
                entropy,
                top_alternatives,
            });
            running.push(token_id);
        }

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        Ok((out, latency_ms))
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.backend
            .decode(ids)
            .map_err(|e| SpecdecError::LocalInference(e.to_string()))
    }

    fn tokenizer_prompt(&self, prompt: &str) -> Result<(String, Vec<u32>)> {
        self.backend
            .tokenizer_prompt(prompt)
            .map_err(|e| SpecdecError::LocalInference(e.to_string()))
    }
}
