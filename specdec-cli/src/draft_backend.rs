//! A bundled `DraftBackend` (§4.2's out-of-scope tensor-runtime boundary).
//!
//! Wiring a real local model (GGUF/safetensors loading, KV-cache-aware
//! forward passes, device placement) is explicitly out of scope for this
//! crate (spec §1) — that is `mistralrs-core`'s job, not this orchestrator's.
//! What ships here is the minimal concrete `DraftBackend` needed to drive
//! the binary end to end against a small fixed vocabulary, so `specdec run`
//! is runnable out of the box; swapping in a real backend means implementing
//! `specdec_core::draft::DraftBackend` against an actual model and passing
//! it to `CandleDraftAdapter::new` in `main.rs` instead of this one.

use candle_core::{Device, Tensor};

use specdec_core::draft::DraftBackend;

/// A small closed vocabulary of whole "words" so the demo's output reads as
/// text rather than as opaque token ids. Logits are derived deterministically
/// from the running context's last id, biased toward cycling forward through
/// the vocabulary — enough to exercise drafting, verification, and rejection
/// without needing a trained model on hand.
pub struct WordlistDraftBackend {
    vocab: Vec<&'static str>,
}

impl Default for WordlistDraftBackend {
    fn default() -> Self {
        Self {
            vocab: vec![
                "the", "a", "model", "drafts", "tokens", "and", "the", "verifier", "accepts",
                "or", "rejects", "them", "quickly", "end",
            ],
        }
    }
}

impl WordlistDraftBackend {
    fn logits_for(&self, running_context: &[u32]) -> Vec<f32> {
        let last = *running_context.last().unwrap_or(&0) as usize;
        let n = self.vocab.len();
        (0..n)
            .map(|i| {
                let distance = (i + n - (last + 1) % n) % n;
                5.0 - distance as f32 * 0.4
            })
            .collect()
    }
}

impl DraftBackend for WordlistDraftBackend {
    fn next_logits(&mut self, running_context: &[u32]) -> candle_core::Result<Tensor> {
        let logits = self.logits_for(running_context);
        Tensor::from_slice(&logits, (logits.len(),), &Device::Cpu)
    }

    fn decode(&self, ids: &[u32]) -> candle_core::Result<String> {
        Ok(ids
            .iter()
            .map(|&id| self.vocab.get(id as usize).copied().unwrap_or("<unk>"))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn token_text(&self, id: u32) -> candle_core::Result<String> {
        Ok(self
            .vocab
            .get(id as usize)
            .copied()
            .unwrap_or("<unk>")
            .to_string())
    }

    fn tokenizer_prompt(&self, prompt: &str) -> candle_core::Result<(String, Vec<u32>)> {
        let ids: Vec<u32> = prompt
            .split_whitespace()
            .map(|w| {
                self.vocab
                    .iter()
                    .position(|v| *v == w)
                    .unwrap_or(0) as u32
            })
            .collect();
        Ok((prompt.to_string(), ids))
    }
}
