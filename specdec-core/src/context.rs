use serde::{Deserialize, Serialize};

/// One `(token id, token text, logprob)` entry in a top-alternatives list,
/// shared by draft and target positions alike. The id is carried alongside
/// the text (spec §3 names only the text) because the residual-distribution
/// computation in `rejection` needs to union draft/target alternatives by
/// identity, and draft/target are required to share one vocabulary (see
/// `Speculator::new`'s tokenizer-compatibility check).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopAlt {
    pub token_id: u32,
    pub token: String,
    pub logprob: f32,
}

/// A single draft-model proposal at round-local position `0 <= position < k`.
///
/// Invariant: `logprob_sampled` is a proper log-probability under the
/// temperature-scaled distribution actually sampled from (`<= 0`, and
/// `exp` over the full vocabulary sums to 1 within numerical tolerance).
#[derive(Debug, Clone)]
pub struct DraftToken {
    pub position: usize,
    pub token_id: u32,
    pub token_text: String,
    pub logprob_sampled: f32,
    pub entropy: f32,
    pub top_alternatives: Vec<TopAlt>,
}

/// The target model's sampled token and truncated distribution at position
/// `0 <= position <= k` of a verification request.
#[derive(Debug, Clone)]
pub struct TargetPositionInfo {
    pub position: usize,
    pub token_id: u32,
    pub token_text: String,
    /// Sorted descending by logprob. Size >= 20 when the provider allows it.
    pub top_alternatives: Vec<TopAlt>,
    pub entropy: f32,
}

impl TargetPositionInfo {
    /// log p(token_id) using the listed alternatives, falling back to the
    /// epsilon floor of §4.3 when the token is absent from the truncated
    /// top-N list.
    pub fn logprob_of(&self, token_id: u32) -> f32 {
        if let Some(alt) = self.top_alternatives.iter().find(|a| a.token_id == token_id) {
            return alt.logprob;
        }
        crate::rejection::floor_logprob(self.min_listed_logprob())
    }

    fn min_listed_logprob(&self) -> f32 {
        self.top_alternatives
            .iter()
            .map(|a| a.logprob)
            .fold(f32::INFINITY, f32::min)
    }
}

/// Per-round latency/acceptance bookkeeping, the unit the `MetricsTracker`
/// window is built from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoundStats {
    pub k_drafted: usize,
    pub accepted_count: usize,
    pub produced_count: usize,
    pub draft_latency_ms: f64,
    pub verify_latency_ms: f64,
    pub round_wall_ms: f64,
}

/// The mutable state of one in-flight generation.
///
/// `generated_text` is never built by string concatenation: it is always
/// the result of a single `decode()` call over the full committed id
/// sequence, so that tokenizer non-homomorphism (`tok(a)+tok(b) != tok(a+b)`)
/// cannot corrupt it round over round (see spec §9, "Tokenizer drift").
#[derive(Debug, Clone)]
pub struct ContextState {
    pub prompt_text: String,
    pub context_token_ids: Vec<u32>,
    pub generated_token_ids: Vec<u32>,
    pub generated_text: String,
    pub current_round: u64,
}

impl ContextState {
    pub fn new(prompt_text: String, context_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_text,
            context_token_ids,
            generated_token_ids: Vec::new(),
            generated_text: String::new(),
            current_round: 0,
        }
    }

    pub fn total_committed(&self) -> usize {
        self.generated_token_ids.len()
    }

    /// All token ids seen so far: prompt context followed by whatever has
    /// been committed. This is the input the draft model conditions on.
    pub fn full_token_ids(&self) -> Vec<u32> {
        let mut ids = self.context_token_ids.clone();
        ids.extend_from_slice(&self.generated_token_ids);
        ids
    }

    /// Appends newly committed ids and recomputes `generated_text` from the
    /// full id sequence via `decode`, maintaining the text/id invariant.
    ///
    /// Decodes into a local buffer first: if `decode` fails, `self` must be
    /// left exactly as it was (§7, "no partial commits from a failed round
    /// are appended to state"), so `generated_token_ids`/`generated_text`
    /// are only mutated together, once decoding has already succeeded.
    pub fn commit(&mut self, new_ids: &[u32], decode: impl Fn(&[u32]) -> crate::Result<String>) -> crate::Result<()> {
        let mut candidate_ids = self.generated_token_ids.clone();
        candidate_ids.extend_from_slice(new_ids);
        let generated_text = decode(&candidate_ids)?;
        self.generated_token_ids = candidate_ids;
        self.generated_text = generated_text;
        self.current_round += 1;
        Ok(())
    }
}
