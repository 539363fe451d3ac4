//! The typed event stream (§6.2): a `type`-discriminated union emitted in
//! strict causal order by the `Speculator`. Field naming is underscore_case
//! on the wire (§6.1); the `EventSink` transport may re-case for its own
//! consumers, but this is the canonical representation.
//!
//! Grounded on `tools/request.rs`'s tagged/untagged `serde` enums
//! (`ToolType`, `ToolChoice`) for the discriminated-union shape, and on
//! `sampler.rs`'s `TopLogprob` for the top-alternatives wire element.

use serde::{Deserialize, Serialize};

use crate::context::TopAlt;

/// The wire shape of a top-alternatives entry: just `(token, logprob)`, per
/// §6.2 — the internal `token_id` used for rejection-sampling bookkeeping
/// is not part of the public event schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTopToken {
    pub token: String,
    pub logprob: f32,
}

impl From<&TopAlt> for WireTopToken {
    fn from(a: &TopAlt) -> Self {
        WireTopToken {
            token: a.token.clone(),
            logprob: a.logprob,
        }
    }
}

fn wire_tops(alts: &[TopAlt]) -> Vec<WireTopToken> {
    alts.iter().map(WireTopToken::from).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Accepted,
    Rejected,
    Resampled,
    Bonus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    DraftToken {
        round: u64,
        position: usize,
        token: String,
        token_id: u32,
        logprob: f32,
        entropy: f32,
        top_tokens: Vec<WireTopToken>,
        draft_time_ms: f64,
    },
    VerifyResult {
        round: u64,
        position: usize,
        token: String,
        token_id: u32,
        status: VerifyStatus,
        draft_logprob: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_logprob: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        acceptance_prob: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_entropy: Option<f32>,
        target_top_tokens: Vec<WireTopToken>,
        verify_time_ms: f64,
    },
    Metrics {
        round: u64,
        acceptance_rate: f64,
        round_accepted: usize,
        round_total: usize,
        effective_tps: f64,
        baseline_tps: f64,
        speedup: f64,
        draft_latency_ms: f64,
        verify_latency_ms: f64,
        total_tokens_generated: u64,
    },
    Done {
        total_tokens: u64,
        total_rounds: u64,
        final_acceptance_rate: f64,
        average_speedup: f64,
        generated_text: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        round: Option<u64>,
    },
}

impl Event {
    pub fn draft_token(
        round: u64,
        position: usize,
        token: &crate::context::DraftToken,
        draft_time_ms: f64,
    ) -> Self {
        Event::DraftToken {
            round,
            position,
            token: token.token_text.clone(),
            token_id: token.token_id,
            logprob: token.logprob_sampled,
            entropy: token.entropy,
            top_tokens: wire_tops(&token.top_alternatives),
            draft_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_tag_is_snake_case_type_field() {
        let e = Event::Done {
            total_tokens: 3,
            total_rounds: 1,
            final_acceptance_rate: 1.0,
            average_speedup: 2.0,
            generated_text: "hi".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["generated_text"], "hi");
    }

    #[test]
    fn verify_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(VerifyStatus::Resampled).unwrap(),
            serde_json::json!("resampled")
        );
    }
}
