//! The Speculator (§4.1): the state machine that drives one generation
//! through draft → verify → rejection-sample → commit → emit, round after
//! round, until a stop condition fires.
//!
//! This is the only part of spec.md that is itself the subject of the
//! specification; everything else in this crate exists to support it.
//! Structurally it plays the role `SpeculativePipeline::step` plays in
//! `mistralrs-core/src/pipeline/speculative.rs` — draft gamma tokens, run
//! the target once, rejection-sample — generalized from "one pipeline
//! step" to "one full generation with a typed event stream and rolling
//! metrics".

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::context::{ContextState, DraftToken, RoundStats, TargetPositionInfo, TopAlt};
use crate::draft::DraftModel;
use crate::error::{Result, SpecdecError};
use crate::events::{Event, VerifyStatus};
use crate::metrics::MetricsTracker;
use crate::prompt_format::PromptFormatter;
use crate::rejection::{self, Outcome};
use crate::sink::EventSink;
use crate::target::TargetModel;

/// A cheap, `Clone`-able cooperative cancellation flag (§5: "Cancellation:
/// cooperative via a cancellation signal from the caller"). Kept as a
/// minimal self-contained type rather than pulling in `tokio_util` for one
/// atomic bool.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SpeculatorConfig {
    pub eos_token_ids: HashSet<u32>,
    pub metrics_window: usize,
    pub verify_timeout: Duration,
    pub system_prompt: String,
}

impl Default for SpeculatorConfig {
    fn default() -> Self {
        Self {
            eos_token_ids: HashSet::new(),
            metrics_window: 50,
            verify_timeout: Duration::from_secs(30),
            system_prompt: String::new(),
        }
    }
}

/// Owns the draft/target model handles and drives generations. The draft
/// model is wrapped in a `tokio::sync::Mutex` because it is a
/// serially-accessed shared resource (§5: "at most one generation may use
/// the draft model at a time because of its mutable KV cache"); the target
/// model is stateless HTTP and is shared behind a plain `Arc`. The prompt
/// formatter lives here, not on the `TargetModel`, because building "a
/// single formatted prompt" is the orchestrator's job per §4.1 step 2 — the
/// target client just sends whatever text it is handed.
pub struct Speculator {
    draft: Arc<Mutex<dyn DraftModel>>,
    target: Arc<dyn TargetModel>,
    formatter: Box<dyn PromptFormatter>,
    system_prompt: String,
    eos_token_ids: HashSet<u32>,
    metrics_window: usize,
}

impl Speculator {
    pub fn new(
        draft: Arc<Mutex<dyn DraftModel>>,
        target: Arc<dyn TargetModel>,
        formatter: Box<dyn PromptFormatter>,
        config: SpeculatorConfig,
    ) -> Self {
        Self {
            draft,
            target,
            formatter,
            system_prompt: config.system_prompt,
            eos_token_ids: config.eos_token_ids,
            metrics_window: config.metrics_window,
        }
    }

    /// Runs one generation to completion, emitting events to `sink` in
    /// strict causal order (§5) and returning once a `Done` or `Error`
    /// event has been emitted.
    ///
    /// Preconditions (§4.1): `1 <= k <= 16`, `0 <= temperature <= 2`,
    /// `1 <= max_tokens <= 4096`, non-empty prompt. A precondition failure
    /// emits a single `Error` event and returns before any model is
    /// touched — it never mutates state (§7 `Precondition`).
    pub async fn run(
        &self,
        prompt: &str,
        k: usize,
        temperature: f64,
        max_tokens: usize,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Err(e) = validate_preconditions(prompt, k, temperature, max_tokens) {
            sink.emit(Event::Error {
                message: e.as_event_message(),
                round: None,
            })
            .await?;
            return Err(e);
        }

        info!(
            prompt_len = prompt.len(),
            k, temperature, max_tokens, "starting speculative generation"
        );

        let (prompt_text, context_ids) = {
            let draft = self.draft.lock().await;
            match draft.tokenizer_prompt(prompt) {
                Ok(v) => v,
                Err(e) => return self.fatal(sink, None, e).await,
            }
        };
        let mut ctx = ContextState::new(prompt_text, context_ids);
        let mut metrics = MetricsTracker::new(self.metrics_window);
        let mut rng = Isaac64Rng::from_entropy();

        loop {
            if cancel.is_cancelled() {
                return self.emit_done(sink, &ctx, &metrics).await;
            }
            let round = ctx.current_round + 1;
            let round_start = Instant::now();
            let mut buffer: Vec<Event> = Vec::new();

            // ---- Step 1: draft gamma=k tokens -------------------------
            if cancel.is_cancelled() {
                return self.emit_done(sink, &ctx, &metrics).await;
            }
            let full_ids = ctx.full_token_ids();
            let (draft_tokens, draft_latency_ms) = {
                let mut draft = self.draft.lock().await;
                match draft.draft(&full_ids, k, temperature) {
                    Ok(v) => v,
                    Err(e) => return self.fatal(sink, Some(round), e).await,
                }
            };
            for (i, dt) in draft_tokens.iter().enumerate() {
                buffer.push(Event::draft_token(round, i, dt, draft_latency_ms));
            }

            // ---- Step 2: single batched verification request -----------
            if cancel.is_cancelled() {
                return self.emit_done(sink, &ctx, &metrics).await;
            }
            let verify_prompt =
                match self
                    .formatter
                    .format(&self.system_prompt, &ctx.prompt_text, &ctx.generated_text)
                {
                    Ok(v) => v,
                    Err(e) => return self.fatal(sink, Some(round), e).await,
                };
            let verify_result = match self.target.verify(&verify_prompt, k + 1, temperature).await {
                Ok(v) => v,
                Err(e) => return self.fatal(sink, Some(round), e).await,
            };
            let verify_latency_ms = verify_result.latency_ms;
            let target_positions = match reconcile_positions(&draft_tokens, verify_result.positions, k)
            {
                Ok(v) => v,
                Err(e) => return self.fatal(sink, Some(round), e).await,
            };

            // ---- Step 3: rejection sampling -----------------------------
            let verdict = rejection::run(&draft_tokens, &target_positions[..k], &mut rng);

            for (i, outcome) in verdict.outcomes.iter().enumerate() {
                match outcome {
                    Outcome::Accepted => buffer.push(verify_event(
                        round,
                        &draft_tokens[i],
                        &target_positions[i],
                        VerifyStatus::Accepted,
                        verdict.acceptance_probs[i],
                        verify_latency_ms,
                    )),
                    Outcome::Resampled => {
                        let resample = verdict.resample_token.as_ref().expect("resample present");
                        buffer.push(Event::VerifyResult {
                            round,
                            position: i,
                            token: resample.token_text.clone(),
                            token_id: resample.token_id,
                            status: VerifyStatus::Resampled,
                            draft_logprob: draft_tokens[i].logprob_sampled,
                            target_logprob: Some(target_positions[i].logprob_of(resample.token_id)),
                            acceptance_prob: verdict.acceptance_probs[i],
                            target_entropy: Some(target_positions[i].entropy),
                            target_top_tokens: target_positions[i]
                                .top_alternatives
                                .iter()
                                .map(crate::events::WireTopToken::from)
                                .collect(),
                            verify_time_ms: verify_latency_ms,
                        });
                    }
                    Outcome::Skipped => {
                        // Visualization-only; permitted but not required by
                        // §4.1 step 3 / §9's open question. We emit it with
                        // a zeroed acceptance_prob as the "faithful
                        // reproduction" variant calls for.
                        buffer.push(Event::VerifyResult {
                            round,
                            position: i,
                            token: draft_tokens[i].token_text.clone(),
                            token_id: draft_tokens[i].token_id,
                            status: VerifyStatus::Rejected,
                            draft_logprob: draft_tokens[i].logprob_sampled,
                            target_logprob: None,
                            acceptance_prob: Some(0.0),
                            target_entropy: None,
                            target_top_tokens: Vec::new(),
                            verify_time_ms: verify_latency_ms,
                        });
                    }
                }
            }

            // ---- Step 4: bonus token on full acceptance -----------------
            let mut new_ids: Vec<u32> = Vec::with_capacity(k + 1);
            if verdict.accepted_count == k {
                for dt in &draft_tokens {
                    new_ids.push(dt.token_id);
                }
                if let Some(bonus) = target_positions.get(k) {
                    new_ids.push(bonus.token_id);
                    buffer.push(Event::VerifyResult {
                        round,
                        position: k,
                        token: bonus.token_text.clone(),
                        token_id: bonus.token_id,
                        status: VerifyStatus::Bonus,
                        draft_logprob: f32::NEG_INFINITY,
                        target_logprob: Some(bonus.logprob_of(bonus.token_id)),
                        acceptance_prob: None,
                        target_entropy: Some(bonus.entropy),
                        target_top_tokens: bonus
                            .top_alternatives
                            .iter()
                            .map(crate::events::WireTopToken::from)
                            .collect(),
                        verify_time_ms: verify_latency_ms,
                    });
                }
                // else: target truncated to exactly k positions (S5); no
                // bonus is synthesized.
            } else {
                for dt in draft_tokens.iter().take(verdict.accepted_count) {
                    new_ids.push(dt.token_id);
                }
                if let Some(resample) = &verdict.resample_token {
                    new_ids.push(resample.token_id);
                }
            }

            // ---- Step 5: commit ------------------------------------------
            {
                let draft = self.draft.lock().await;
                if let Err(e) = ctx.commit(&new_ids, |ids| draft.decode(ids)) {
                    return self.fatal(sink, Some(round), e).await;
                }
            }

            // ---- Step 6: metrics -------------------------------------------
            let round_stats = RoundStats {
                k_drafted: k,
                accepted_count: verdict.accepted_count,
                produced_count: new_ids.len(),
                draft_latency_ms,
                verify_latency_ms,
                round_wall_ms: round_start.elapsed().as_secs_f64() * 1000.0,
            };
            metrics.push(round_stats);
            let rolling = metrics.rolling();
            debug!(
                round,
                k_drafted = round_stats.k_drafted,
                accepted = round_stats.accepted_count,
                produced = round_stats.produced_count,
                draft_latency_ms,
                verify_latency_ms,
                "round complete"
            );
            buffer.push(Event::Metrics {
                round,
                acceptance_rate: rolling.acceptance_rate,
                round_accepted: round_stats.accepted_count,
                round_total: round_stats.k_drafted,
                effective_tps: rolling.effective_tps,
                baseline_tps: rolling.baseline_tps,
                speedup: rolling.speedup,
                draft_latency_ms,
                verify_latency_ms,
                total_tokens_generated: ctx.total_committed() as u64,
            });

            // A cancellation observed anywhere up to here (most notably
            // while awaiting the target-model call, a suspension point) must
            // still discard this round's buffered events rather than flush
            // them (§5: "On cancel between phases, the current round's
            // partial events are discarded (not emitted)"). Re-checking only
            // at the top of the next loop iteration would be too late, since
            // the buffer would already have been drained by then.
            if cancel.is_cancelled() {
                return self.emit_done(sink, &ctx, &metrics).await;
            }
            for event in buffer {
                if cancel.is_cancelled() {
                    return self.emit_done(sink, &ctx, &metrics).await;
                }
                sink.emit(event).await?;
            }

            // ---- Step 7: stop conditions, evaluated in order ---------------
            let hit_eos = new_ids.iter().any(|id| self.eos_token_ids.contains(id));
            let hit_max_tokens = ctx.total_committed() >= max_tokens;
            if hit_eos || hit_max_tokens || cancel.is_cancelled() {
                return self.emit_done(sink, &ctx, &metrics).await;
            }
        }
    }

    async fn fatal(&self, sink: &dyn EventSink, round: Option<u64>, e: SpecdecError) -> Result<()> {
        error!(round = ?round, error = %e, "generation failed");
        sink.emit(Event::Error {
            message: e.as_event_message(),
            round,
        })
        .await?;
        Err(e)
    }

    async fn emit_done(
        &self,
        sink: &dyn EventSink,
        ctx: &ContextState,
        metrics: &MetricsTracker,
    ) -> Result<()> {
        let rolling = metrics.rolling();
        sink.emit(Event::Done {
            total_tokens: ctx.total_committed() as u64,
            total_rounds: ctx.current_round,
            final_acceptance_rate: rolling.acceptance_rate,
            average_speedup: rolling.speedup,
            generated_text: ctx.generated_text.clone(),
        })
        .await
    }
}

fn validate_preconditions(
    prompt: &str,
    k: usize,
    temperature: f64,
    max_tokens: usize,
) -> Result<()> {
    if prompt.is_empty() {
        return Err(SpecdecError::Precondition("prompt must not be empty".into()));
    }
    if !(1..=16).contains(&k) {
        return Err(SpecdecError::Precondition(format!(
            "k must be in [1, 16], got {k}"
        )));
    }
    if !(0.0..=2.0).contains(&temperature) {
        return Err(SpecdecError::Precondition(format!(
            "temperature must be in [0, 2], got {temperature}"
        )));
    }
    if !(1..=4096).contains(&max_tokens) {
        return Err(SpecdecError::Precondition(format!(
            "max_tokens must be in [1, 4096], got {max_tokens}"
        )));
    }
    Ok(())
}

fn verify_event(
    round: u64,
    draft: &DraftToken,
    target: &TargetPositionInfo,
    status: VerifyStatus,
    acceptance_prob: Option<f32>,
    verify_time_ms: f64,
) -> Event {
    Event::VerifyResult {
        round,
        position: draft.position,
        token: draft.token_text.clone(),
        token_id: draft.token_id,
        status,
        draft_logprob: draft.logprob_sampled,
        target_logprob: Some(target.logprob_of(draft.token_id)),
        acceptance_prob,
        target_entropy: Some(target.entropy),
        target_top_tokens: target
            .top_alternatives
            .iter()
            .map(crate::events::WireTopToken::from)
            .collect(),
        verify_time_ms,
    }
}

/// Reconciles however many positions the target actually returned against
/// the `k` draft positions that need judging, plus the optional bonus slot
/// at `k` (§4.1 edge case: "If the target returns fewer than K+1
/// positions... the missing positions are treated as rejections with
/// resampling from the draft distribution's complement").
///
/// - `len == k + 1`: full response, bonus slot present. Used as-is.
/// - `len == k`: common truncated case (S5); no bonus slot, none synthesized.
/// - `1 <= len < k`: some draft positions have no target data at all. Each
///   missing position is synthesized from the corresponding draft token's
///   own complement distribution (`1 - q`, renormalized away from the
///   draft's own pick), which forces a rejection at that position via the
///   existing epsilon-floor mechanism once judged against real q.
/// - `len == 0`: nothing to verify with; a hard `Shape` error, matching
///   §4.1's "Shape-mismatch (wrong number of positions after retry): Error".
/// - `len > k + 1`: defensively truncated to `k + 1`; extra positions are
///   not meaningful for this request shape.
fn reconcile_positions(
    draft_tokens: &[DraftToken],
    mut positions: Vec<TargetPositionInfo>,
    k: usize,
) -> Result<Vec<TargetPositionInfo>> {
    if positions.is_empty() {
        return Err(SpecdecError::Shape {
            expected: k + 1,
            got: 0,
        });
    }
    if positions.len() > k + 1 {
        positions.truncate(k + 1);
    }
    if positions.len() < k {
        for dt in draft_tokens.iter().take(k).skip(positions.len()) {
            positions.push(complement_position(dt));
        }
    }
    Ok(positions)
}

/// Builds a stand-in target distribution for a position the target never
/// returned data for: the draft's own top alternatives with `p` estimated
/// as the complement of `q`, so the drafted token itself is judged as
/// unlikely under `p` and a real verification signal is approximated
/// rather than silently reusing `q` as `p` (which would defeat rejection
/// sampling's guarantee).
fn complement_position(draft: &DraftToken) -> TargetPositionInfo {
    let complements: Vec<(u32, String, f32)> = draft
        .top_alternatives
        .iter()
        .map(|a| (a.token_id, a.token.clone(), (1.0 - a.logprob.exp()).max(0.0)))
        .collect();
    let total: f32 = complements.iter().map(|(_, _, w)| w).sum();
    let alts: Vec<TopAlt> = complements
        .into_iter()
        .map(|(id, token, w)| TopAlt {
            token_id: id,
            token,
            logprob: if total > 0.0 {
                (w / total).max(1e-12).ln()
            } else {
                rejection::EPSILON_FLOOR.ln()
            },
        })
        .collect();
    let top = alts
        .iter()
        .max_by(|a, b| a.logprob.partial_cmp(&b.logprob).unwrap())
        .cloned()
        .unwrap_or(TopAlt {
            token_id: draft.token_id,
            token: draft.token_text.clone(),
            logprob: rejection::EPSILON_FLOOR.ln(),
        });
    let entropy = -alts.iter().map(|a| a.logprob.exp() * a.logprob).sum::<f32>();
    TargetPositionInfo {
        position: draft.position,
        token_id: top.token_id,
        token_text: top.token,
        top_alternatives: alts,
        entropy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alt(id: u32, token: &str, p: f32) -> TopAlt {
        TopAlt {
            token_id: id,
            token: token.to_string(),
            logprob: p.ln(),
        }
    }

    fn draft_tok(id: u32, text: &str, q: f32, alts: Vec<TopAlt>) -> DraftToken {
        DraftToken {
            position: 0,
            token_id: id,
            token_text: text.to_string(),
            logprob_sampled: q.ln(),
            entropy: 0.0,
            top_alternatives: alts,
        }
    }

    #[test]
    fn reconcile_keeps_full_response_unchanged() {
        let draft = vec![draft_tok(1, "a", 0.5, vec![alt(1, "a", 0.5)])];
        let positions = vec![
            TargetPositionInfo {
                position: 0,
                token_id: 1,
                token_text: "a".into(),
                top_alternatives: vec![alt(1, "a", 0.5)],
                entropy: 0.0,
            },
            TargetPositionInfo {
                position: 1,
                token_id: 2,
                token_text: "b".into(),
                top_alternatives: vec![alt(2, "b", 1.0)],
                entropy: 0.0,
            },
        ];
        let out = reconcile_positions(&draft, positions, 1).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn reconcile_truncated_to_k_has_no_bonus_slot() {
        let draft = vec![draft_tok(1, "a", 0.5, vec![alt(1, "a", 0.5)])];
        let positions = vec![TargetPositionInfo {
            position: 0,
            token_id: 1,
            token_text: "a".into(),
            top_alternatives: vec![alt(1, "a", 0.5)],
            entropy: 0.0,
        }];
        let out = reconcile_positions(&draft, positions, 1).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn reconcile_empty_response_is_shape_error() {
        let draft = vec![draft_tok(1, "a", 0.5, vec![alt(1, "a", 0.5)])];
        let err = reconcile_positions(&draft, vec![], 1).unwrap_err();
        assert!(matches!(err, SpecdecError::Shape { .. }));
    }

    #[test]
    fn reconcile_synthesizes_missing_middle_positions() {
        let draft = vec![
            draft_tok(1, "a", 0.9, vec![alt(1, "a", 0.9), alt(2, "b", 0.1)]),
            draft_tok(3, "c", 0.9, vec![alt(3, "c", 0.9), alt(4, "d", 0.1)]),
        ];
        // k=2 needs 2 judged positions; only 1 returned.
        let positions = vec![TargetPositionInfo {
            position: 0,
            token_id: 1,
            token_text: "a".into(),
            top_alternatives: vec![alt(1, "a", 0.5), alt(2, "b", 0.5)],
            entropy: 0.0,
        }];
        let out = reconcile_positions(&draft, positions, 2).unwrap();
        assert_eq!(out.len(), 2);
        // The synthesized position's top pick should not be the draft's
        // own most likely token (that's the whole point of "complement").
        assert_ne!(out[1].token_id, 3);
    }
}
