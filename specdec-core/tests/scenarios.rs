//! End-to-end scenario tests driving `Speculator::run` against scripted,
//! deterministic `DraftModel`/`TargetModel` stubs (spec §8's seed scenarios
//! S1-S5; S6's HTTP-retry behavior is covered directly against
//! `HttpTargetModel` in `src/target.rs` instead, since it is a property of
//! the transport layer rather than of the orchestrator).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;

use specdec_core::context::{DraftToken, TargetPositionInfo, TopAlt};
use specdec_core::draft::DraftModel;
use specdec_core::error::Result;
use specdec_core::events::{Event, VerifyStatus};
use specdec_core::prompt_format::RawContinuationFormatter;
use specdec_core::sink::CollectingEventSink;
use specdec_core::target::{TargetModel, VerificationResult};
use specdec_core::{CancellationToken, Speculator, SpeculatorConfig};

fn alt(id: u32, text: &str, p: f32) -> TopAlt {
    TopAlt {
        token_id: id,
        token: text.to_string(),
        logprob: p.ln(),
    }
}

fn draft_token(position: usize, id: u32, text: &str, q: f32, alts: Vec<TopAlt>) -> DraftToken {
    DraftToken {
        position,
        token_id: id,
        token_text: text.to_string(),
        logprob_sampled: q.ln(),
        entropy: 0.0,
        top_alternatives: alts,
    }
}

fn target_position(position: usize, id: u32, text: &str, alts: Vec<TopAlt>) -> TargetPositionInfo {
    TargetPositionInfo {
        position,
        token_id: id,
        token_text: text.to_string(),
        top_alternatives: alts,
        entropy: 0.0,
    }
}

/// A `DraftModel` that plays back one pre-scripted round of tokens at a
/// time; panics if asked for more rounds than were scripted, which is
/// exactly what we want from a test that should stop itself via
/// `max_tokens`/EOS before ever exhausting the script.
struct ScriptedDraft {
    rounds: VecDeque<Vec<DraftToken>>,
}

impl DraftModel for ScriptedDraft {
    fn draft(
        &mut self,
        _context_ids: &[u32],
        _k: usize,
        _temperature: f64,
    ) -> Result<(Vec<DraftToken>, f64)> {
        let tokens = self.rounds.pop_front().expect("scripted draft round");
        Ok((tokens, 1.0))
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids.iter().map(u32::to_string).collect::<Vec<_>>().join(","))
    }

    fn tokenizer_prompt(&self, prompt: &str) -> Result<(String, Vec<u32>)> {
        Ok((prompt.to_string(), Vec::new()))
    }
}

struct ScriptedTarget {
    rounds: std::sync::Mutex<VecDeque<Vec<TargetPositionInfo>>>,
}

#[async_trait]
impl TargetModel for ScriptedTarget {
    async fn verify(
        &self,
        _prompt_text: &str,
        _k_plus_one: usize,
        _temperature: f64,
    ) -> Result<VerificationResult> {
        let positions = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted target round");
        Ok(VerificationResult {
            positions,
            latency_ms: 1.0,
        })
    }
}

fn make_speculator(
    draft_rounds: Vec<Vec<DraftToken>>,
    target_rounds: Vec<Vec<TargetPositionInfo>>,
    eos_token_ids: HashSet<u32>,
) -> Speculator {
    let draft = Arc::new(TokioMutex::new(ScriptedDraft {
        rounds: draft_rounds.into(),
    }));
    let target = Arc::new(ScriptedTarget {
        rounds: std::sync::Mutex::new(target_rounds.into()),
    });
    Speculator::new(
        draft,
        target,
        Box::new(RawContinuationFormatter),
        SpeculatorConfig {
            eos_token_ids,
            ..SpeculatorConfig::default()
        },
    )
}

fn verify_results(events: &[Event]) -> Vec<(usize, VerifyStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::VerifyResult {
                position, status, ..
            } => Some((*position, *status)),
            _ => None,
        })
        .collect()
}

/// §8 property 4 (event ordering), checked for a single-round run: every
/// `draft_token` precedes every `verify_result`, which precedes `metrics`,
/// which precedes `done`.
fn assert_single_round_ordering(events: &[Event]) {
    let kind = |e: &Event| -> u8 {
        match e {
            Event::DraftToken { .. } => 0,
            Event::VerifyResult { .. } => 1,
            Event::Metrics { .. } => 2,
            Event::Done { .. } => 3,
            Event::Error { .. } => 4,
        }
    };
    let kinds: Vec<u8> = events.iter().map(kind).collect();
    for w in kinds.windows(2) {
        assert!(
            w[0] <= w[1],
            "event ordering invariant violated: {kinds:?}"
        );
    }
    assert_eq!(*kinds.last().unwrap(), 3, "run must end in Done");
}

#[tokio::test]
async fn s1_all_accepted_with_bonus() {
    let draft = vec![
        draft_token(0, 11, "a", 0.9, vec![alt(11, "a", 0.9)]),
        draft_token(1, 12, "b", 0.9, vec![alt(12, "b", 0.9)]),
        draft_token(2, 13, "c", 0.9, vec![alt(13, "c", 0.9)]),
        draft_token(3, 14, "d", 0.9, vec![alt(14, "d", 0.9)]),
    ];
    let targets = vec![
        target_position(0, 11, "a", vec![alt(11, "a", 0.9)]),
        target_position(1, 12, "b", vec![alt(12, "b", 0.9)]),
        target_position(2, 13, "c", vec![alt(13, "c", 0.9)]),
        target_position(3, 14, "d", vec![alt(14, "d", 0.9)]),
        target_position(4, 15, "e", vec![alt(15, "e", 1.0)]),
    ];
    let speculator = make_speculator(vec![draft], vec![targets], HashSet::new());
    let sink = CollectingEventSink::default();
    let cancel = CancellationToken::new();

    speculator
        .run("hello", 4, 0.7, 5, &sink, &cancel)
        .await
        .unwrap();
    let events = sink.into_events().await;

    let draft_events = events
        .iter()
        .filter(|e| matches!(e, Event::DraftToken { .. }))
        .count();
    assert_eq!(draft_events, 4);

    let vr = verify_results(&events);
    assert_eq!(vr.len(), 5);
    assert_eq!(
        vr.iter().filter(|(_, s)| *s == VerifyStatus::Accepted).count(),
        4
    );
    assert_eq!(
        vr.iter().filter(|(_, s)| *s == VerifyStatus::Bonus).count(),
        1
    );

    let metrics_events = events
        .iter()
        .filter(|e| matches!(e, Event::Metrics { .. }))
        .count();
    assert_eq!(metrics_events, 1);

    match events.iter().find(|e| matches!(e, Event::Metrics { .. })) {
        Some(Event::Metrics {
            round_accepted,
            round_total,
            ..
        }) => {
            assert_eq!(*round_accepted, 4);
            assert_eq!(*round_total, 4);
        }
        _ => panic!("expected a metrics event"),
    }

    match events.last() {
        Some(Event::Done { total_tokens, .. }) => assert_eq!(*total_tokens, 5),
        other => panic!("expected Done, got {other:?}"),
    }

    assert_single_round_ordering(&events);
}

#[tokio::test]
async fn s2_immediate_rejection_with_resample() {
    let draft = vec![
        draft_token(0, 20, "x", 0.9, vec![alt(20, "x", 0.9)]),
        draft_token(1, 21, "y", 0.9, vec![alt(21, "y", 0.9)]),
        draft_token(2, 22, "z", 0.9, vec![alt(22, "z", 0.9)]),
    ];
    let targets = vec![
        target_position(
            0,
            99,
            "w",
            vec![alt(20, "x", 1e-9), alt(99, "w", 0.999_999_999)],
        ),
        target_position(1, 21, "y", vec![alt(21, "y", 1.0)]),
        target_position(2, 22, "z", vec![alt(22, "z", 1.0)]),
    ];
    let speculator = make_speculator(vec![draft], vec![targets], HashSet::new());
    let sink = CollectingEventSink::default();
    let cancel = CancellationToken::new();

    speculator
        .run("hello", 3, 0.7, 1, &sink, &cancel)
        .await
        .unwrap();
    let events = sink.into_events().await;

    let vr = verify_results(&events);
    assert_eq!(vr.len(), 3);
    assert_eq!(vr[0].1, VerifyStatus::Resampled);
    assert_eq!(vr[1].1, VerifyStatus::Rejected);
    assert_eq!(vr[2].1, VerifyStatus::Rejected);

    match events.last() {
        Some(Event::Done { total_tokens, generated_text, .. }) => {
            assert_eq!(*total_tokens, 1);
            assert_eq!(generated_text, "99");
        }
        other => panic!("expected Done, got {other:?}"),
    }
}

#[tokio::test]
async fn s3_partial_acceptance() {
    let draft = vec![
        draft_token(0, 30, "a", 0.9, vec![alt(30, "a", 0.9)]),
        draft_token(1, 31, "b", 0.9, vec![alt(31, "b", 0.9)]),
        draft_token(2, 32, "c", 0.9, vec![alt(32, "c", 0.9)]),
        draft_token(3, 33, "d", 0.9, vec![alt(33, "d", 0.9)]),
    ];
    let targets = vec![
        target_position(0, 30, "a", vec![alt(30, "a", 0.9)]),
        target_position(
            1,
            41,
            "e",
            vec![alt(31, "b", 1e-9), alt(41, "e", 0.999_999_999)],
        ),
        target_position(2, 32, "c", vec![alt(32, "c", 1.0)]),
        target_position(3, 33, "d", vec![alt(33, "d", 1.0)]),
    ];
    let speculator = make_speculator(vec![draft], vec![targets], HashSet::new());
    let sink = CollectingEventSink::default();
    let cancel = CancellationToken::new();

    speculator
        .run("hello", 4, 0.7, 2, &sink, &cancel)
        .await
        .unwrap();
    let events = sink.into_events().await;

    match events.last() {
        Some(Event::Done {
            total_tokens,
            generated_text,
            ..
        }) => {
            assert_eq!(*total_tokens, 2);
            assert_eq!(generated_text, "30,41");
        }
        other => panic!("expected Done, got {other:?}"),
    }
}

#[tokio::test]
async fn s4_eos_termination_stops_generation() {
    const EOS: u32 = 999;
    let draft = vec![
        draft_token(0, 50, "a", 0.9, vec![alt(50, "a", 0.9)]),
        draft_token(1, EOS, "<eos>", 0.9, vec![alt(EOS, "<eos>", 0.9)]),
    ];
    let targets = vec![
        target_position(0, 50, "a", vec![alt(50, "a", 0.9)]),
        target_position(1, EOS, "<eos>", vec![alt(EOS, "<eos>", 0.9)]),
    ];
    let speculator =
        make_speculator(vec![draft], vec![targets], HashSet::from([EOS]));
    let sink = CollectingEventSink::default();
    let cancel = CancellationToken::new();

    speculator
        .run("hello", 2, 0.7, 4096, &sink, &cancel)
        .await
        .unwrap();
    let events = sink.into_events().await;

    match events.last() {
        Some(Event::Done { total_tokens, .. }) => assert_eq!(*total_tokens, 2),
        other => panic!("expected Done, got {other:?}"),
    }
    let bonus_count = verify_results(&events)
        .iter()
        .filter(|(_, s)| *s == VerifyStatus::Bonus)
        .count();
    assert_eq!(bonus_count, 0, "truncated response must not synthesize a bonus");
}

#[tokio::test]
async fn s5_target_returns_only_k_positions_no_bonus() {
    let draft = vec![
        draft_token(0, 60, "a", 0.9, vec![alt(60, "a", 0.9)]),
        draft_token(1, 61, "b", 0.9, vec![alt(61, "b", 0.9)]),
    ];
    // Exactly k=2 positions in the response: no room for a bonus slot.
    let targets = vec![
        target_position(0, 60, "a", vec![alt(60, "a", 0.9)]),
        target_position(1, 61, "b", vec![alt(61, "b", 0.9)]),
    ];
    let speculator = make_speculator(vec![draft], vec![targets], HashSet::new());
    let sink = CollectingEventSink::default();
    let cancel = CancellationToken::new();

    speculator
        .run("hello", 2, 0.7, 2, &sink, &cancel)
        .await
        .unwrap();
    let events = sink.into_events().await;

    let bonus_count = verify_results(&events)
        .iter()
        .filter(|(_, s)| *s == VerifyStatus::Bonus)
        .count();
    assert_eq!(bonus_count, 0);
    match events.last() {
        Some(Event::Done { total_tokens, .. }) => assert_eq!(*total_tokens, 2),
        other => panic!("expected Done, got {other:?}"),
    }
}
