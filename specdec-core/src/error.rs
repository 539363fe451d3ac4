use thiserror::Error;

/// Crate-wide result alias, mirroring `candle_core::Result<T>` in spirit:
/// a single error enum covers everything that can go wrong inside a round.
pub type Result<T> = std::result::Result<T, SpecdecError>;

/// Terminal error taxonomy for one generation, per the §7 error design.
///
/// `Canceled` is intentionally absent here: cancellation is not a failure,
/// it produces a normal `Done` event and is represented in the orchestrator
/// as a plain early-return, never as an `Err`.
#[derive(Debug, Error)]
pub enum SpecdecError {
    #[error("request rejected before any work began: {0}")]
    Precondition(String),

    #[error("target model transport failed after retry: {0}")]
    TransientRemote(String),

    #[error("target model returned a malformed or under-length response: {0}")]
    InvalidRemote(String),

    #[error("draft model failed: {0}")]
    LocalInference(String),

    #[error("response shape mismatch: expected {expected}, got {got}")]
    Shape { expected: usize, got: usize },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl SpecdecError {
    /// Human-readable message suitable for the `error` event's `message` field.
    pub fn as_event_message(&self) -> String {
        self.to_string()
    }
}
