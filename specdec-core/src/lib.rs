//! Speculative-decoding orchestrator: draws `k` tokens from a small local
//! draft model, verifies them in one batched request against a remote
//! target model, and applies modified rejection sampling (Leviathan et al.,
//! 2023) so the output law is provably identical to sampling the target
//! directly. Emits a typed event stream per round for a streaming
//! visualization front-end.
//!
//! The crate is organized the way `mistralrs-core` organizes a pipeline:
//! data model (`context`), the numerically load-bearing adapters
//! (`draft`, `target`, `rejection`), the orchestrator itself
//! (`speculator`), and the surrounding event/metrics/transport plumbing
//! (`events`, `metrics`, `sink`, `prompt_format`).

pub mod context;
pub mod draft;
pub mod error;
pub mod events;
pub mod metrics;
pub mod prompt_format;
pub mod rejection;
pub mod sink;
pub mod speculator;
pub mod target;

pub use error::{Result, SpecdecError};
pub use speculator::{CancellationToken, Speculator, SpeculatorConfig};
