//! Process bootstrap configuration (§6.3): environment-driven, with a thin
//! `clap` layer over the top for the couple of knobs that make sense as CLI
//! flags (the prompt itself, and an optional config-file style override is
//! deliberately not offered — the teacher's own binaries read connection
//! settings from the environment the same way).

use std::collections::HashSet;
use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Connection and generation defaults read from the environment, per §6.3.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub target_api_key: String,
    pub target_model: String,
    pub target_base_url: String,
    pub draft_model: String,
    pub speculation_k: usize,
    pub temperature: f64,
    pub max_tokens: usize,
    pub eos_token_ids: HashSet<u32>,
    pub metrics_window: usize,
    pub cors_origins: Vec<String>,
    pub verify_timeout: Duration,
}

/// A target family's common end-of-sequence ids, used when `eos_token_ids`
/// is not set (§6.3: "default covers common end-of-sequence tokens for the
/// supported target families"). These are the well-known ids for the two
/// families `TargetFamily` currently distinguishes; an unrecognized model
/// id falls back to the raw-continuation set.
fn default_eos_for(target_model: &str) -> HashSet<u32> {
    use specdec_core::prompt_format::TargetFamily;
    match TargetFamily::from_model_id(target_model) {
        TargetFamily::HarmonyChat => HashSet::from([200002, 200007, 199999]),
        TargetFamily::RawContinuation => HashSet::from([2]),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let target_api_key = require_var("SPECDEC_TARGET_API_KEY")?;
        let target_model = require_var("SPECDEC_TARGET_MODEL")?;
        let target_base_url = env::var("SPECDEC_TARGET_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com".to_string());
        let draft_model =
            env::var("SPECDEC_DRAFT_MODEL").unwrap_or_else(|_| "local-draft".to_string());

        let speculation_k = parse_or("SPECDEC_SPECULATION_K", 8usize)?;
        let temperature = parse_or("SPECDEC_TEMPERATURE", 0.7f64)?;
        let max_tokens = parse_or("SPECDEC_MAX_TOKENS", 512usize)?;
        let metrics_window = parse_or("SPECDEC_METRICS_WINDOW", 50usize)?;
        let verify_timeout_ms = parse_or("SPECDEC_VERIFY_TIMEOUT_MS", 30_000u64)?;

        let eos_token_ids = match env::var("SPECDEC_EOS_TOKEN_IDS") {
            Ok(raw) if !raw.trim().is_empty() => parse_id_set(&raw)?,
            _ => default_eos_for(&target_model),
        };
        let cors_origins = match env::var("SPECDEC_CORS_ORIGINS") {
            Ok(raw) if !raw.trim().is_empty() => {
                raw.split(',').map(|s| s.trim().to_string()).collect()
            }
            _ => Vec::new(),
        };

        Ok(Self {
            target_api_key,
            target_model,
            target_base_url,
            draft_model,
            speculation_k,
            temperature,
            max_tokens,
            eos_token_ids,
            metrics_window,
            cors_origins,
            verify_timeout: Duration::from_millis(verify_timeout_ms),
        })
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn parse_id_set(raw: &str) -> Result<HashSet<u32>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>().map_err(|e| ConfigError::Invalid {
                name: "SPECDEC_EOS_TOKEN_IDS",
                value: s.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_set_splits_and_trims() {
        let ids = parse_id_set(" 1, 2 ,3").unwrap();
        assert_eq!(ids, HashSet::from([1, 2, 3]));
    }

    #[test]
    fn parse_id_set_rejects_garbage() {
        assert!(parse_id_set("1,x").is_err());
    }
}
