//! Pluggable per-target-model-family prompt formatting (§4.3, §9 "Prompt-
//! format polymorphism"): a tagged variant selected by configuration, not
//! inheritance, grounded on `pipeline/chat_template.rs`'s
//! `ToolCallingModel`-keyed branch in `apply_chat_template_to` and its use
//! of `minijinja` for templated rendering.

use minijinja::{context, Environment};

use crate::error::{Result, SpecdecError};

/// Selects which native continuation template the target expects. New
/// families are added here, data-driven from the `target_model`
/// configuration string (§6.3) — never by subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFamily {
    /// Plain text continuation: the framing is just the running text, no
    /// role markup. Correct for base/completion-only endpoints.
    RawContinuation,
    /// A Harmony-style chat-wrapped format (role tags around system/user
    /// turns, then an open assistant turn for the model to continue).
    HarmonyChat,
}

impl TargetFamily {
    /// Data-driven selection from the `target_model` identifier, per §6.3
    /// ("target_model ... implicitly selects the prompt-format strategy").
    pub fn from_model_id(model_id: &str) -> Self {
        let lower = model_id.to_lowercase();
        if lower.contains("harmony") || lower.contains("gpt-oss") {
            TargetFamily::HarmonyChat
        } else {
            TargetFamily::RawContinuation
        }
    }
}

/// Strategy interface for building the completions-style prompt text sent
/// to the target model. Implementations must concatenate the formatted
/// system+user framing with the current `generated_text` verbatim (§4.3).
pub trait PromptFormatter: Send + Sync {
    fn format(&self, system: &str, user_prompt: &str, generated_text: &str) -> Result<String>;
}

pub struct RawContinuationFormatter;

impl PromptFormatter for RawContinuationFormatter {
    fn format(&self, system: &str, user_prompt: &str, generated_text: &str) -> Result<String> {
        let mut out = String::new();
        if !system.is_empty() {
            out.push_str(system);
            out.push_str("\n\n");
        }
        out.push_str(user_prompt);
        out.push('\n');
        out.push_str(generated_text);
        Ok(out)
    }
}

/// A Harmony-style formatter: wraps system/user turns in role tags via a
/// small `minijinja` template, then opens an assistant turn that the
/// target continues — `generated_text` is appended verbatim inside it so
/// the target always sees its own prior output untouched by re-tokenization.
pub struct HarmonyChatFormatter {
    env: Environment<'static>,
}

const HARMONY_TEMPLATE: &str = "\
<|start|>system<|message|>{{ system }}<|end|>\
<|start|>user<|message|>{{ user }}<|end|>\
<|start|>assistant<|message|>{{ generated }}";

impl Default for HarmonyChatFormatter {
    fn default() -> Self {
        let mut env = Environment::new();
        env.add_template("harmony", HARMONY_TEMPLATE)
            .expect("static template is valid");
        Self { env }
    }
}

impl PromptFormatter for HarmonyChatFormatter {
    fn format(&self, system: &str, user_prompt: &str, generated_text: &str) -> Result<String> {
        let tmpl = self
            .env
            .get_template("harmony")
            .map_err(|e| SpecdecError::InvalidRemote(e.to_string()))?;
        tmpl.render(context! {
            system => system,
            user => user_prompt,
            generated => generated_text,
        })
        .map_err(|e| SpecdecError::InvalidRemote(e.to_string()))
    }
}

/// Resolves a family tag to a boxed formatter instance.
pub fn formatter_for(family: TargetFamily) -> Box<dyn PromptFormatter> {
    match family {
        TargetFamily::RawContinuation => Box::new(RawContinuationFormatter),
        TargetFamily::HarmonyChat => Box::new(HarmonyChatFormatter::default()),
    }
}
