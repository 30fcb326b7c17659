//! Language-model collaborators: the completion capability, code extraction,
//! and the repair prompt.

use crate::diagnostics::DiagnosticContext;
use crate::repair::Repairer;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

pub mod http;

pub use http::OpenAiCompatibleModel;

/// Anything that turns a prompt into text.
pub trait CompletionModel: Send + Sync {
    fn complete(&self, prompt: &str) -> anyhow::Result<String>;

    /// Short identifier used in driver file names and logs.
    fn name(&self) -> &str {
        "model"
    }
}

fn code_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:c|cpp|c\+\+)\s(.*?)```").expect("valid regex"))
}

/// Pulls the first fenced C/C++ block out of a model response.
/// `None` means the response carried no usable code.
pub fn extract_code(response: &str) -> Option<String> {
    code_block()
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Prompt asking the model to repair a driver given its build diagnostics.
pub fn repair_prompt(source: &str, diagnostic: &DiagnosticContext) -> String {
    format!(
        "You are an expert C/C++ programmer specializing in fixing compilation errors.\n\
         Fix the following fuzz driver file:\n\
         ```\n{}\n```\n\
         Compilation errors:\n{}\n\
         Instructions:\n\
         1. Make minimal changes to fix the errors.\n\
         2. Do NOT modify or remove any #include statements.\n\
         3. Return the complete fixed code wrapped in triple backticks.\n",
        source,
        diagnostic.render()
    )
}

/// Repairs drivers by asking a `CompletionModel`.
pub struct ModelRepairer<M> {
    model: M,
}

impl<M: CompletionModel> ModelRepairer<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

impl<M: CompletionModel> Repairer for ModelRepairer<M> {
    fn repair(&self, source: &str, diagnostic: &DiagnosticContext) -> Option<String> {
        let prompt = repair_prompt(source, diagnostic);
        debug!(model = self.model.name(), prompt_len = prompt.len(), "Requesting repair");
        let response = match self.model.complete(&prompt) {
            Ok(r) => r,
            Err(e) => {
                warn!(model = self.model.name(), error = %e, "Repair request failed");
                return None;
            }
        };
        let code = extract_code(&response);
        if code.is_none() {
            warn!(model = self.model.name(), "Failed to extract fixed code from model response");
        }
        code
    }
}

impl<T: CompletionModel + ?Sized> CompletionModel for &T {
    fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        (**self).complete(prompt)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: CompletionModel + ?Sized> CompletionModel for Box<T> {
    fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        (**self).complete(prompt)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
