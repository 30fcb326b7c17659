//! Driver generation from API combinations.

use crate::config::GenerationConfig;
use crate::error::ForgeError;
use crate::model::{extract_code, CompletionModel};
use crate::store::DriverCandidate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// API combinations plus the per-API material the prompt draws from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiCatalog {
    pub combinations: Vec<Vec<String>>,
    /// API name → source code.
    pub code: BTreeMap<String, String>,
    /// Source file → (API name → summary).
    pub summaries: BTreeMap<String, BTreeMap<String, String>>,
}

/// Prompt material for one combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiBundle {
    pub apis: Vec<String>,
    pub info: String,
    pub summary: String,
}

impl ApiCatalog {
    pub fn from_file(path: &Path) -> Result<Self, ForgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| ForgeError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| ForgeError::Config {
            reason: format!("invalid API catalog {}: {}", path.display(), e),
        })
    }

    fn summary_of(&self, api: &str) -> Option<&str> {
        self.summaries
            .values()
            .find_map(|per_file| per_file.get(api))
            .map(String::as_str)
    }

    /// Deduplicates the combination and keeps only APIs that have a summary.
    /// Returns `None` when nothing usable is left.
    pub fn bundle(&self, combination: &[String]) -> Option<ApiBundle> {
        let unique: BTreeSet<&String> = combination.iter().collect();
        let mut bundle = ApiBundle {
            apis: Vec::new(),
            info: String::new(),
            summary: String::new(),
        };
        for api in unique {
            let Some(summary) = self.summary_of(api) else {
                continue;
            };
            let code = self.code.get(api.as_str()).map(String::as_str).unwrap_or("");
            bundle.summary.push_str(&format!("\n{}:\n{}", api, summary));
            bundle.info.push_str(&format!("\n{}:\n{}", api, code));
            bundle.apis.push(api.clone());
        }
        (!bundle.apis.is_empty()).then_some(bundle)
    }
}

pub fn generation_prompt(language: &str, headers: &[String], bundle: &ApiBundle) -> String {
    format!(
        "You are a fuzz driver expert, capable of writing a high-quality, compilable fuzz driver \
         to test a library with extensive code coverage and robust error handling.\n\
         Please generate an executable {lang} fuzz driver according to the following instructions:\n\
         1. Create a function named `LLVMFuzzerTestOneInput` that achieves a task using the provided \
         API combination. Each API should be called at least once. The function signature must be \
         `int LLVMFuzzerTestOneInput(const uint8_t *data, size_t size)`.\n\
         2. API inputs must derive from the fuzz driver inputs `data` and `size`.\n\
         3. Include all the provided headers at the beginning of the file.\n\
         4. Do NOT reimplement, mock, or redefine the target APIs, their structs, or allocators.\n\
         5. Check return values, free every allocated resource, and bounds-check all buffer accesses.\n\
         API Combination:\n{apis}\n\n\
         Provided headers:\n{headers}\n\n\
         API Source Code:\n```{lang}{info}\n```\n\n\
         API Summary:\n{summary}\n\n\
         Add any non-code content as comments. Return the driver in a single fenced {lang} code block.",
        lang = language,
        apis = bundle.apis.join(", "),
        headers = headers.join("\n"),
        info = bundle.info,
        summary = bundle.summary,
    )
}

pub struct DriverGenerator<'a> {
    model: &'a dyn CompletionModel,
    config: &'a GenerationConfig,
}

impl<'a> DriverGenerator<'a> {
    pub fn new(model: &'a dyn CompletionModel, config: &'a GenerationConfig) -> Self {
        Self { model, config }
    }

    fn extension(&self) -> &'static str {
        match self.config.language.to_lowercase().as_str() {
            "c++" | "cpp" => "cc",
            _ => "c",
        }
    }

    /// File name for the `index`-th generated driver.
    pub fn driver_file_name(&self, index: usize) -> String {
        format!(
            "{}_fuzz_driver_{}_{}.{}",
            self.config.project.replace('/', "_"),
            self.model.name().replace([':', '/'], "_"),
            index,
            self.extension()
        )
    }

    /// Asks the model for one driver and writes it under `output_dir`.
    /// Returns `Ok(None)` when the response holds no code block.
    pub fn generate(
        &self,
        bundle: &ApiBundle,
        index: usize,
    ) -> Result<Option<DriverCandidate>, ForgeError> {
        let prompt = generation_prompt(&self.config.language, &self.config.headers, bundle);
        let response = self.model.complete(&prompt)?;
        let Some(code) = extract_code(&response) else {
            warn!(index, apis = ?bundle.apis, "Model response held no driver code");
            return Ok(None);
        };

        let dir: &PathBuf = &self.config.output_dir;
        std::fs::create_dir_all(dir).map_err(|e| ForgeError::io(dir, e))?;
        let candidate = DriverCandidate::new(dir.join(self.driver_file_name(index)));
        candidate.overwrite(&code)?;
        info!(driver = %candidate.name(), apis = ?bundle.apis, "Driver generated");
        Ok(Some(candidate))
    }
}
