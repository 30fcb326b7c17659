use crate::config::ForgeConfig;
use crate::diagnostics::DiagnosticExtractor;
use crate::error::ForgeError;
use crate::generate::{ApiCatalog, DriverGenerator};
use crate::model::CompletionModel;
use crate::repair::{Repairer, RepairLoop, RepairOutcome, RepairPolicy};
use crate::report::CompilationReport;
use crate::sandbox::SandboxController;
use crate::store::CandidateStore;
use glob::Pattern;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Everything a repair loop needs, built once from the config and reused
/// for every candidate.
pub struct Forge {
    config: ForgeConfig,
    controller: SandboxController,
    extractor: DiagnosticExtractor,
    store: CandidateStore,
    policy: RepairPolicy,
}

impl Forge {
    pub fn new(config: ForgeConfig, controller: SandboxController) -> Result<Self, ForgeError> {
        let extractor = config.repair.extractor()?;
        let policy = config.repair.policy();
        Ok(Self {
            config,
            controller,
            extractor,
            store: CandidateStore::new(),
            policy,
        })
    }

    /// Runs the repair loop for one driver file.
    pub fn check_driver(&self, driver: &Path, repairer: &dyn Repairer) -> RepairOutcome {
        let spec = self.config.sandbox_spec_for(driver);
        RepairLoop::new(&self.controller, &self.extractor, repairer, &self.store)
            .with_policy(self.policy)
            .run(&spec)
    }

    /// Runs the repair loop over every matching driver in `dir`, one at a time.
    pub fn check_directory(
        &self,
        dir: &Path,
        pattern: &str,
        repairer: &dyn Repairer,
    ) -> Result<CompilationReport, ForgeError> {
        let drivers = list_drivers(dir, pattern)?;
        info!(dir = %dir.display(), count = drivers.len(), "Checking drivers");

        let mut report = CompilationReport::new();
        for driver in drivers {
            let outcome = self.check_driver(&driver, repairer);
            report.record(&outcome);
        }
        Ok(report)
    }

    /// Generates one driver per API combination and runs each through the
    /// repair loop.
    pub fn generate_and_check(
        &self,
        catalog: &ApiCatalog,
        model: &dyn CompletionModel,
        repairer: &dyn Repairer,
    ) -> Result<CompilationReport, ForgeError> {
        let generator = DriverGenerator::new(model, &self.config.generation);
        let mut report = CompilationReport::new();

        for (i, combination) in catalog.combinations.iter().enumerate() {
            let Some(bundle) = catalog.bundle(combination) else {
                warn!(index = i + 1, "No API in combination has a summary, skipping");
                continue;
            };
            match generator.generate(&bundle, i + 1)? {
                Some(candidate) => {
                    let outcome = self.check_driver(candidate.path(), repairer);
                    report.record(&outcome);
                }
                None => continue,
            }
        }
        Ok(report)
    }
}

/// Driver files directly inside `dir` whose name matches `pattern`, sorted.
pub fn list_drivers(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, ForgeError> {
    if !dir.is_dir() {
        return Err(ForgeError::Precondition {
            label: "fuzz driver directory".to_string(),
            path: dir.to_path_buf(),
        });
    }
    let pattern = Pattern::new(pattern).map_err(|e| ForgeError::Config {
        reason: format!("invalid driver pattern: {}", e),
    })?;

    let mut drivers: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| pattern.matches(&e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect();
    drivers.sort();
    Ok(drivers)
}
