use crate::error::ForgeError;
use crate::repair::{LoopState, RepairOutcome};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A generated driver source file on host storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCandidate {
    path: PathBuf,
}

impl DriverCandidate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn read(&self) -> Result<String, ForgeError> {
        fs::read_to_string(&self.path).map_err(|e| ForgeError::io(&self.path, e))
    }

    /// Replaces the file contents in place.
    pub fn overwrite(&self, source: &str) -> Result<(), ForgeError> {
        fs::write(&self.path, source).map_err(|e| ForgeError::io(&self.path, e))
    }

    /// BLAKE3 digest of the current contents.
    pub fn fingerprint(&self) -> Result<String, ForgeError> {
        let bytes = fs::read(&self.path).map_err(|e| ForgeError::io(&self.path, e))?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Keeps or discards candidates according to how their repair loop ended.
#[derive(Debug, Default)]
pub struct CandidateStore;

impl CandidateStore {
    pub fn new() -> Self {
        Self
    }

    /// Retains on success, deletes on exhaustion, leaves aborted candidates
    /// alone. Safe to call more than once for the same outcome.
    pub fn settle(&self, outcome: &RepairOutcome) -> Result<(), ForgeError> {
        let driver = outcome.candidate.name();
        let elapsed_secs = outcome.elapsed.as_secs_f64();
        match &outcome.state {
            LoopState::Succeeded => {
                info!(
                    driver = %driver,
                    attempts = outcome.attempts,
                    elapsed_secs,
                    "Compilation succeeded, keeping driver"
                );
                Ok(())
            }
            LoopState::Exhausted(reason) => {
                warn!(
                    driver = %driver,
                    attempts = outcome.attempts,
                    elapsed_secs,
                    ?reason,
                    "Compilation failed after {} fixes, deleting driver",
                    outcome.attempts
                );
                self.discard(&outcome.candidate)
            }
            LoopState::Aborted(e) => {
                warn!(
                    driver = %driver,
                    attempts = outcome.attempts,
                    elapsed_secs,
                    error = %e,
                    "Repair loop aborted, leaving driver untouched"
                );
                Ok(())
            }
        }
    }

    /// Removes the candidate file; a file that is already gone is not an error.
    pub fn discard(&self, candidate: &DriverCandidate) -> Result<(), ForgeError> {
        match fs::remove_file(candidate.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ForgeError::io(candidate.path(), e)),
        }
    }
}
