//! Compile-verify-repair loop.
//!
//! Each cycle stages the candidate in a fresh sandbox, scans the output for
//! failure markers, and on failure asks the repairer for a patched source.
//! The loop runs at most `max_attempts + 1` compile cycles.

use crate::diagnostics::{DiagnosticContext, DiagnosticExtractor};
use crate::error::ForgeError;
use crate::sandbox::{SandboxController, SandboxSpec};
use crate::store::{CandidateStore, DriverCandidate};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// The model-repair collaborator. `None` means no usable code came back.
pub trait Repairer {
    fn repair(&self, source: &str, diagnostic: &DiagnosticContext) -> Option<String>;
}

impl<F> Repairer for F
where
    F: Fn(&str, &DiagnosticContext) -> Option<String>,
{
    fn repair(&self, source: &str, diagnostic: &DiagnosticContext) -> Option<String> {
        self(source, diagnostic)
    }
}

/// Result of one compile cycle.
#[derive(Debug)]
pub enum CompileStep {
    Success,
    RetryableFailure(DiagnosticContext),
    FatalError(ForgeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    AttemptsSpent,
    NoUsableRepair,
}

/// Terminal state of one loop invocation.
#[derive(Debug)]
pub enum LoopState {
    Succeeded,
    Exhausted(ExhaustReason),
    /// Unrecoverable error; the candidate is left as it was.
    Aborted(ForgeError),
}

impl LoopState {
    pub fn label(&self) -> &'static str {
        match self {
            LoopState::Succeeded => "succeeded",
            LoopState::Exhausted(_) => "exhausted",
            LoopState::Aborted(_) => "aborted",
        }
    }
}

#[derive(Debug)]
pub struct RepairOutcome {
    pub candidate: DriverCandidate,
    pub state: LoopState,
    /// Number of accepted repairs.
    pub attempts: u32,
    pub compile_cycles: u32,
    pub elapsed: Duration,
    pub last_diagnostic: Option<DiagnosticContext>,
}

impl RepairOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.state, LoopState::Succeeded)
    }

    /// Hands an abort back as an error, for callers that propagate it.
    pub fn into_result(self) -> Result<RepairOutcome, ForgeError> {
        match self.state {
            LoopState::Aborted(e) => Err(e),
            _ => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RepairPolicy {
    pub max_attempts: u32,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

pub struct RepairLoop<'a> {
    controller: &'a SandboxController,
    extractor: &'a DiagnosticExtractor,
    repairer: &'a dyn Repairer,
    store: &'a CandidateStore,
    policy: RepairPolicy,
}

impl<'a> RepairLoop<'a> {
    pub fn new(
        controller: &'a SandboxController,
        extractor: &'a DiagnosticExtractor,
        repairer: &'a dyn Repairer,
        store: &'a CandidateStore,
    ) -> Self {
        Self {
            controller,
            extractor,
            repairer,
            store,
            policy: RepairPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RepairPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// One compile cycle. Success is the absence of a recognized failure
    /// marker in the captured output.
    pub fn compile(&self, spec: &SandboxSpec) -> CompileStep {
        match self.controller.stage_and_run(spec) {
            Err(e) => CompileStep::FatalError(e),
            Ok(record) => {
                let diagnostic = self.extractor.extract(&record.output);
                if diagnostic.matched {
                    CompileStep::RetryableFailure(diagnostic)
                } else {
                    if !record.succeeded() {
                        warn!(
                            container = %record.container_name,
                            status = ?record.status,
                            timed_out = record.timed_out,
                            "No failure marker but execution did not exit cleanly"
                        );
                    }
                    CompileStep::Success
                }
            }
        }
    }

    /// Drives the candidate named by `spec.driver` to a terminal state and
    /// settles it in the store.
    pub fn run(&self, spec: &SandboxSpec) -> RepairOutcome {
        let candidate = DriverCandidate::new(&spec.driver);
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut cycles = 0u32;
        let mut last_diagnostic = None;

        let state = loop {
            cycles += 1;
            let diagnostic = match self.compile(spec) {
                CompileStep::Success => break LoopState::Succeeded,
                CompileStep::FatalError(e) => break LoopState::Aborted(e),
                CompileStep::RetryableFailure(d) => d,
            };
            info!(
                driver = %candidate.name(),
                attempt = attempts,
                marker_line = ?diagnostic.marker_line,
                "Build failed"
            );

            if attempts >= self.policy.max_attempts {
                last_diagnostic = Some(diagnostic);
                break LoopState::Exhausted(ExhaustReason::AttemptsSpent);
            }

            let source = match candidate.read() {
                Ok(s) => s,
                Err(e) => break LoopState::Aborted(e),
            };
            let patched = self
                .repairer
                .repair(&source, &diagnostic)
                .filter(|code| !code.trim().is_empty());
            last_diagnostic = Some(diagnostic);

            match patched {
                None => break LoopState::Exhausted(ExhaustReason::NoUsableRepair),
                Some(code) => {
                    if let Err(e) = candidate.overwrite(&code) {
                        break LoopState::Aborted(e);
                    }
                    attempts += 1;
                }
            }
        };

        let outcome = RepairOutcome {
            candidate,
            state,
            attempts,
            compile_cycles: cycles,
            elapsed: start.elapsed(),
            last_diagnostic,
        };
        if let Err(e) = self.store.settle(&outcome) {
            warn!(driver = %outcome.candidate.name(), error = %e, "Failed to settle candidate");
        }
        outcome
    }
}
