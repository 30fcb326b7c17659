//! Sandbox lifecycle: verify image, create, stage, execute, collect, destroy.

use super::stream::{self, EchoSink, FanOut};
use super::{
    unique_name, ContainerRuntime, ExecRequest, ExecutionRecord, SandboxSpec, SANDBOX_OUTPUT_PATH,
};
use crate::error::ForgeError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Tears the sandbox down exactly once, when dropped, unless released.
struct SandboxGuard<'a> {
    runtime: &'a dyn ContainerRuntime,
    name: String,
    armed: bool,
}

impl SandboxGuard<'_> {
    /// Gives up ownership of a container this call did not create.
    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for SandboxGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.runtime.remove(&self.name) {
            Ok(()) => info!(container = %self.name, "Sandbox removed"),
            Err(e) => warn!(container = %self.name, error = %e, "Sandbox removal failed"),
        }
    }
}

/// Result of the coverage-based compile probe.
#[derive(Debug)]
pub struct CompileProbe {
    /// True only when every requested coverage artifact came back.
    pub compiled: bool,
    pub record: ExecutionRecord,
}

pub struct SandboxController {
    runtime: Arc<dyn ContainerRuntime>,
    echo: bool,
}

impl SandboxController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            echo: false,
        }
    }

    /// Echo execution output to stdout as it arrives instead of tracing it.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Runs one compile-and-run cycle in a fresh sandbox.
    ///
    /// Fails before any container exists if a host path is missing or the
    /// image cannot be resolved. A failed start is an error too, but the
    /// half-created container is still removed; the one exception is a
    /// caller-supplied name that collides with an existing container.
    /// Every later step failure is tolerated and shows up in the record.
    pub fn stage_and_run(&self, spec: &SandboxSpec) -> Result<ExecutionRecord, ForgeError> {
        spec.validate()?;
        self.runtime.inspect_image(&spec.image)?;

        let name = spec
            .container_name
            .clone()
            .unwrap_or_else(|| unique_name(&spec.container_prefix));
        let mut record = {
            // `run -d` can leave a created container behind even when it
            // fails, so the guard owns the name before the start attempt.
            let guard = SandboxGuard {
                runtime: self.runtime.as_ref(),
                name: name.clone(),
                armed: true,
            };
            if let Err(e) = self.runtime.start(&name, &spec.image) {
                if spec.container_name.is_some() && e.is_name_conflict() {
                    warn!(container = %name, "Container name already in use, leaving it alone");
                    guard.release();
                }
                return Err(e);
            }
            info!(container = %name, image = %spec.image, "Sandbox started");
            self.run_in(&guard.name, spec)
        };

        // Always leave the captured output on the host, whatever the copy-back did.
        if let Err(e) = write_output(&spec.output, &record.output) {
            warn!(path = %spec.output.display(), error = %e, "Failed to write execution output");
        }
        record.container_name = name;
        Ok(record)
    }

    /// Stage, execute, and collect inside an already-running sandbox.
    fn run_in(&self, name: &str, spec: &SandboxSpec) -> ExecutionRecord {
        let rt = self.runtime.as_ref();
        let mut record = ExecutionRecord::default();

        tolerate("create fuzz dir", rt.make_dir(name, &spec.fuzz_dir()));
        tolerate(
            "stage driver",
            rt.copy_in(name, &spec.driver, &spec.driver_destination()),
        );
        tolerate(
            "stage build descriptor",
            rt.copy_in(name, &spec.build_descriptor, &spec.descriptor_destination()),
        );
        if let (Some(script), Some(dest)) = (&spec.build_script, spec.script_destination()) {
            tolerate("stage build script", rt.copy_in(name, script, &dest));
        }

        let request = ExecRequest {
            workdir: spec.workdir.clone(),
            command: format!("./{}", spec.script_name()),
            env: spec.env(),
        };

        let mut fanout = FanOut::new();
        fanout.attach("echo", Box::new(EchoSink::new(self.echo)));
        match rt.open_file_sink(name, SANDBOX_OUTPUT_PATH) {
            Ok(sink) => fanout.attach("sandbox-file", sink),
            Err(e) => fanout.record_failure("sandbox-file", e.to_string()),
        }

        match rt.spawn_exec(name, &request) {
            Ok(handle) => match stream::pump(handle, &mut fanout, spec.host_deadline()) {
                Ok(outcome) => {
                    record.status = outcome.status;
                    record.output = outcome.output;
                    record.timed_out = outcome.timed_out;
                }
                Err(e) => warn!(container = %name, error = %e, "Execution stream failed"),
            },
            Err(e) => warn!(container = %name, error = %e, "Execution failed to start"),
        }
        record.sink_failures = fanout.close();
        info!(container = %name, status = ?record.status, timed_out = record.timed_out, "Execution finished");

        record.output_copied = copy_back(rt, name, SANDBOX_OUTPUT_PATH, Some(&spec.output)).is_some();
        record.coverage_json = copy_back(
            rt,
            name,
            &spec.coverage_json.container,
            spec.coverage_json.host.as_deref(),
        );
        record.coverage_text = copy_back(
            rt,
            name,
            &spec.coverage_text.container,
            spec.coverage_text.host.as_deref(),
        );

        record
    }

    /// Compile check in which a missing coverage artifact counts as a failed
    /// build. Only artifacts with a host destination are considered.
    pub fn compile_probe(&self, spec: &SandboxSpec) -> Result<CompileProbe, ForgeError> {
        let record = self.stage_and_run(spec)?;
        let json_ok = spec.coverage_json.host.is_none() || record.coverage_json.is_some();
        let text_ok = spec.coverage_text.host.is_none() || record.coverage_text.is_some();
        Ok(CompileProbe {
            compiled: json_ok && text_ok,
            record,
        })
    }
}

fn tolerate(step: &str, result: Result<(), ForgeError>) {
    if let Err(e) = result {
        warn!(step, error = %e, "Staging step failed, continuing");
    }
}

fn copy_back(
    rt: &dyn ContainerRuntime,
    name: &str,
    container: &str,
    host: Option<&Path>,
) -> Option<PathBuf> {
    let host = host?;
    match rt.copy_out(name, container, host) {
        Ok(()) => Some(host.to_path_buf()),
        Err(e) => {
            warn!(container_path = container, error = %e, "Artifact copy-back failed");
            None
        }
    }
}

fn write_output(path: &Path, output: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, output)
}
