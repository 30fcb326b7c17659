use crate::error::ForgeError;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod controller;
pub mod docker;
pub mod stream;

pub use controller::{CompileProbe, SandboxController};
pub use docker::DockerCli;
pub use stream::LineSink;

/// Fixed file inside the sandbox that receives a copy of the execution output.
pub const SANDBOX_OUTPUT_PATH: &str = "/tmp/fuzzing_result.txt";

/// Environment variables handed to the in-sandbox build script.
pub const ENV_TIMEOUT: &str = "FUZZ_TIMEOUT_SECONDS";
pub const ENV_TARGET: &str = "FUZZ_TARGET_BINARY";
pub const ENV_COVERAGE_JSON: &str = "FUZZ_COVERAGE_JSON";
pub const ENV_COVERAGE_TEXT: &str = "FUZZ_COVERAGE_TEXT";

/// Where a coverage artifact lives in the sandbox and, optionally, where it
/// should land on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub container: String,
    pub host: Option<PathBuf>,
}

/// Immutable description of one compile-and-run attempt.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    /// Target project root inside the sandbox; the driver goes to `<path>/fuzz/`.
    pub container_path: String,
    pub driver: PathBuf,
    /// Build descriptor copied verbatim to `<container_path>/CMakeLists.txt`.
    pub build_descriptor: PathBuf,
    pub build_script: Option<PathBuf>,
    /// Script executed in the working directory when no build script is staged.
    pub default_script: String,
    pub driver_dest_name: String,
    pub target_binary: String,
    pub timeout: Duration,
    /// Extra host-side slack on top of `timeout` before the exec is killed.
    pub host_grace: Duration,
    pub coverage_json: ArtifactPaths,
    pub coverage_text: ArtifactPaths,
    pub workdir: Option<String>,
    /// Host file that always receives the captured execution output.
    pub output: PathBuf,
    pub container_name: Option<String>,
    pub container_prefix: String,
}

impl SandboxSpec {
    /// Checks that every host path the spec references exists.
    pub fn validate(&self) -> Result<(), ForgeError> {
        require_file("fuzz driver", &self.driver)?;
        require_file("build descriptor", &self.build_descriptor)?;
        if let Some(script) = &self.build_script {
            require_file("build script", script)?;
        }
        Ok(())
    }

    pub fn fuzz_dir(&self) -> String {
        format!("{}/fuzz", self.container_path.trim_end_matches('/'))
    }

    pub fn driver_destination(&self) -> String {
        format!("{}/{}", self.fuzz_dir(), self.driver_dest_name)
    }

    pub fn descriptor_destination(&self) -> String {
        format!("{}/CMakeLists.txt", self.container_path.trim_end_matches('/'))
    }

    /// Name of the script run inside the sandbox.
    pub fn script_name(&self) -> String {
        self.build_script
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.default_script.clone())
    }

    /// Destination of the staged build script, if one is configured.
    pub fn script_destination(&self) -> Option<String> {
        self.build_script.as_ref().map(|_| {
            let dir = self.workdir.as_deref().unwrap_or("/");
            format!("{}/{}", dir.trim_end_matches('/'), self.script_name())
        })
    }

    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_TIMEOUT.to_string(), self.timeout.as_secs().to_string()),
            (ENV_TARGET.to_string(), self.target_binary.clone()),
            (ENV_COVERAGE_JSON.to_string(), self.coverage_json.container.clone()),
            (ENV_COVERAGE_TEXT.to_string(), self.coverage_text.container.clone()),
        ]
    }

    /// Host-side deadline for the exec step.
    pub fn host_deadline(&self) -> Duration {
        self.timeout + self.host_grace
    }
}

fn require_file(label: &str, path: &Path) -> Result<(), ForgeError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ForgeError::Precondition {
            label: label.to_string(),
            path: path.to_path_buf(),
        })
    }
}

/// A command to run inside the sandbox through a shell.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub workdir: Option<String>,
    pub command: String,
    pub env: Vec<(String, String)>,
}

impl ExecRequest {
    /// Shell line with the working-directory prefix. Stderr of the whole
    /// group, including a failed `cd`, is folded into stdout.
    pub fn shell_line(&self) -> String {
        match &self.workdir {
            Some(dir) => format!("{{ cd {} && {}; }} 2>&1", shell_quote(dir), self.command),
            None => format!("{{ {}; }} 2>&1", self.command),
        }
    }
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A running exec inside the sandbox.
pub trait ExecHandle: Send {
    /// Output stream; yields `None` once taken.
    fn take_output(&mut self) -> Option<Box<dyn Read + Send>>;
    /// Separate error stream, when the process has one.
    fn take_errors(&mut self) -> Option<Box<dyn Read + Send>> {
        None
    }
    fn kill(&mut self) -> io::Result<()>;
    /// Waits for exit; `None` when the process ended without an exit code.
    fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// The container runtime operations the controller needs.
pub trait ContainerRuntime: Send + Sync {
    fn inspect_image(&self, image: &str) -> Result<(), ForgeError>;
    /// Starts a detached, idle container under `name`.
    fn start(&self, name: &str, image: &str) -> Result<(), ForgeError>;
    fn make_dir(&self, name: &str, dir: &str) -> Result<(), ForgeError>;
    fn copy_in(&self, name: &str, host: &Path, container: &str) -> Result<(), ForgeError>;
    fn copy_out(&self, name: &str, container: &str, host: &Path) -> Result<(), ForgeError>;
    fn spawn_exec(&self, name: &str, request: &ExecRequest)
        -> Result<Box<dyn ExecHandle>, ForgeError>;
    /// Opens a sink that writes lines into a file inside the sandbox.
    fn open_file_sink(&self, name: &str, container_path: &str)
        -> Result<Box<dyn LineSink>, ForgeError>;
    fn remove(&self, name: &str) -> Result<(), ForgeError>;
}

/// Result of one sandbox run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRecord {
    pub container_name: String,
    /// Exit status of the exec step; `None` if it never ran or was killed.
    pub status: Option<i32>,
    pub output: String,
    pub timed_out: bool,
    pub output_copied: bool,
    pub coverage_json: Option<PathBuf>,
    pub coverage_text: Option<PathBuf>,
    /// Sinks that failed mid-stream, as `(sink, reason)`.
    pub sink_failures: Vec<(String, String)>,
}

impl ExecutionRecord {
    pub fn succeeded(&self) -> bool {
        self.status == Some(0) && !self.timed_out
    }
}

/// Generates a unique sandbox name like `fuzz_3fa91c0d`.
pub fn unique_name(prefix: &str) -> String {
    format!("{}_{:08x}", prefix, rand::random::<u32>())
}
