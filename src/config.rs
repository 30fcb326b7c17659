//! Configuration for fuzzforge.
//!
//! Loaded from TOML; every section has defaults so a partial file works.
//! Nothing here is process-global: the loaded `ForgeConfig` is passed to
//! whatever needs it.

use crate::diagnostics::{DiagnosticExtractor, DEFAULT_MARKERS};
use crate::error::{ForgeError, RetryConfig};
use crate::repair::{RepairPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::sandbox::{ArtifactPaths, SandboxSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "FUZZFORGE_CONFIG";
pub const LOCAL_CONFIG: &str = "fuzzforge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub sandbox: SandboxConfig,
    pub repair: RepairConfig,
    pub model: ModelConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container runtime binary.
    pub runtime: String,
    pub image: String,
    pub container_path: String,
    pub workdir: Option<String>,
    pub build_descriptor: PathBuf,
    pub build_script: Option<PathBuf>,
    /// Script run in the working directory when `build_script` is unset.
    pub default_script: String,
    pub driver_dest_name: String,
    pub target_binary: String,
    pub timeout_seconds: u64,
    /// Host-side slack before a hung exec is killed.
    pub host_grace_seconds: u64,
    pub container_prefix: String,
    pub coverage_json_container: String,
    pub coverage_text_container: String,
    /// Directory for execution output and coverage copies.
    pub output_dir: PathBuf,
    /// Copy coverage JSON back for each driver.
    pub collect_coverage_json: bool,
    /// Copy coverage text back for each driver.
    pub collect_coverage_text: bool,
    /// Echo execution output to stdout while it streams.
    pub echo: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "rosidl_runtime_c_base_image:latest".to_string(),
            container_path: "/ws/src/ros2/rosidl/rosidl_runtime_c".to_string(),
            workdir: Some("/ws".to_string()),
            build_descriptor: PathBuf::from("projects/rosidl_runtime_c/CMakeLists.txt"),
            build_script: Some(PathBuf::from("projects/rosidl_runtime_c/fuzzing.sh")),
            default_script: "fuzzing.sh".to_string(),
            driver_dest_name: "fuzzer.c".to_string(),
            target_binary: "fuzzer".to_string(),
            timeout_seconds: 10,
            host_grace_seconds: 600,
            container_prefix: "fuzz".to_string(),
            coverage_json_container: "/ws/fuzz_corpus/coverage.json".to_string(),
            coverage_text_container: "/ws/fuzz_corpus/coverage.txt".to_string(),
            output_dir: PathBuf::from("docker_shared"),
            collect_coverage_json: false,
            collect_coverage_text: true,
            echo: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub max_attempts: u32,
    pub context_radius: usize,
    pub max_line_len: usize,
    /// Regular expressions that flag a failed build.
    pub markers: Vec<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            context_radius: 20,
            max_line_len: 300,
            markers: DEFAULT_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl RepairConfig {
    pub fn policy(&self) -> RepairPolicy {
        RepairPolicy {
            max_attempts: self.max_attempts,
        }
    }

    pub fn extractor(&self) -> Result<DiagnosticExtractor, ForgeError> {
        DiagnosticExtractor::new(&self.markers, self.context_radius, self.max_line_len).map_err(
            |e| ForgeError::Config {
                reason: format!("invalid failure marker: {}", e),
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// OpenAI-compatible chat completions URL.
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub request_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            model: "deepseek-coder".to_string(),
            api_key_env: Some("FUZZFORGE_API_KEY".to_string()),
            temperature: 0.2,
            request_timeout_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Project identifier, e.g. `ros2/rosidl_runtime_c`.
    pub project: String,
    /// `c` or `c++`.
    pub language: String,
    /// Headers every generated driver must include.
    pub headers: Vec<String>,
    pub output_dir: PathBuf,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            project: "ros2/rosidl_runtime_c".to_string(),
            language: "c".to_string(),
            headers: Vec::new(),
            output_dir: PathBuf::from("fuzz_driver"),
        }
    }
}

impl ForgeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ForgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| ForgeError::io(path, e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ForgeError> {
        toml::from_str(content).map_err(|e| ForgeError::Config {
            reason: e.to_string(),
        })
    }

    pub fn to_toml(&self) -> Result<String, ForgeError> {
        toml::to_string_pretty(self).map_err(|e| ForgeError::Config {
            reason: e.to_string(),
        })
    }

    /// Resolves the config source: explicit path, then `FUZZFORGE_CONFIG`,
    /// then `./fuzzforge.toml`, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ForgeError> {
        if let Some(path) = explicit {
            info!(path = %path.display(), "Loading config from command line");
            return Self::from_file(path);
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            if path.is_file() {
                info!(path = %path.display(), "Loading config from {}", CONFIG_ENV);
                return Self::from_file(&path);
            }
        }
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.is_file() {
            info!(path = %local.display(), "Loading local config");
            return Self::from_file(&local);
        }
        info!("Using built-in default config");
        Ok(Self::default())
    }

    /// Builds the sandbox spec for one driver file.
    pub fn sandbox_spec_for(&self, driver: &Path) -> SandboxSpec {
        let sb = &self.sandbox;
        let stem = driver
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "driver".to_string());
        let project = self.project_base();

        SandboxSpec {
            image: sb.image.clone(),
            container_path: sb.container_path.clone(),
            driver: driver.to_path_buf(),
            build_descriptor: sb.build_descriptor.clone(),
            build_script: sb.build_script.clone(),
            default_script: sb.default_script.clone(),
            driver_dest_name: sb.driver_dest_name.clone(),
            target_binary: sb.target_binary.clone(),
            timeout: Duration::from_secs(sb.timeout_seconds),
            host_grace: Duration::from_secs(sb.host_grace_seconds),
            coverage_json: ArtifactPaths {
                container: sb.coverage_json_container.clone(),
                host: sb
                    .collect_coverage_json
                    .then(|| sb.output_dir.join(format!("{}_coverage_{}.json", project, stem))),
            },
            coverage_text: ArtifactPaths {
                container: sb.coverage_text_container.clone(),
                host: sb
                    .collect_coverage_text
                    .then(|| sb.output_dir.join(format!("{}_coverage_{}.txt", project, stem))),
            },
            workdir: sb.workdir.clone(),
            output: sb.output_dir.join(format!("{}_fuzz_output.txt", project)),
            container_name: None,
            container_prefix: sb.container_prefix.clone(),
        }
    }

    /// Last path segment of the project identifier.
    pub fn project_base(&self) -> String {
        self.generation
            .project
            .rsplit('/')
            .next()
            .unwrap_or("project")
            .to_string()
    }
}
