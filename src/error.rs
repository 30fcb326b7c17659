/// fuzzforge error types and handling utilities
use std::path::PathBuf;

/// Main error type for fuzzforge operations
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// A required host file is missing; raised before any container exists
    #[error("Precondition failed: missing {label} at {}", path.display())]
    Precondition { label: String, path: PathBuf },
    /// The container runtime cannot resolve the image
    #[error("Image not found: {image}: {reason}")]
    ImageNotFound { image: String, reason: String },
    /// The sandbox container could not be created
    #[error("Container {name} failed to start: {reason}")]
    ContainerStart { name: String, reason: String },
    /// A container runtime call failed after the sandbox was created
    #[error("Runtime error in {operation}: {reason}")]
    Runtime { operation: String, reason: String },
    /// The language model collaborator failed
    #[error("Model error (attempt {attempt}, retryable: {retryable}): {message}")]
    Model {
        message: String,
        retryable: bool,
        attempt: u32,
    },
    /// Configuration could not be loaded or is inconsistent
    #[error("Config error: {reason}")]
    Config { reason: String },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Wrapped anyhow error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// A start failure caused by the container name already being taken.
    pub fn is_name_conflict(&self) -> bool {
        match self {
            ForgeError::ContainerStart { reason, .. } => {
                reason.contains("Conflict") || reason.contains("already in use")
            }
            _ => false,
        }
    }

    /// Errors that abort a repair loop instead of driving another attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ForgeError::Precondition { .. }
                | ForgeError::ImageNotFound { .. }
                | ForgeError::ContainerStart { .. }
        )
    }
}

/// Helper to determine if an error is retryable
pub fn is_retryable(err: &ForgeError) -> bool {
    match err {
        ForgeError::Model { retryable, .. } => *retryable,
        ForgeError::Precondition { .. } => false,
        ForgeError::ImageNotFound { .. } => false,
        ForgeError::ContainerStart { .. } => false,
        ForgeError::Runtime { .. } => false,
        ForgeError::Config { .. } => false,
        ForgeError::Io { .. } => false,
        ForgeError::Other(_) => false,
    }
}

/// Retry configuration for resilient operations
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // Add jitter: ±20% of backoff
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    ((backoff as f64) + jitter).max(0.0) as u64
}
