//! Inference backend selection.
//!
//! The host calls [`init_runtime`] once at startup; the returned
//! [`RuntimeState`] is required to construct an [`OrtRuntime`](crate::OrtRuntime),
//! so no model can be loaded before the backend is decided.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DEFAULT_INTRA_THREADS: usize = 2;
/// Accelerator memory ceiling before the arena stops growing (512 MiB).
const DEFAULT_CLEANUP_THRESHOLD: usize = 512 * 1024 * 1024;

/// Compute backend a session runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Cpu,
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda => f.write_str("cuda"),
        }
    }
}

/// Requested backend. `Auto` takes an accelerator when one is usable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(format!("unknown backend: {other} (expected auto, cpu or cuda)")),
        }
    }
}

/// Process-wide inference settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub backend: BackendPreference,
    /// Accelerator memory limit in bytes for each session's arena; `0` = unlimited.
    pub cleanup_threshold: usize,
    /// Intra-op threads per session.
    pub intra_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            cleanup_threshold: DEFAULT_CLEANUP_THRESHOLD,
            intra_threads: DEFAULT_INTRA_THREADS,
        }
    }
}

/// Outcome of [`init_runtime`]: the backend actually in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeState {
    pub backend: Backend,
    pub cleanup_threshold: usize,
    pub intra_threads: usize,
}

/// Decide the backend for this process.
///
/// An unavailable accelerator is never fatal: the runtime falls back to CPU
/// and logs a warning.
pub fn init_runtime(config: &RuntimeConfig) -> RuntimeState {
    let backend = match config.backend {
        BackendPreference::Cpu => Backend::Cpu,
        BackendPreference::Auto => {
            if accelerator_available() {
                Backend::Cuda
            } else {
                Backend::Cpu
            }
        }
        BackendPreference::Cuda => {
            if accelerator_available() {
                Backend::Cuda
            } else {
                tracing::warn!("CUDA backend requested but unavailable; falling back to CPU");
                Backend::Cpu
            }
        }
    };

    let state = RuntimeState {
        backend,
        cleanup_threshold: config.cleanup_threshold,
        intra_threads: config.intra_threads.max(1),
    };
    tracing::info!(
        backend = %state.backend,
        cleanup_threshold = state.cleanup_threshold,
        intra_threads = state.intra_threads,
        "inference runtime initialized"
    );
    state
}

#[cfg(feature = "cuda")]
fn accelerator_available() -> bool {
    use ort::execution_providers::{ExecutionProvider, CUDA as CUDAExecutionProvider};

    match CUDAExecutionProvider::default().is_available() {
        Ok(available) => available,
        Err(e) => {
            tracing::debug!(error = %e, "CUDA availability probe failed");
            false
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn accelerator_available() -> bool {
    false
}
