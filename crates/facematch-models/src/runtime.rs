//! Inference runtime boundary.
//!
//! The acquisition pipeline only talks to a runtime through
//! [`InferenceRuntime`], so any engine that can load, run and cache a model
//! can be substituted (ONNX Runtime in production, a mock in tests).

use crate::backend::Backend;
use crate::error::RuntimeError;
use crate::source::ModelSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dense `f32` tensor of any rank.
pub type Tensor = ndarray::ArrayD<f32>;

/// Metadata stored alongside a cached model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedModelInfo {
    pub key: String,
    /// Source the model was originally obtained from.
    pub origin: String,
    /// Hex-encoded SHA-256 of the serialized model.
    pub sha256: String,
    pub size_bytes: u64,
    pub saved_at: DateTime<Utc>,
}

#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    type Model: Send + Sync;

    /// Whether a persistent model cache is configured.
    fn has_cache(&self) -> bool;

    /// Cached models by key.
    async fn list_cached_models(&self) -> Result<BTreeMap<String, CachedModelInfo>, RuntimeError>;

    /// Fetch and deserialize a model.
    ///
    /// `progress` receives the completed fraction in [0, 1].
    async fn load_model(
        &self,
        location: &ModelSource,
        progress: &mut (dyn FnMut(f32) + Send),
    ) -> Result<Self::Model, RuntimeError>;

    /// Run one forward pass on the model's first input.
    async fn predict(&self, model: &Self::Model, input: Tensor) -> Result<Tensor, RuntimeError>;

    /// Persist a loaded model under `key`, replacing any previous entry.
    async fn save_model(&self, model: &Self::Model, key: &str) -> Result<(), RuntimeError>;

    /// Remove the cached model stored under `key`. A missing entry is not an error.
    async fn evict_cached_model(&self, key: &str) -> Result<(), RuntimeError>;

    /// Declared shape of the model's first input. Unknown dimensions are `<= 0`.
    fn input_shape(&self, model: &Self::Model) -> Option<Vec<i64>>;

    /// Backend sessions are created on.
    fn backend(&self) -> Backend;
}
