//! Model acquisition pipeline.
//!
//! ```text
//! CheckingCache ─hit─▶ LoadingFromCache ─▶ Validating ─ok─▶ Ready
//!       │miss                                  │fail
//!       ▼                                      ▼
//! TryingSource[i] ─▶ Validating ─ok─▶ CachingForFuture ─▶ Ready
//!       ▲                 │fail
//!       └──── i + 1 ◀─────┘            (no sources left) ─▶ Failed
//! ```
//!
//! Every candidate, cached or not, goes through the same
//! [`attempt`](ModelLoader::attempt) step; its error is recorded and the
//! next candidate is tried. Only exhausting every candidate is fatal.

use crate::error::{ModelError, RuntimeError};
use crate::input::{self, InputLayout, InputSize};
use crate::progress::Progress;
use crate::runtime::{InferenceRuntime, Tensor};
use crate::source::ModelSource;
use std::fmt;

/// Cache key the pipeline reads and writes.
pub const DEFAULT_CACHE_KEY: &str = "facematch-embedder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    CheckingCache,
    LoadingFromCache,
    TryingSource(usize),
    Validating,
    CachingForFuture,
    Ready,
    Failed,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckingCache => f.write_str("checking cache"),
            Self::LoadingFromCache => f.write_str("loading from cache"),
            Self::TryingSource(i) => write!(f, "trying source {i}"),
            Self::Validating => f.write_str("validating"),
            Self::CachingForFuture => f.write_str("caching for future"),
            Self::Ready => f.write_str("ready"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// A validated, ready-to-predict model.
#[derive(Debug)]
pub struct ModelHandle<M> {
    pub model: M,
    pub input_size: InputSize,
    pub layout: InputLayout,
    /// Where the model was loaded from.
    pub origin: ModelSource,
    /// Source the model was first obtained from (differs from `origin` on a cache hit).
    pub provenance: String,
}

impl<M> ModelHandle<M> {
    /// `[width, height]` the model expects.
    pub fn input_size(&self) -> [u32; 2] {
        self.input_size.to_array()
    }

    pub fn from_cache(&self) -> bool {
        self.origin.is_cache()
    }
}

/// Resolves a working model from the cache or an ordered list of sources.
pub struct ModelLoader<R: InferenceRuntime> {
    runtime: R,
    sources: Vec<ModelSource>,
    cache_key: String,
}

impl<R: InferenceRuntime> ModelLoader<R> {
    pub fn new(runtime: R, sources: Vec<ModelSource>) -> Self {
        Self {
            runtime,
            sources,
            cache_key: DEFAULT_CACHE_KEY.to_string(),
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = key.into();
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Obtain a validated model, reporting per-attempt progress in percent.
    ///
    /// Safe to call again after a failure or to refresh a session; each call
    /// starts over from the cache probe.
    pub async fn load_model<F>(&self, mut on_progress: F) -> Result<ModelHandle<R::Model>, ModelError>
    where
        F: FnMut(u8) + Send,
    {
        let mut progress = Progress::new(&mut on_progress);
        let mut last_error: Option<ModelError> = None;

        self.enter(LoadState::CheckingCache);
        progress.begin();
        if let Some(provenance) = self.probe_cache().await {
            self.enter(LoadState::LoadingFromCache);
            let source = ModelSource::Cache(self.cache_key.clone());
            match self.attempt(&source, &provenance, &mut progress).await {
                Ok(handle) => {
                    self.enter(LoadState::Ready);
                    tracing::info!(key = %self.cache_key, provenance = %handle.provenance, "model loaded from cache");
                    return Ok(handle);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "cached model unusable; trying sources");
                    if is_bad_cache_entry(&err) {
                        self.evict().await;
                    }
                    last_error = Some(err);
                }
            }
        }

        for (i, source) in self.sources.iter().enumerate() {
            self.enter(LoadState::TryingSource(i));
            progress.begin();
            let identifier = source.identifier();
            match self.attempt(source, &identifier, &mut progress).await {
                Ok(handle) => {
                    if !self.is_own_cache_entry(source) {
                        self.persist(&handle).await;
                    }
                    self.enter(LoadState::Ready);
                    tracing::info!(
                        source = %source,
                        width = handle.input_size.width,
                        height = handle.input_size.height,
                        "model ready"
                    );
                    return Ok(handle);
                }
                Err(err) => {
                    tracing::warn!(source = %source, error = %err, "model source failed");
                    last_error = Some(err);
                }
            }
        }

        self.enter(LoadState::Failed);
        Err(ModelError::AllSourcesExhausted {
            last: last_error.map(Box::new),
        })
    }

    /// Load one candidate and validate it.
    ///
    /// `identifier` names the model for the input-size heuristic; for a cache
    /// hit it is the recorded original source.
    async fn attempt(
        &self,
        source: &ModelSource,
        identifier: &str,
        progress: &mut Progress<'_>,
    ) -> Result<ModelHandle<R::Model>, ModelError> {
        progress.located();
        let model = self
            .runtime
            .load_model(source, &mut |fraction: f32| progress.loading(fraction))
            .await
            .map_err(|cause| ModelError::SourceLoadFailure {
                source_id: source.identifier(),
                cause,
            })?;

        let declared = self.runtime.input_shape(&model);
        let input_size = input::model_input_size(&self.runtime, &model, identifier);
        let layout = InputLayout::detect(declared.as_deref());

        self.enter(LoadState::Validating);
        self.validate(&model, declared.as_deref(), input_size)
            .await
            .map_err(|cause| ModelError::ValidationFailure {
                source_id: source.identifier(),
                cause,
            })?;

        Ok(ModelHandle {
            model,
            input_size,
            layout,
            origin: source.clone(),
            provenance: identifier.to_string(),
        })
    }

    /// Smoke test: one forward pass on a zero-filled input.
    async fn validate(
        &self,
        model: &R::Model,
        declared: Option<&[i64]>,
        input_size: InputSize,
    ) -> Result<(), crate::error::RuntimeError> {
        let shape = input::probe_shape(declared, input_size);
        let probe = Tensor::zeros(ndarray::IxDyn(&shape));
        let output = self.runtime.predict(model, probe).await?;
        tracing::debug!(input = ?shape, output = ?output.shape(), "validation pass succeeded");
        Ok(())
    }

    /// Original source of the cached model, if the cache holds one.
    async fn probe_cache(&self) -> Option<String> {
        if !self.runtime.has_cache() {
            tracing::debug!("no persistent cache configured");
            return None;
        }
        match self.runtime.list_cached_models().await {
            Ok(entries) => match entries.get(&self.cache_key) {
                Some(info) => {
                    tracing::debug!(key = %self.cache_key, origin = %info.origin, saved_at = %info.saved_at, "cache hit");
                    Some(info.origin.clone())
                }
                None => {
                    tracing::debug!(key = %self.cache_key, "cache miss");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "cache probe failed; treating as miss");
                None
            }
        }
    }

    /// Store a freshly loaded model for later sessions. Failures are logged only.
    async fn persist(&self, handle: &ModelHandle<R::Model>) {
        if !self.runtime.has_cache() {
            return;
        }
        self.enter(LoadState::CachingForFuture);
        if let Err(cause) = self.runtime.save_model(&handle.model, &self.cache_key).await {
            let err = ModelError::CachePersistFailure {
                key: self.cache_key.clone(),
                cause,
            };
            tracing::warn!(error = %err, "continuing without caching");
        }
    }

    /// Drop the cache entry so later loads do not retry it. Failures are logged only.
    async fn evict(&self) {
        match self.runtime.evict_cached_model(&self.cache_key).await {
            Ok(()) => tracing::info!(key = %self.cache_key, "evicted unusable cache entry"),
            Err(e) => tracing::warn!(key = %self.cache_key, error = %e, "failed to evict cache entry"),
        }
    }

    fn is_own_cache_entry(&self, source: &ModelSource) -> bool {
        matches!(source, ModelSource::Cache(key) if *key == self.cache_key)
    }

    fn enter(&self, state: LoadState) {
        tracing::debug!(state = %state, "model loader");
    }
}

/// Whether a failed cache attempt means the stored entry itself is bad, as
/// opposed to a transient runtime problem.
fn is_bad_cache_entry(err: &ModelError) -> bool {
    matches!(
        err,
        ModelError::ValidationFailure { .. }
            | ModelError::SourceLoadFailure {
                cause: RuntimeError::CorruptCache { .. } | RuntimeError::Ort(_),
                ..
            }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::runtime::CachedModelInfo;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockModel {
        location: String,
        shape: Option<Vec<i64>>,
        broken: bool,
    }

    /// Scripted runtime: locations in `unloadable` fail to load, locations in
    /// `broken` load but fail inference.
    #[derive(Default)]
    struct MockRuntime {
        cache: Option<Mutex<BTreeMap<String, CachedModelInfo>>>,
        unloadable: HashSet<String>,
        broken: HashSet<String>,
        shapes: BTreeMap<String, Vec<i64>>,
        fail_save: bool,
        loads: Mutex<Vec<String>>,
        saves: Mutex<Vec<String>>,
        evictions: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        fn with_cache(mut self, entries: &[(&str, &str)]) -> Self {
            let map = entries
                .iter()
                .map(|(key, origin)| {
                    (
                        key.to_string(),
                        CachedModelInfo {
                            key: key.to_string(),
                            origin: origin.to_string(),
                            sha256: String::new(),
                            size_bytes: 0,
                            saved_at: Utc::now(),
                        },
                    )
                })
                .collect();
            self.cache = Some(Mutex::new(map));
            self
        }

        fn unloadable(mut self, location: &str) -> Self {
            self.unloadable.insert(location.to_string());
            self
        }

        fn broken(mut self, location: &str) -> Self {
            self.broken.insert(location.to_string());
            self
        }

        fn shape(mut self, location: &str, shape: &[i64]) -> Self {
            self.shapes.insert(location.to_string(), shape.to_vec());
            self
        }

        fn loads(&self) -> Vec<String> {
            self.loads.lock().unwrap().clone()
        }

        fn saves(&self) -> Vec<String> {
            self.saves.lock().unwrap().clone()
        }

        fn evictions(&self) -> Vec<String> {
            self.evictions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InferenceRuntime for MockRuntime {
        type Model = MockModel;

        fn has_cache(&self) -> bool {
            self.cache.is_some()
        }

        async fn list_cached_models(&self) -> Result<BTreeMap<String, CachedModelInfo>, RuntimeError> {
            match &self.cache {
                Some(cache) => Ok(cache.lock().unwrap().clone()),
                None => Err(RuntimeError::CacheUnavailable),
            }
        }

        async fn load_model(
            &self,
            location: &ModelSource,
            progress: &mut (dyn FnMut(f32) + Send),
        ) -> Result<MockModel, RuntimeError> {
            let location = location.to_string();
            self.loads.lock().unwrap().push(location.clone());
            if self.unloadable.contains(&location) {
                return Err(RuntimeError::NotFound(location));
            }
            progress(0.5);
            progress(1.0);
            Ok(MockModel {
                shape: self.shapes.get(&location).cloned(),
                broken: self.broken.contains(&location),
                location,
            })
        }

        async fn predict(&self, model: &MockModel, input: Tensor) -> Result<Tensor, RuntimeError> {
            if model.broken {
                return Err(RuntimeError::Inference(format!("{} cannot run", model.location)));
            }
            if let Some(shape) = &model.shape {
                let fits = shape.len() == input.ndim()
                    && shape.iter().zip(input.shape()).all(|(&d, &n)| d <= 0 || d as usize == n);
                if !fits {
                    return Err(RuntimeError::Inference(format!("bad input shape {:?}", input.shape())));
                }
            }
            Ok(Tensor::zeros(ndarray::IxDyn(&[1, 128])))
        }

        async fn save_model(&self, model: &MockModel, key: &str) -> Result<(), RuntimeError> {
            if self.fail_save {
                return Err(RuntimeError::Io(std::io::Error::other("disk full")));
            }
            self.saves.lock().unwrap().push(format!("{key}<-{}", model.location));
            Ok(())
        }

        async fn evict_cached_model(&self, key: &str) -> Result<(), RuntimeError> {
            let cache = self.cache.as_ref().ok_or(RuntimeError::CacheUnavailable)?;
            cache.lock().unwrap().remove(key);
            self.evictions.lock().unwrap().push(key.to_string());
            Ok(())
        }

        fn input_shape(&self, model: &MockModel) -> Option<Vec<i64>> {
            model.shape.clone()
        }

        fn backend(&self) -> Backend {
            Backend::Cpu
        }
    }

    fn sources(raw: &[&str]) -> Vec<ModelSource> {
        raw.iter().map(|s| s.parse::<ModelSource>().unwrap()).collect()
    }

    const A: &str = "https://a.example/facenet.onnx";
    const B: &str = "https://b.example/facenet.onnx";
    const C: &str = "https://c.example/facenet.onnx";
    const CACHED: &str = "cache:facematch-embedder";

    #[tokio::test]
    async fn test_cache_hit_is_used() {
        let runtime = MockRuntime::default().with_cache(&[(DEFAULT_CACHE_KEY, A)]);
        let loader = ModelLoader::new(runtime, sources(&[B]));

        let handle = loader.load_model(|_| {}).await.unwrap();
        assert!(handle.from_cache());
        assert_eq!(handle.provenance, A);
        assert_eq!(loader.runtime().loads(), vec![CACHED]);
        assert!(loader.runtime().saves().is_empty());
    }

    #[tokio::test]
    async fn test_broken_cache_entry_falls_through() {
        let runtime = MockRuntime::default()
            .with_cache(&[(DEFAULT_CACHE_KEY, A)])
            .broken(CACHED);
        let loader = ModelLoader::new(runtime, sources(&[B]));

        let handle = loader.load_model(|_| {}).await.unwrap();
        assert!(!handle.from_cache());
        assert_eq!(handle.origin.to_string(), B);
        assert_eq!(loader.runtime().loads(), vec![CACHED, B]);
        assert_eq!(loader.runtime().saves(), vec![format!("{DEFAULT_CACHE_KEY}<-{B}")]);
    }

    #[tokio::test]
    async fn test_invalid_cache_entry_is_not_retried() {
        let runtime = MockRuntime::default()
            .with_cache(&[(DEFAULT_CACHE_KEY, A)])
            .broken(CACHED)
            .unloadable(B);
        let loader = ModelLoader::new(runtime, sources(&[B]));

        assert!(loader.load_model(|_| {}).await.is_err());
        assert_eq!(loader.runtime().evictions(), vec![DEFAULT_CACHE_KEY]);

        assert!(loader.load_model(|_| {}).await.is_err());
        assert_eq!(loader.runtime().loads(), vec![CACHED, B, B]);
    }

    #[tokio::test]
    async fn test_unloadable_cache_entry_is_kept() {
        let runtime = MockRuntime::default()
            .with_cache(&[(DEFAULT_CACHE_KEY, A)])
            .unloadable(CACHED);
        let loader = ModelLoader::new(runtime, sources(&[B]));

        loader.load_model(|_| {}).await.unwrap();
        assert!(loader.runtime().evictions().is_empty());
    }

    #[tokio::test]
    async fn test_own_cache_source_is_not_persisted_again() {
        let runtime = MockRuntime::default().with_cache(&[]);
        let loader = ModelLoader::new(runtime, sources(&[CACHED, B]));

        let handle = loader.load_model(|_| {}).await.unwrap();
        assert_eq!(handle.origin.to_string(), CACHED);
        assert_eq!(loader.runtime().loads(), vec![CACHED]);
        assert!(loader.runtime().saves().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_stops_at_first_success() {
        let runtime = MockRuntime::default().with_cache(&[]).unloadable(A);
        let loader = ModelLoader::new(runtime, sources(&[A, B, C]));

        let handle = loader.load_model(|_| {}).await.unwrap();
        assert_eq!(handle.origin.to_string(), B);
        assert_eq!(loader.runtime().loads(), vec![A, B]);
    }

    #[tokio::test]
    async fn test_validation_failure_falls_back() {
        let runtime = MockRuntime::default().broken(A);
        let loader = ModelLoader::new(runtime, sources(&[A, B]));

        let handle = loader.load_model(|_| {}).await.unwrap();
        assert_eq!(handle.origin.to_string(), B);
    }

    #[tokio::test]
    async fn test_all_sources_exhausted_keeps_last_error() {
        let runtime = MockRuntime::default().unloadable(A).broken(B);
        let loader = ModelLoader::new(runtime, sources(&[A, B]));

        let err = loader.load_model(|_| {}).await.unwrap_err();
        match err {
            ModelError::AllSourcesExhausted { last: Some(last) } => {
                assert!(matches!(*last, ModelError::ValidationFailure { .. }));
                assert_eq!(last.source_id(), Some(B));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_no_sources_generic_error() {
        let loader = ModelLoader::new(MockRuntime::default(), Vec::new());
        let err = loader.load_model(|_| {}).await.unwrap_err();
        assert!(matches!(err, ModelError::AllSourcesExhausted { last: None }));
        assert!(err.to_string().starts_with("no model could be loaded from any source"));
    }

    #[tokio::test]
    async fn test_persist_failure_is_not_fatal() {
        let runtime = MockRuntime {
            fail_save: true,
            ..MockRuntime::default()
        }
        .with_cache(&[]);
        let loader = ModelLoader::new(runtime, sources(&[A]));
        assert!(loader.load_model(|_| {}).await.is_ok());
    }

    #[tokio::test]
    async fn test_no_cache_skips_persist() {
        let loader = ModelLoader::new(MockRuntime::default(), sources(&[A]));
        loader.load_model(|_| {}).await.unwrap();
        assert!(loader.runtime().saves().is_empty());
    }

    #[tokio::test]
    async fn test_progress_convention() {
        let runtime = MockRuntime::default().unloadable(A);
        let loader = ModelLoader::new(runtime, sources(&[A, B]));

        let mut seen = Vec::new();
        loader.load_model(|p| seen.push(p)).await.unwrap();
        // A: 0 → 20 then fails; B restarts at 0 and reaches 100.
        assert_eq!(seen, vec![0, 20, 0, 20, 60, 100]);
    }

    #[tokio::test]
    async fn test_input_size_from_declared_shape() {
        let runtime = MockRuntime::default().shape(A, &[-1, 3, 112, 112]);
        let loader = ModelLoader::new(runtime, sources(&[A]));

        let handle = loader.load_model(|_| {}).await.unwrap();
        assert_eq!(handle.input_size(), [112, 112]);
        assert_eq!(handle.layout, InputLayout::Nchw);
    }

    #[tokio::test]
    async fn test_input_size_small_variant_heuristic() {
        let source = "https://a.example/mobilefacenet.onnx";
        let loader = ModelLoader::new(MockRuntime::default(), sources(&[source]));

        let handle = loader.load_model(|_| {}).await.unwrap();
        assert_eq!(handle.input_size(), [112, 112]);
        assert_eq!(handle.layout, InputLayout::Nhwc);
    }

    #[tokio::test]
    async fn test_cache_hit_uses_original_name_for_heuristic() {
        let runtime = MockRuntime::default().with_cache(&[(DEFAULT_CACHE_KEY, "https://a.example/mobilefacenet.onnx")]);
        let loader = ModelLoader::new(runtime, Vec::new());

        let handle = loader.load_model(|_| {}).await.unwrap();
        assert_eq!(handle.input_size(), [112, 112]);
    }

    #[tokio::test]
    async fn test_custom_cache_key() {
        let runtime = MockRuntime::default().with_cache(&[(DEFAULT_CACHE_KEY, A)]);
        let loader = ModelLoader::new(runtime, sources(&[B])).with_cache_key("other");

        let handle = loader.load_model(|_| {}).await.unwrap();
        assert_eq!(handle.origin.to_string(), B);
        assert_eq!(loader.runtime().saves(), vec![format!("other<-{B}")]);
    }
}
