//! ONNX Runtime implementation of [`InferenceRuntime`].
//!
//! Models are fetched over HTTP(S), read from disk, or read from the
//! on-disk [`ModelCache`], then deserialized into an `ort` session. Session
//! construction and inference both run on blocking worker threads.

use crate::backend::{Backend, RuntimeState};
use crate::cache::ModelCache;
use crate::error::RuntimeError;
use crate::runtime::{CachedModelInfo, InferenceRuntime, Tensor};
use crate::source::ModelSource;
use async_trait::async_trait;
use ort::session::builder::SessionBuilder;
use ort::session::Session;
use ort::value::{TensorRef, ValueType};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Share of a load spent fetching bytes; the rest is session construction.
const FETCH_SHARE: f32 = 0.9;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest download accepted by default. ONNX protobufs cannot exceed 2 GiB.
pub const DEFAULT_MAX_MODEL_BYTES: u64 = 2 << 30;
/// Upper bound on what a `Content-Length` header may pre-allocate.
const MAX_PREALLOC: u64 = 64 << 20;

/// A loaded ONNX model.
pub struct OrtModel {
    session: Arc<Mutex<Session>>,
    bytes: Arc<[u8]>,
    origin: String,
    input_shape: Option<Vec<i64>>,
}

impl std::fmt::Debug for OrtModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtModel")
            .field("origin", &self.origin)
            .field("size_bytes", &self.bytes.len())
            .field("input_shape", &self.input_shape)
            .finish()
    }
}

pub struct OrtRuntime {
    state: RuntimeState,
    cache: Option<ModelCache>,
    client: reqwest::Client,
    max_model_bytes: u64,
}

impl OrtRuntime {
    /// Create a runtime for an initialized backend. `cache = None` disables persistence.
    pub fn new(state: RuntimeState, cache: Option<ModelCache>) -> Result<Self, RuntimeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("facematch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            state,
            cache,
            client,
            max_model_bytes: DEFAULT_MAX_MODEL_BYTES,
        })
    }

    /// Refuse downloads larger than `limit` bytes.
    pub fn with_max_model_bytes(mut self, limit: u64) -> Self {
        self.max_model_bytes = limit;
        self
    }

    pub fn cache(&self) -> Option<&ModelCache> {
        self.cache.as_ref()
    }

    async fn fetch(&self, url: &str, progress: &mut (dyn FnMut(f32) + Send)) -> Result<Vec<u8>, RuntimeError> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let limit = self.max_model_bytes;
        let total = response.content_length().filter(|&n| n > 0);
        if let Some(size) = total.filter(|&n| n > limit) {
            return Err(RuntimeError::TooLarge {
                location: url.to_string(),
                size,
                limit,
            });
        }
        let mut bytes = Vec::with_capacity(total.map_or(0, |n| n.min(MAX_PREALLOC)) as usize);

        while let Some(chunk) = response.chunk().await? {
            let size = (bytes.len() + chunk.len()) as u64;
            if size > limit {
                return Err(RuntimeError::TooLarge {
                    location: url.to_string(),
                    size,
                    limit,
                });
            }
            bytes.extend_from_slice(&chunk);
            if let Some(total) = total {
                progress(FETCH_SHARE * (bytes.len() as f32 / total as f32).min(1.0));
            }
        }
        if bytes.is_empty() {
            return Err(RuntimeError::NotFound(format!("{url}: empty response body")));
        }
        tracing::debug!(url, size = bytes.len(), "model downloaded");
        Ok(bytes)
    }

    async fn read_file(path: &Path) -> Result<Vec<u8>, RuntimeError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RuntimeError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl InferenceRuntime for OrtRuntime {
    type Model = OrtModel;

    fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    async fn list_cached_models(&self) -> Result<BTreeMap<String, CachedModelInfo>, RuntimeError> {
        match &self.cache {
            Some(cache) => cache.list().await,
            None => Err(RuntimeError::CacheUnavailable),
        }
    }

    async fn load_model(
        &self,
        location: &ModelSource,
        progress: &mut (dyn FnMut(f32) + Send),
    ) -> Result<OrtModel, RuntimeError> {
        let (bytes, origin) = match location {
            ModelSource::Cache(key) => {
                let cache = self.cache.as_ref().ok_or(RuntimeError::CacheUnavailable)?;
                let (bytes, info) = cache.read(key).await?;
                (bytes, info.origin)
            }
            ModelSource::Url(url) => (self.fetch(url, progress).await?, url.clone()),
            ModelSource::File(path) => (Self::read_file(path).await?, path.display().to_string()),
        };
        progress(FETCH_SHARE);

        let bytes: Arc<[u8]> = bytes.into();
        let state = self.state;
        let session_bytes = Arc::clone(&bytes);
        let session = tokio::task::spawn_blocking(move || build_session(&session_bytes, &state)).await??;

        let input_shape = session.inputs().first().and_then(|input| match input.dtype() {
            ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect::<Vec<i64>>()),
            _ => None,
        });

        tracing::info!(
            source = %location,
            backend = %self.state.backend,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ONNX model"
        );
        progress(1.0);

        Ok(OrtModel {
            session: Arc::new(Mutex::new(session)),
            bytes,
            origin,
            input_shape,
        })
    }

    async fn predict(&self, model: &OrtModel, input: Tensor) -> Result<Tensor, RuntimeError> {
        let session = Arc::clone(&model.session);
        tokio::task::spawn_blocking(move || run_session(&session, &input)).await?
    }

    async fn save_model(&self, model: &OrtModel, key: &str) -> Result<(), RuntimeError> {
        let cache = self.cache.as_ref().ok_or(RuntimeError::CacheUnavailable)?;
        cache.write(key, &model.origin, &model.bytes).await?;
        Ok(())
    }

    async fn evict_cached_model(&self, key: &str) -> Result<(), RuntimeError> {
        let cache = self.cache.as_ref().ok_or(RuntimeError::CacheUnavailable)?;
        cache.remove(key).await?;
        Ok(())
    }

    fn input_shape(&self, model: &OrtModel) -> Option<Vec<i64>> {
        model.input_shape.clone()
    }

    fn backend(&self) -> Backend {
        self.state.backend
    }
}

fn run_session(session: &Mutex<Session>, input: &Tensor) -> Result<Tensor, RuntimeError> {
    let mut session = session
        .lock()
        .map_err(|_| RuntimeError::Inference("session lock poisoned".into()))?;

    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
    let (shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| RuntimeError::Inference(format!("output extraction: {e}")))?;

    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    Tensor::from_shape_vec(ndarray::IxDyn(&dims), data.to_vec())
        .map_err(|e| RuntimeError::Inference(format!("output shape {dims:?}: {e}")))
}

fn build_session(bytes: &[u8], state: &RuntimeState) -> Result<Session, RuntimeError> {
    let builder = Session::builder()?.with_intra_threads(state.intra_threads).map_err(ort::Error::from)?;
    let mut builder = with_backend(builder, state)?;
    Ok(builder.commit_from_memory(bytes)?)
}

#[cfg(feature = "cuda")]
fn with_backend(builder: SessionBuilder, state: &RuntimeState) -> Result<SessionBuilder, RuntimeError> {
    use ort::execution_providers::CUDA as CUDAExecutionProvider;

    if state.backend != Backend::Cuda {
        return Ok(builder);
    }
    let mut cuda = CUDAExecutionProvider::default();
    if state.cleanup_threshold > 0 {
        cuda = cuda.with_memory_limit(state.cleanup_threshold);
    }
    Ok(builder.with_execution_providers([cuda.build()]).map_err(ort::Error::from)?)
}

#[cfg(not(feature = "cuda"))]
fn with_backend(builder: SessionBuilder, state: &RuntimeState) -> Result<SessionBuilder, RuntimeError> {
    if state.backend == Backend::Cuda {
        tracing::warn!("built without CUDA support; session runs on CPU");
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{init_runtime, BackendPreference, RuntimeConfig};
    use crate::error::ModelError;
    use crate::loader::ModelLoader;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn cpu_state() -> RuntimeState {
        init_runtime(&RuntimeConfig {
            backend: BackendPreference::Cpu,
            ..RuntimeConfig::default()
        })
    }

    /// Runtime whose HTTP client ignores proxy settings from the environment.
    fn local_runtime() -> OrtRuntime {
        OrtRuntime {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            ..OrtRuntime::new(cpu_state(), None).unwrap()
        }
    }

    /// Answer a single HTTP request with `response` as raw bytes.
    ///
    /// With `close` the connection is shut down after writing, which ends a
    /// body sent without `Content-Length`.
    async fn serve_once(response: Vec<u8>, close: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(&response).await;
            if close {
                let _ = stream.shutdown().await;
            }
            // Hold the connection until the client hangs up.
            let _ = stream.read(&mut buf).await;
        });
        format!("http://{addr}/facenet.onnx")
    }

    fn response(head: &str, body: &[u8]) -> Vec<u8> {
        let mut raw = head.as_bytes().to_vec();
        raw.extend_from_slice(body);
        raw
    }

    #[tokio::test]
    async fn test_fetch_reports_progress_up_to_fetch_share() {
        let body = vec![7u8; 4096];
        let url = serve_once(
            response("HTTP/1.1 200 OK\r\nContent-Length: 4096\r\nConnection: close\r\n\r\n", &body),
            true,
        )
        .await;

        let mut seen: Vec<f32> = Vec::new();
        let bytes = local_runtime().fetch(&url, &mut |f: f32| seen.push(f)).await.unwrap();
        assert_eq!(bytes, body);
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert!((seen[seen.len() - 1] - FETCH_SHARE).abs() < 1e-6, "{seen:?}");
    }

    #[tokio::test]
    async fn test_fetch_empty_body_is_not_found() {
        let url = serve_once(response("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", b""), false).await;
        let err = local_runtime().fetch(&url, &mut |_: f32| {}).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_fetch_http_error_status() {
        let url = serve_once(response("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n", b""), false).await;
        let err = local_runtime().fetch(&url, &mut |_: f32| {}).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Http(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_huge_content_length_is_rejected_before_reading() {
        let url = serve_once(
            response("HTTP/1.1 200 OK\r\nContent-Length: 4611686018427387904\r\n\r\n", b"partial"),
            false,
        )
        .await;
        let err = local_runtime()
            .load_model(&ModelSource::Url(url), &mut |_: f32| {})
            .await
            .unwrap_err();
        match err {
            RuntimeError::TooLarge { size, limit, .. } => {
                assert_eq!(size, 4_611_686_018_427_387_904);
                assert_eq!(limit, DEFAULT_MAX_MODEL_BYTES);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_body_limit_enforced_while_streaming() {
        let url = serve_once(
            response("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n", &[1u8; 64]),
            true,
        )
        .await;
        let runtime = local_runtime().with_max_model_bytes(16);
        let err = runtime.fetch(&url, &mut |_: f32| {}).await.unwrap_err();
        assert!(matches!(err, RuntimeError::TooLarge { limit: 16, .. }), "got {err}");
    }

    #[tokio::test]
    async fn test_oversized_source_falls_back_to_next() {
        let url = serve_once(
            response("HTTP/1.1 200 OK\r\nContent-Length: 4611686018427387904\r\n\r\n", b""),
            false,
        )
        .await;
        let sources = vec![
            ModelSource::Url(url.clone()),
            ModelSource::File("/nonexistent/facenet.onnx".into()),
        ];
        let loader = ModelLoader::new(local_runtime(), sources);

        let err = loader.load_model(|_| {}).await.unwrap_err();
        match err {
            ModelError::AllSourcesExhausted { last: Some(last) } => {
                assert_eq!(last.source_id(), Some("/nonexistent/facenet.onnx"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let runtime = OrtRuntime::new(cpu_state(), None).unwrap();
        let source = ModelSource::File("/nonexistent/facenet.onnx".into());
        let err = runtime.load_model(&source, &mut |_: f32| {}).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_cache_source_without_cache() {
        let runtime = OrtRuntime::new(cpu_state(), None).unwrap();
        assert!(!runtime.has_cache());
        assert!(matches!(
            runtime.list_cached_models().await,
            Err(RuntimeError::CacheUnavailable)
        ));
        let err = runtime
            .load_model(&ModelSource::Cache("k".into()), &mut |_: f32| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CacheUnavailable));
    }

    #[tokio::test]
    async fn test_evict_removes_cache_entry() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::new(temp.path());
        cache.write("k", "origin", b"weights").await.unwrap();

        let runtime = OrtRuntime::new(cpu_state(), Some(cache)).unwrap();
        runtime.evict_cached_model("k").await.unwrap();
        assert!(runtime.list_cached_models().await.unwrap().is_empty());
        // Already gone: still fine.
        runtime.evict_cached_model("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_fails_before_deserializing() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::new(temp.path());
        cache.write("k", "origin", b"weights").await.unwrap();
        std::fs::write(cache.entry_dir("k").join(crate::cache::MODEL_FILE), b"tampered").unwrap();

        let runtime = OrtRuntime::new(cpu_state(), Some(cache)).unwrap();
        assert_eq!(runtime.list_cached_models().await.unwrap().len(), 1);
        let err = runtime
            .load_model(&ModelSource::Cache("k".into()), &mut |_: f32| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CorruptCache { .. }), "got {err}");
    }
}
