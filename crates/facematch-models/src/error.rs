use thiserror::Error;

/// Failures raised by an [`InferenceRuntime`](crate::InferenceRuntime) implementation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("cache entry {key:?} is corrupt: {reason}")]
    CorruptCache { key: String, reason: String },
    #[error("{location}: model is {size} bytes, limit is {limit}")]
    TooLarge { location: String, size: u64, limit: u64 },
    #[error("no persistent cache configured")]
    CacheUnavailable,
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failures of the model acquisition pipeline.
///
/// Only [`ModelError::AllSourcesExhausted`] ever reaches the caller of
/// [`ModelLoader::load_model`](crate::ModelLoader::load_model); the other
/// variants are recorded while falling back and attached as its cause.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to load model from {source_id}: {cause}")]
    SourceLoadFailure {
        source_id: String,
        #[source]
        cause: RuntimeError,
    },
    #[error("model from {source_id} failed validation: {cause}")]
    ValidationFailure {
        source_id: String,
        #[source]
        cause: RuntimeError,
    },
    #[error("no model could be loaded from any source: {}", describe_last(.last))]
    AllSourcesExhausted {
        #[source]
        last: Option<Box<ModelError>>,
    },
    #[error("failed to persist model under cache key {key:?}: {cause}")]
    CachePersistFailure {
        key: String,
        #[source]
        cause: RuntimeError,
    },
}

fn describe_last(last: &Option<Box<ModelError>>) -> String {
    match last {
        Some(err) => err.to_string(),
        None => "no sources were attempted".to_string(),
    }
}

impl ModelError {
    /// Identifier of the source this error concerns, if any.
    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::SourceLoadFailure { source_id, .. } | Self::ValidationFailure { source_id, .. } => {
                Some(source_id)
            }
            Self::AllSourcesExhausted { .. } | Self::CachePersistFailure { .. } => None,
        }
    }
}
