//! facematch-models — Embedding model acquisition.
//!
//! Obtains a working inference model from an ordered list of untrusted
//! sources: probe the local cache, then try each source in priority order,
//! validating every candidate with a synthetic forward pass before handing
//! it out. Successful source loads are persisted back to the cache.

pub mod backend;
pub mod cache;
pub mod error;
pub mod input;
pub mod loader;
pub mod ort_runtime;
pub mod progress;
pub mod runtime;
pub mod source;

pub use backend::{init_runtime, Backend, BackendPreference, RuntimeConfig, RuntimeState};
pub use cache::ModelCache;
pub use error::{ModelError, RuntimeError};
pub use input::{model_input_size, InputLayout, InputSize};
pub use loader::{LoadState, ModelHandle, ModelLoader, DEFAULT_CACHE_KEY};
pub use ort_runtime::{OrtModel, OrtRuntime};
pub use runtime::{CachedModelInfo, InferenceRuntime, Tensor};
pub use source::ModelSource;
