use anyhow::{Context, Result};
use facematch_core::{DistanceMetric, MatchOptions, DEFAULT_DISTANCE_THRESHOLD};
use facematch_models::{BackendPreference, ModelSource, RuntimeConfig, DEFAULT_CACHE_KEY};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration.
///
/// Layered: built-in defaults, then an optional TOML file (`--config` or
/// `FACEMATCH_CONFIG`), then `FACEMATCH_*` environment variables, then flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Model sources, tried in order after the cache.
    pub sources: Vec<ModelSource>,
    /// Directory of the persistent model cache.
    pub cache_dir: PathBuf,
    /// Key the acquired model is cached under.
    pub cache_key: String,
    pub cache_enabled: bool,
    /// Path to the JSON reference database.
    pub db_path: PathBuf,
    /// Maximum distance for a positive identification.
    pub threshold: f32,
    pub metric: DistanceMetric,
    pub runtime: RuntimeConfig,
}

/// On-disk form of [`Config`]; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    sources: Option<Vec<String>>,
    cache_dir: Option<PathBuf>,
    cache_key: Option<String>,
    cache_enabled: Option<bool>,
    db_path: Option<PathBuf>,
    threshold: Option<f32>,
    metric: Option<DistanceMetric>,
    backend: Option<BackendPreference>,
    cleanup_threshold: Option<usize>,
    intra_threads: Option<usize>,
}

impl Config {
    /// Defaults, overlaid with the config file and environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = Self::defaults();

        let path = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("FACEMATCH_CONFIG").ok().map(PathBuf::from));
        if let Some(path) = path {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            config
                .apply_toml(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;
        }

        config.apply_env()?;
        Ok(config)
    }

    pub fn defaults() -> Self {
        let model_dir = std::env::var("FACEMATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("models"));

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facematch");

        Self {
            sources: vec![ModelSource::File(model_dir.join("facenet.onnx"))],
            cache_dir: facematch_models::ModelCache::default_dir(),
            cache_key: DEFAULT_CACHE_KEY.to_string(),
            cache_enabled: true,
            db_path: data_dir.join("database.json"),
            threshold: DEFAULT_DISTANCE_THRESHOLD,
            metric: DistanceMetric::Cosine,
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            threshold: self.threshold,
            metric: self.metric,
        }
    }

    fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(raw)?;
        if let Some(sources) = file.sources {
            self.sources = parse_sources(sources.iter().map(String::as_str))?;
        }
        if let Some(v) = file.cache_dir {
            self.cache_dir = v;
        }
        if let Some(v) = file.cache_key {
            self.cache_key = v;
        }
        if let Some(v) = file.cache_enabled {
            self.cache_enabled = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.threshold {
            self.threshold = v;
        }
        if let Some(v) = file.metric {
            self.metric = v;
        }
        if let Some(v) = file.backend {
            self.runtime.backend = v;
        }
        if let Some(v) = file.cleanup_threshold {
            self.runtime.cleanup_threshold = v;
        }
        if let Some(v) = file.intra_threads {
            self.runtime.intra_threads = v;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("FACEMATCH_SOURCES") {
            self.sources = parse_sources(raw.split(',').filter(|s| !s.trim().is_empty()))
                .context("FACEMATCH_SOURCES")?;
        }
        if let Ok(v) = std::env::var("FACEMATCH_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEMATCH_CACHE_KEY") {
            self.cache_key = v;
        }
        if let Ok(v) = std::env::var("FACEMATCH_CACHE_ENABLED") {
            self.cache_enabled = v != "0";
        }
        if let Ok(v) = std::env::var("FACEMATCH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse("FACEMATCH_THRESHOLD") {
            self.threshold = v;
        }
        if let Some(v) = env_parse("FACEMATCH_METRIC") {
            self.metric = v;
        }
        if let Some(v) = env_parse("FACEMATCH_BACKEND") {
            self.runtime.backend = v;
        }
        if let Some(v) = env_parse("FACEMATCH_CLEANUP_THRESHOLD") {
            self.runtime.cleanup_threshold = v;
        }
        Ok(())
    }
}

fn parse_sources<'a>(raw: impl Iterator<Item = &'a str>) -> Result<Vec<ModelSource>> {
    raw.map(|s| s.parse::<ModelSource>().map_err(anyhow::Error::msg))
        .collect()
}

/// Parse an environment variable, ignoring it (with a warning) when malformed.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed environment variable");
            None
        }
    }
}
