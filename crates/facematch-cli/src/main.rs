use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::{find_closest_identity, DistanceMetric, Embedding, ReferenceDatabase};
use facematch_models::{
    init_runtime, BackendPreference, InferenceRuntime, ModelCache, ModelHandle, ModelLoader, ModelSource, OrtModel,
    OrtRuntime,
};
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};

mod config;
mod embedder;
mod enroll;

use config::Config;
use embedder::FaceEmbedder;

#[derive(Parser)]
#[command(name = "facematch", about = "Resolve face images to known identities")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Model source to try, in order (repeatable; replaces configured sources)
    #[arg(long = "source", global = true)]
    sources: Vec<ModelSource>,
    /// Reference database (JSON)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Maximum distance for a positive identification
    #[arg(long, global = true)]
    threshold: Option<f32>,
    /// Distance metric: cosine or euclidean
    #[arg(long, global = true)]
    metric: Option<DistanceMetric>,
    /// Inference backend: auto, cpu or cuda
    #[arg(long, global = true)]
    backend: Option<BackendPreference>,
    /// Do not read or write the model cache
    #[arg(long, global = true)]
    no_cache: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire and validate the embedding model, populating the cache
    Fetch,
    /// Identify the face in an image
    Identify {
        /// Cropped face image
        image: PathBuf,
    },
    /// Match a stored embedding against the database (no model needed)
    Match {
        /// JSON file holding an embedding array or `{"values": [...]}`
        embedding: PathBuf,
    },
    /// Build the reference database from a directory of identity folders
    Enroll {
        /// Directory with one subdirectory of face images per identity
        dir: PathBuf,
        /// Output path (defaults to the configured database)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Show backend, cache and database status
    Status,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if !self.sources.is_empty() {
            config.sources = self.sources.clone();
        }
        if let Some(db) = &self.db {
            config.db_path = db.clone();
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if let Some(backend) = self.backend {
            config.runtime.backend = backend;
        }
        if self.no_cache {
            config.cache_enabled = false;
        }
    }
}

/// Embedding file contents: a bare array or a serialized [`Embedding`].
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    Bare(Vec<f32>),
    Tagged(Embedding),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    tracing::debug!(?config, "configuration resolved");

    match &cli.command {
        Commands::Fetch => {
            let loader = build_loader(&config)?;
            let handle = load_with_progress(&loader).await?;
            print_json(&serde_json::json!({
                "origin": handle.origin.to_string(),
                "provenance": handle.provenance,
                "from_cache": handle.from_cache(),
                "cache_key": loader.cache_key(),
                "input_size": handle.input_size(),
                "layout": handle.layout,
                "backend": loader.runtime().backend(),
            }))?;
        }
        Commands::Identify { image } => {
            let db = load_database(&config.db_path)?;
            let loader = build_loader(&config)?;
            let handle = load_with_progress(&loader).await?;
            let embedder = FaceEmbedder::new(loader.runtime(), &handle);
            let embedding = embedder
                .embed_file(image)
                .await
                .with_context(|| format!("embedding {}", image.display()))?;
            let result = find_closest_identity(&embedding.values, &db, config.match_options());
            print_json(&result)?;
        }
        Commands::Match { embedding } => {
            let db = load_database(&config.db_path)?;
            let raw = std::fs::read_to_string(embedding)
                .with_context(|| format!("reading {}", embedding.display()))?;
            let values = match serde_json::from_str::<EmbeddingFile>(&raw)
                .with_context(|| format!("parsing {}", embedding.display()))?
            {
                EmbeddingFile::Bare(values) => values,
                EmbeddingFile::Tagged(e) => e.values,
            };
            let result = find_closest_identity(&values, &db, config.match_options());
            print_json(&result)?;
        }
        Commands::Enroll { dir, out } => {
            let out = out.clone().unwrap_or_else(|| config.db_path.clone());
            let loader = build_loader(&config)?;
            let handle = load_with_progress(&loader).await?;
            let embedder = FaceEmbedder::new(loader.runtime(), &handle);
            let (db, report) = enroll::build_database(&embedder, dir)
                .await
                .with_context(|| format!("reading {}", dir.display()))?;
            db.save(&out).with_context(|| format!("writing {}", out.display()))?;
            tracing::info!(path = %out.display(), dimension = ?db.dimension(), "database written");
            print_json(&report)?;
        }
        Commands::Status => {
            let runtime = build_runtime(&config)?;
            let cached = match runtime.cache() {
                Some(_) => serde_json::to_value(runtime.list_cached_models().await?)?,
                None => serde_json::Value::Null,
            };
            let database = match ReferenceDatabase::load(&config.db_path) {
                Ok(db) => serde_json::json!({
                    "path": config.db_path,
                    "identities": db.len(),
                    "embeddings": db.embedding_count(),
                    "dimension": db.dimension(),
                }),
                Err(e) => serde_json::json!({
                    "path": config.db_path,
                    "error": e.to_string(),
                }),
            };
            print_json(&serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "backend": runtime.backend(),
                "cache_key": config.cache_key,
                "cached_models": cached,
                "sources": config.sources.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "database": database,
                "threshold": config.threshold,
                "metric": config.metric,
            }))?;
        }
    }

    Ok(())
}

fn build_runtime(config: &Config) -> Result<OrtRuntime> {
    let state = init_runtime(&config.runtime);
    let cache = config.cache_enabled.then(|| ModelCache::new(&config.cache_dir));
    OrtRuntime::new(state, cache).context("initializing inference runtime")
}

fn build_loader(config: &Config) -> Result<ModelLoader<OrtRuntime>> {
    let runtime = build_runtime(config)?;
    Ok(ModelLoader::new(runtime, config.sources.clone()).with_cache_key(config.cache_key.clone()))
}

async fn load_with_progress(loader: &ModelLoader<OrtRuntime>) -> Result<ModelHandle<OrtModel>> {
    let result = loader
        .load_model(|percent| {
            eprint!("\rloading model: {percent:>3}%");
            let _ = std::io::stderr().flush();
        })
        .await;
    eprintln!();
    Ok(result?)
}

fn load_database(path: &Path) -> Result<ReferenceDatabase> {
    let db = ReferenceDatabase::load(path).with_context(|| format!("loading database {}", path.display()))?;
    if db.is_empty() {
        tracing::warn!(path = %path.display(), "reference database is empty; every face will be unknown");
    }
    Ok(db)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
