//! On-disk model cache.
//!
//! Layout: `<root>/<key>/model.onnx` plus `<root>/<key>/meta.json`. Writes go
//! through a temporary file and a rename, so concurrent writers of one key
//! leave whichever entry finished last.

use crate::error::RuntimeError;
use crate::runtime::CachedModelInfo;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "model.onnx";
pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
}

impl ModelCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$XDG_CACHE_HOME/facematch/models` (or platform equivalent).
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("facematch")
            .join("models")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the entry for `key`.
    pub fn entry_dir(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    /// All readable entries, by key. Unreadable entries are skipped.
    pub async fn list(&self) -> Result<BTreeMap<String, CachedModelInfo>, RuntimeError> {
        let mut entries = BTreeMap::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let meta_path = entry.path().join(META_FILE);
            let raw = match tokio::fs::read(&meta_path).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match serde_json::from_slice::<CachedModelInfo>(&raw) {
                Ok(info) => {
                    entries.insert(info.key.clone(), info);
                }
                Err(e) => {
                    tracing::warn!(path = %meta_path.display(), error = %e, "ignoring unreadable cache metadata");
                }
            }
        }
        Ok(entries)
    }

    /// Read a cached model, verifying its size and digest.
    pub async fn read(&self, key: &str) -> Result<(Vec<u8>, CachedModelInfo), RuntimeError> {
        let dir = self.entry_dir(key);
        let raw_meta = match tokio::fs::read(dir.join(META_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuntimeError::NotFound(format!("cache:{key}")));
            }
            Err(e) => return Err(e.into()),
        };
        let info: CachedModelInfo = serde_json::from_slice(&raw_meta).map_err(|e| RuntimeError::CorruptCache {
            key: key.to_string(),
            reason: format!("metadata: {e}"),
        })?;

        let bytes = tokio::fs::read(dir.join(MODEL_FILE)).await?;
        if bytes.len() as u64 != info.size_bytes {
            return Err(RuntimeError::CorruptCache {
                key: key.to_string(),
                reason: format!("expected {} bytes, found {}", info.size_bytes, bytes.len()),
            });
        }
        let digest = sha256_hex(&bytes);
        if digest != info.sha256 {
            return Err(RuntimeError::CorruptCache {
                key: key.to_string(),
                reason: "sha256 mismatch".to_string(),
            });
        }
        Ok((bytes, info))
    }

    /// Store `bytes` under `key`, replacing any existing entry.
    pub async fn write(&self, key: &str, origin: &str, bytes: &[u8]) -> Result<CachedModelInfo, RuntimeError> {
        let dir = self.entry_dir(key);
        tokio::fs::create_dir_all(&dir).await?;

        let info = CachedModelInfo {
            key: key.to_string(),
            origin: origin.to_string(),
            sha256: sha256_hex(bytes),
            size_bytes: bytes.len() as u64,
            saved_at: Utc::now(),
        };
        let meta = serde_json::to_vec_pretty(&info).map_err(|e| RuntimeError::CorruptCache {
            key: key.to_string(),
            reason: format!("metadata: {e}"),
        })?;

        // Model first: a reader never sees metadata describing a missing model.
        write_atomic(&dir.join(MODEL_FILE), bytes).await?;
        write_atomic(&dir.join(META_FILE), &meta).await?;

        tracing::debug!(key, origin, size = info.size_bytes, "model cached");
        Ok(info)
    }

    pub async fn remove(&self, key: &str) -> Result<bool, RuntimeError> {
        match tokio::fs::remove_dir_all(self.entry_dir(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RuntimeError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", std::process::id()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
