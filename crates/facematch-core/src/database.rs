//! Reference database of known identities.
//!
//! On disk this is a JSON object mapping each identity label to an array of
//! embeddings: `{"alice": [[0.1, ...], ...], "bob": [...]}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid database JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("identity labels must be non-empty")]
    EmptyLabel,
    #[error("embedding {index} for {identity:?} contains a non-finite value")]
    NonFinite { identity: String, index: usize },
}

/// Identity label → reference embeddings.
///
/// Iteration is in lexicographic label order, then stored order within a
/// label. Embeddings of differing lengths may coexist; matching skips the
/// ones that do not fit the probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceDatabase {
    identities: BTreeMap<String, Vec<Vec<f32>>>,
}

impl ReferenceDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, DatabaseError> {
        let db: Self = serde_json::from_str(json)?;
        db.validate()?;
        Ok(db)
    }

    /// Load a database from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let db = Self::from_json_str(&json)?;
        tracing::debug!(
            path = %path.as_ref().display(),
            identities = db.len(),
            embeddings = db.embedding_count(),
            "loaded reference database"
        );
        Ok(db)
    }

    pub fn to_json_string(&self) -> Result<String, DatabaseError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Write the database as JSON, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DatabaseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// Append an embedding under `identity`, creating the identity if needed.
    pub fn insert(&mut self, identity: impl Into<String>, embedding: Vec<f32>) -> Result<(), DatabaseError> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(DatabaseError::EmptyLabel);
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            let index = self.identities.get(&identity).map_or(0, Vec::len);
            return Err(DatabaseError::NonFinite { identity, index });
        }
        self.identities.entry(identity).or_default().push(embedding);
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<&[Vec<f32>]> {
        self.identities.get(identity).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Vec<f32>])> {
        self.identities.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Total number of stored embeddings across all identities.
    pub fn embedding_count(&self) -> usize {
        self.identities.values().map(Vec::len).sum()
    }

    /// Most common embedding length, if the database holds any embeddings.
    ///
    /// Ties resolve to the shorter length.
    pub fn dimension(&self) -> Option<usize> {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for e in self.identities.values().flatten() {
            *counts.entry(e.len()).or_default() += 1;
        }
        counts
            .into_iter()
            .fold(None, |best: Option<(usize, usize)>, (len, n)| match best {
                Some((_, best_n)) if best_n >= n => best,
                _ => Some((len, n)),
            })
            .map(|(len, _)| len)
    }

    fn validate(&self) -> Result<(), DatabaseError> {
        for (identity, embeddings) in &self.identities {
            if identity.is_empty() {
                return Err(DatabaseError::EmptyLabel);
            }
            if let Some(index) = embeddings.iter().position(|e| e.iter().any(|v| !v.is_finite())) {
                return Err(DatabaseError::NonFinite {
                    identity: identity.clone(),
                    index,
                });
            }
        }
        Ok(())
    }
}
