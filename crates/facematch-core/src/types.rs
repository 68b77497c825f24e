use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity reported when no database entry is close enough to the probe.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Distance reported when nothing in the database was comparable.
pub const NO_MATCH_DISTANCE: f32 = f32::MAX;

/// Default maximum distance for a match to be accepted.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.4;

/// Face embedding vector (typically 128-dimensional for FaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Scale to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|x| *x /= norm);
        }
        self
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// How two embeddings of equal length are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in [0, 2]. Ignores embedding magnitude.
    #[default]
    Cosine,
    /// L2 distance, in [0, ∞). For models trained with meaningful norms.
    Euclidean,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => f.write_str("cosine"),
            Self::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "euclidean" | "l2" => Ok(Self::Euclidean),
            other => Err(format!("unknown distance metric: {other} (expected cosine or euclidean)")),
        }
    }
}

/// Caller-tunable knobs for identity resolution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchOptions {
    /// Maximum accepted distance; anything further resolves to [`UNKNOWN_IDENTITY`].
    pub threshold: f32,
    pub metric: DistanceMetric,
}

impl MatchOptions {
    pub fn cosine(threshold: f32) -> Self {
        Self {
            threshold,
            metric: DistanceMetric::Cosine,
        }
    }

    pub fn euclidean(threshold: f32) -> Self {
        Self {
            threshold,
            metric: DistanceMetric::Euclidean,
        }
    }
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self::cosine(DEFAULT_DISTANCE_THRESHOLD)
    }
}

/// Result of resolving a probe embedding against a reference database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// A database label, or [`UNKNOWN_IDENTITY`].
    pub identity: String,
    /// Smallest distance seen, or [`NO_MATCH_DISTANCE`] if nothing was comparable.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            identity: UNKNOWN_IDENTITY.to_string(),
            distance,
        }
    }

    pub fn is_known(&self) -> bool {
        self.identity != UNKNOWN_IDENTITY
    }
}
