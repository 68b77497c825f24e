use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A candidate location to obtain a model from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// Entry in the runtime's persistent cache, by key.
    Cache(String),
    /// HTTP(S) URL of a serialized model.
    Url(String),
    /// Model file on local disk.
    File(PathBuf),
}

impl ModelSource {
    /// Name used in logs and by the input-size heuristic.
    pub fn identifier(&self) -> String {
        self.to_string()
    }

    pub fn is_cache(&self) -> bool {
        matches!(self, Self::Cache(_))
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache(key) => write!(f, "cache:{key}"),
            Self::Url(url) => f.write_str(url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Parses `cache:<key>`, `http(s)://...`, `file://<path>` or a bare path.
impl FromStr for ModelSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("model source must not be empty".to_string());
        }
        if let Some(key) = s.strip_prefix("cache:") {
            if key.is_empty() {
                return Err("cache source needs a key (cache:<key>)".to_string());
            }
            return Ok(Self::Cache(key.to_string()));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(Self::Url(s.to_string()));
        }
        let path = s.strip_prefix("file://").unwrap_or(s);
        Ok(Self::File(PathBuf::from(path)))
    }
}
