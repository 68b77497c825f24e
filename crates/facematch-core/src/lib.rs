//! facematch-core — Identity resolution from face embeddings.
//!
//! Compares a probe embedding against a reference database of known
//! identities using cosine or Euclidean distance, and rejects the closest
//! candidate when it is not close enough.

pub mod database;
pub mod distance;
pub mod matcher;
pub mod types;

pub use database::{DatabaseError, ReferenceDatabase};
pub use distance::{cosine_distance, cosine_similarity, euclidean_distance, DistanceError};
pub use matcher::{find_closest_identity, Matcher, NearestNeighborMatcher};
pub use types::{
    DistanceMetric, Embedding, MatchOptions, MatchResult, DEFAULT_DISTANCE_THRESHOLD,
    NO_MATCH_DISTANCE, UNKNOWN_IDENTITY,
};
