//! Nearest-neighbor identity resolution.

use crate::database::ReferenceDatabase;
use crate::types::{MatchOptions, MatchResult, NO_MATCH_DISTANCE};

/// Strategy for resolving a probe embedding against a reference database.
pub trait Matcher {
    fn compare(&self, probe: &[f32], database: &ReferenceDatabase) -> MatchResult;
}

/// Exhaustive nearest-neighbor matcher with a maximum-distance cutoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighborMatcher {
    pub options: MatchOptions,
}

impl NearestNeighborMatcher {
    pub fn new(options: MatchOptions) -> Self {
        Self { options }
    }
}

impl Matcher for NearestNeighborMatcher {
    fn compare(&self, probe: &[f32], database: &ReferenceDatabase) -> MatchResult {
        find_closest_identity(probe, database, self.options)
    }
}

/// Find the identity whose closest stored embedding is nearest to `embedding`.
///
/// Stored embeddings whose length differs from the probe are skipped. Ties
/// keep the candidate seen first (label order, then stored order). When the
/// best distance exceeds `options.threshold` the result is
/// [`UNKNOWN_IDENTITY`](crate::UNKNOWN_IDENTITY), still carrying that distance.
pub fn find_closest_identity(
    embedding: &[f32],
    database: &ReferenceDatabase,
    options: MatchOptions,
) -> MatchResult {
    let mut min_distance = NO_MATCH_DISTANCE;
    let mut closest: Option<&str> = None;
    let mut skipped = 0usize;

    for (identity, stored) in database.iter() {
        for (index, reference) in stored.iter().enumerate() {
            let distance = match options.metric.distance(embedding, reference) {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(identity, index, error = %err, "skipping reference embedding");
                    skipped += 1;
                    continue;
                }
            };
            if distance < min_distance {
                min_distance = distance;
                closest = Some(identity);
            }
        }
    }

    tracing::debug!(
        metric = %options.metric,
        threshold = options.threshold,
        min_distance,
        closest = ?closest,
        skipped,
        "identity search complete"
    );

    match closest {
        Some(identity) if min_distance <= options.threshold => MatchResult {
            identity: identity.to_string(),
            distance: min_distance,
        },
        _ => MatchResult::unknown(min_distance),
    }
}
