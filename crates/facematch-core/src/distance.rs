//! Vector distance metrics over equal-length `f32` slices.

use crate::types::DistanceMetric;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceError {
    #[error("vectors must have the same length (got {left} and {right})")]
    LengthMismatch { left: usize, right: usize },
}

fn check_lengths(a: &[f32], b: &[f32]) -> Result<(), DistanceError> {
    if a.len() != b.len() {
        return Err(DistanceError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(())
}

/// Cosine similarity in [-1, 1].
///
/// Returns `0.0` when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, DistanceError> {
    check_lengths(a, b)?;

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// `1 - cosine_similarity(a, b)`, in [0, 2].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32, DistanceError> {
    Ok(1.0 - cosine_similarity(a, b)?)
}

/// Euclidean (L2) distance.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, DistanceError> {
    check_lengths(a, b)?;
    Ok(a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

impl DistanceMetric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> Result<f32, DistanceError> {
        match self {
            Self::Cosine => cosine_distance(a, b),
            Self::Euclidean => euclidean_distance(a, b),
        }
    }
}
