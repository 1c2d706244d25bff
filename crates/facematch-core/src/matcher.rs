//! Best-match selection over Euclidean embedding distance.

use crate::types::{Embedding, GalleryFace};
use std::path::PathBuf;

/// Default maximum distance accepted as a match.
pub const DEFAULT_TOLERANCE: f32 = 0.5;

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    /// Name of the best accepted candidate (if any).
    pub name: Option<String>,
    /// Distance of the best accepted candidate (if any).
    pub distance: Option<f32>,
    /// Reference image of the best accepted candidate (if any).
    pub path: Option<PathBuf>,
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        self.name.is_some()
    }

    /// Presentational similarity, absent when nothing matched.
    pub fn score(&self) -> Option<f32> {
        self.distance.map(similarity_score)
    }
}

/// Result of comparing a probe against a single target embedding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub matched: bool,
    pub distance: f32,
}

impl Verification {
    pub fn score(&self) -> f32 {
        similarity_score(self.distance)
    }
}

/// `round(1 - distance, 2)`.
///
/// Only probability-like while `distance` stays within [0, 1]; larger
/// distances produce negative scores.
pub fn similarity_score(distance: f32) -> f32 {
    ((1.0 - distance) * 100.0).round() / 100.0
}

/// Strategy for comparing a probe embedding against gallery faces or a single target.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &[GalleryFace]) -> MatchOutcome;
    fn verify(&self, probe: &Embedding, target: &Embedding) -> Verification;
}

/// Euclidean distance matcher with a fixed tolerance.
///
/// A candidate is accepted only when its distance is strictly below the
/// tolerance and strictly below the best distance seen so far, so among
/// exact ties the first candidate scanned wins.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &[GalleryFace]) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;

        for (i, face) in gallery.iter().enumerate() {
            let distance = probe.euclidean_distance(&face.embedding);
            let beats_best = best.map_or(true, |(_, d)| distance < d);
            if distance < self.tolerance && beats_best {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) => MatchOutcome {
                name: Some(gallery[idx].name.clone()),
                distance: Some(distance),
                path: Some(gallery[idx].path.clone()),
            },
            None => MatchOutcome {
                name: None,
                distance: None,
                path: None,
            },
        }
    }

    fn verify(&self, probe: &Embedding, target: &Embedding) -> Verification {
        let distance = probe.euclidean_distance(target);
        Verification {
            matched: distance < self.tolerance,
            distance,
        }
    }
}
