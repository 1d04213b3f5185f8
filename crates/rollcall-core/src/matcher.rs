//! Nearest-neighbour decision over a match index snapshot.

use crate::index::{IndexSnapshot, ProfileLabel};
use crate::types::Embedding;

/// Result of matching a probe embedding against a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched {
        label: ProfileLabel,
        distance: f32,
        /// `1 - distance`. Informational only, not a probability.
        confidence: f32,
    },
    Unmatched {
        /// Distance of the closest candidate; `None` for an empty snapshot.
        best_distance: Option<f32>,
    },
}

impl MatchOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }
}

/// Strategy for comparing a probe embedding against the enrolled gallery.
pub trait Matcher {
    fn find(&self, probe: &Embedding, snapshot: &IndexSnapshot, threshold: f32) -> MatchOutcome;
}

/// Euclidean nearest-neighbour matcher.
///
/// Accepts the closest candidate only when its distance is strictly below
/// the threshold. Every gallery entry is visited; ties keep the earliest.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find(&self, probe: &Embedding, snapshot: &IndexSnapshot, threshold: f32) -> MatchOutcome {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, candidate) in snapshot.embeddings().iter().enumerate() {
            let dist = probe.euclidean_distance(candidate);
            if best_idx.is_none() || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchOutcome::Matched {
                label: snapshot.labels()[idx].clone(),
                distance: best_dist,
                confidence: 1.0 - best_dist,
            },
            Some(_) => MatchOutcome::Unmatched {
                best_distance: Some(best_dist),
            },
            None => MatchOutcome::Unmatched { best_distance: None },
        }
    }
}
