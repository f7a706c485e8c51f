//! Threshold-based nearest-neighbour matching against enrolled identities.
//!
//! Everything here is a pure function of its inputs so it can be exercised
//! without hardware, a model, or the enrollment store.

use crate::types::{EnrolledIdentity, Embedding, MatchResult};
use serde::{Deserialize, Serialize};

/// Distance metric between embeddings. Must match the metric the reference
/// embeddings were enrolled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// L2 distance. On unit-length embeddings this lies in [0, 2].
    #[default]
    Euclidean,
    /// `1 - cosine_similarity`, in [0, 2].
    Cosine,
}

impl DistanceMetric {
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric {other:?}")),
        }
    }
}

/// Find the enrolled identity closest to `probe`.
///
/// Computes the distance to every reference embedding of every identity
/// (no early exit) and reports the minimum. Ties keep the first identity
/// in gallery order. References whose dimension differs from the probe
/// are skipped.
pub fn nearest_match(
    probe: &Embedding,
    gallery: &[EnrolledIdentity],
    metric: DistanceMetric,
    threshold: f32,
) -> MatchResult {
    let mut best_distance = f32::INFINITY;
    let mut best: Option<&EnrolledIdentity> = None;

    for identity in gallery {
        for reference in &identity.reference_embeddings {
            if reference.dim() != probe.dim() {
                continue;
            }
            let d = metric.distance(probe, reference);
            if d < best_distance {
                best_distance = d;
                best = Some(identity);
            }
        }
    }

    match best {
        Some(identity) => MatchResult {
            identity_id: Some(identity.identity_id.clone()),
            display_name: Some(identity.display_name.clone()),
            distance: best_distance,
            matched: best_distance <= threshold,
        },
        None => MatchResult::no_gallery(),
    }
}
