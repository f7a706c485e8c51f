use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box of a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (fixed dimension for a given recognition model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding.
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

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit length in place. Zero vectors are left untouched.
    pub fn normalize(&mut self) {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|x| *x /= norm);
        }
    }
}

/// A face found in one frame, with its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    pub detection_confidence: f32,
}

/// An enrolled person and the reference embeddings they are matched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub identity_id: String,
    pub display_name: String,
    /// Never empty once admitted to the enrollment store.
    pub reference_embeddings: Vec<Embedding>,
}

/// Nearest-neighbour lookup outcome for one probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Identity achieving the minimum distance; `None` only for an empty gallery.
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    /// Minimum distance found (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
    /// `distance <= threshold`.
    pub matched: bool,
}

impl MatchResult {
    pub fn no_gallery() -> Self {
        Self {
            identity_id: None,
            display_name: None,
            distance: f32::INFINITY,
            matched: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Authorized,
    Unauthorized,
    Inconclusive,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Authorized => "authorized",
            Outcome::Unauthorized => "unauthorized",
            Outcome::Inconclusive => "inconclusive",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one completed detection cycle. Emitted exactly once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub session_id: u64,
    pub outcome: Outcome,
    /// Present only for `Authorized`.
    pub identity_id: Option<String>,
    /// Frames that contained at least one detected face.
    pub evidence_frame_count: u32,
    /// Smallest distance observed during the session, if any face was seen.
    pub best_distance: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn authorized(session_id: u64, identity_id: String, frames: u32, distance: f32) -> Self {
        Self {
            session_id,
            outcome: Outcome::Authorized,
            identity_id: Some(identity_id),
            evidence_frame_count: frames,
            best_distance: Some(distance),
            timestamp: Utc::now(),
        }
    }

    pub fn unauthorized(session_id: u64, frames: u32, best_distance: Option<f32>) -> Self {
        Self {
            session_id,
            outcome: Outcome::Unauthorized,
            identity_id: None,
            evidence_frame_count: frames,
            best_distance,
            timestamp: Utc::now(),
        }
    }

    pub fn inconclusive(session_id: u64, frames: u32, best_distance: Option<f32>) -> Self {
        Self {
            session_id,
            outcome: Outcome::Inconclusive,
            identity_id: None,
            evidence_frame_count: frames,
            best_distance,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionKind {
    Start,
    End,
}

/// Debounced motion transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionEvent {
    pub kind: MotionKind,
    pub timestamp: DateTime<Utc>,
    /// For `Start`: how long the raw line had been active when confirmed.
    /// For `End`: how long the raw line was active over the whole episode.
    pub raw_duration_active_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize() {
        let mut e = Embedding::new(vec![3.0, 4.0]);
        e.normalize();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);

        let mut zero = Embedding::new(vec![0.0, 0.0]);
        zero.normalize();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0 };
        let b = BoundingBox { x: 5.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0 };
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decision_serializes_outcome_snake_case() {
        let d = Decision::inconclusive(7, 0, None);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["outcome"], "inconclusive");
        assert_eq!(json["session_id"], 7);
    }
}
