//! sentinel-core: Recognition and decision primitives.
//!
//! Face detection/embedding via ONNX Runtime, threshold-based
//! nearest-neighbour matching against an enrollment store, and PIR
//! signal debouncing.

pub mod enrollment;
pub mod matcher;
pub mod motion;
pub mod preprocess;
pub mod recognition;
pub mod types;

use std::path::PathBuf;

pub use enrollment::{EnrollmentError, EnrollmentStore, Gallery};
pub use matcher::{nearest_match, DistanceMetric};
pub use motion::MotionDebouncer;
pub use recognition::{OnnxRecognizer, RecognitionEngine, RecognitionError};
pub use types::{
    BoundingBox, Decision, DetectedFace, Embedding, EnrolledIdentity, MatchResult, MotionEvent,
    MotionKind, Outcome,
};

/// Default directory holding the ONNX models.
///
/// `$XDG_DATA_HOME/sentinel/models`, falling back to `/usr/share/sentinel/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(|d| PathBuf::from(d).join("sentinel/models"))
        .unwrap_or_else(|_| PathBuf::from("/usr/share/sentinel/models"))
}

/// Default location of the enrollment file.
///
/// `$XDG_DATA_HOME/sentinel/enrollment.json`, falling back to `/var/lib/sentinel/enrollment.json`.
pub fn default_enrollment_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(|d| PathBuf::from(d).join("sentinel/enrollment.json"))
        .unwrap_or_else(|_| PathBuf::from("/var/lib/sentinel/enrollment.json"))
}
