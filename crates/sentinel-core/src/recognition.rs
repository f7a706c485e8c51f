//! Face recognition capability and its ONNX Runtime implementation.
//!
//! The pipeline only sees [`RecognitionEngine`]: a frame goes in, zero or
//! more faces with embeddings come out. [`OnnxRecognizer`] backs it with two
//! models, a detector and an embedder, loaded from a model directory.
//!
//! Detector contract: one float input `[1, 3, S, S]` (gray replicated into
//! RGB, normalized `(p - 127.5) / 128`) and one output of rows
//! `[x1, y1, x2, y2, score]` in input pixel space, as produced by exports
//! with post-processing folded in.
//!
//! Embedder contract: one float input `[1, 3, 112, 112]` (normalized
//! `(p - 127.5) / 127.5`) and one output holding the embedding vector.

use crate::preprocess::{self, Letterbox};
use crate::types::{BoundingBox, DetectedFace, Embedding};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECTOR_FILE: &str = "face_detector.onnx";
const EMBEDDER_FILE: &str = "face_embedder.onnx";

const DET_INPUT_SIZE: usize = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_ROW_LEN: usize = 5;
const DET_NMS_THRESHOLD: f32 = 0.4;

const EMB_INPUT_SIZE: usize = 112;
const EMB_MEAN: f32 = 127.5;
const EMB_STD: f32 = 127.5;
/// Context kept around the detected box when cropping for the embedder.
const EMB_CROP_MARGIN: f32 = 0.1;

/// Side of the blank frame pushed through the models by [`RecognitionEngine::probe`].
const PROBE_FRAME_SIZE: u32 = 64;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer holds {actual} bytes, {width}x{height} needs {expected}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detects faces in a grayscale frame and embeds each one.
///
/// Called from a single inference worker; one inference runs at a time.
pub trait RecognitionEngine: Send {
    /// Faces found in the frame, most confident first. An empty result is
    /// not an error.
    fn detect_and_embed(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, RecognitionError>;

    /// Check the runtime is usable. Used to leave the Faulted state.
    fn probe(&mut self) -> Result<(), RecognitionError> {
        let side = PROBE_FRAME_SIZE;
        let blank = vec![0u8; (side * side) as usize];
        self.detect_and_embed(&blank, side, side).map(|_| ())
    }
}

/// Discard candidates below `floor`, keeping order.
pub fn apply_confidence_floor(faces: Vec<BoundingBox>, floor: f32) -> Vec<BoundingBox> {
    faces.into_iter().filter(|f| f.confidence >= floor).collect()
}

/// Detector + embedder pair running on ONNX Runtime.
pub struct OnnxRecognizer {
    detector: Session,
    embedder: Session,
    confidence_floor: f32,
    /// Required embedding length; learned from the first inference when `None`.
    embedding_dim: Option<usize>,
    model_version: String,
}

impl OnnxRecognizer {
    /// Load `face_detector.onnx` and `face_embedder.onnx` from `model_dir`.
    pub fn load(model_dir: &Path, confidence_floor: f32) -> Result<Self, RecognitionError> {
        let detector = load_session(&model_dir.join(DETECTOR_FILE))?;
        let embedder = load_session(&model_dir.join(EMBEDDER_FILE))?;

        Ok(Self {
            detector,
            embedder,
            confidence_floor,
            embedding_dim: None,
            model_version: EMBEDDER_FILE.trim_end_matches(".onnx").to_string(),
        })
    }

    /// Pin the expected embedding length (reject anything else).
    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = Some(dim);
        self
    }

    fn detect(
        &mut self,
        frame: &[u8],
        width: usize,
        height: usize,
    ) -> Result<Vec<BoundingBox>, RecognitionError> {
        let (square, lb) = preprocess::letterbox(frame, width, height, DET_INPUT_SIZE, DET_MEAN as u8);
        let input = preprocess::to_nchw(&square, DET_INPUT_SIZE, DET_MEAN, DET_STD);

        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, rows) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognitionError::InferenceFailed(format!("detector output: {e}")))?;

        let candidates = decode_rows(rows, &lb);
        let kept = apply_confidence_floor(candidates, self.confidence_floor);
        Ok(preprocess::nms(kept, DET_NMS_THRESHOLD))
    }

    fn embed(
        &mut self,
        frame: &[u8],
        width: usize,
        height: usize,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognitionError> {
        let crop = preprocess::crop_face(frame, width, height, face, EMB_CROP_MARGIN, EMB_INPUT_SIZE);
        let input = preprocess::to_nchw(&crop, EMB_INPUT_SIZE, EMB_MEAN, EMB_STD);

        let outputs = self
            .embedder
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognitionError::InferenceFailed(format!("embedder output: {e}")))?;

        if raw.is_empty() {
            return Err(RecognitionError::InferenceFailed("empty embedding".into()));
        }
        match self.embedding_dim {
            Some(dim) if dim != raw.len() => {
                return Err(RecognitionError::InferenceFailed(format!(
                    "expected {dim}-dim embedding, got {}",
                    raw.len()
                )))
            }
            Some(_) => {}
            None => self.embedding_dim = Some(raw.len()),
        }

        let mut embedding = Embedding {
            values: raw.to_vec(),
            model_version: Some(self.model_version.clone()),
        };
        embedding.normalize();
        Ok(embedding)
    }
}

impl RecognitionEngine for OnnxRecognizer {
    fn detect_and_embed(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, RecognitionError> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 || frame.len() < w * h {
            return Err(RecognitionError::InvalidFrame {
                width,
                height,
                expected: w * h,
                actual: frame.len(),
            });
        }

        let boxes = self.detect(frame, w, h)?;
        tracing::debug!(faces = boxes.len(), "detector pass complete");

        boxes
            .into_iter()
            .map(|bbox| {
                let embedding = self.embed(frame, w, h, &bbox)?;
                Ok(DetectedFace {
                    detection_confidence: bbox.confidence,
                    bbox,
                    embedding,
                })
            })
            .collect()
    }
}

fn load_session(path: &Path) -> Result<Session, RecognitionError> {
    if !path.exists() {
        return Err(RecognitionError::ModelNotFound(path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;

    tracing::info!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

/// Decode `[x1, y1, x2, y2, score]` rows into frame-space boxes.
/// Degenerate boxes are dropped.
fn decode_rows(rows: &[f32], lb: &Letterbox) -> Vec<BoundingBox> {
    rows.chunks_exact(DET_ROW_LEN)
        .map(|r| lb.unmap(r[0], r[1], r[2], r[3], r[4]))
        .filter(|b| b.width > 0.0 && b.height > 0.0 && b.confidence.is_finite())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blind;

    impl RecognitionEngine for Blind {
        fn detect_and_embed(
            &mut self,
            _frame: &[u8],
            width: u32,
            height: u32,
        ) -> Result<Vec<DetectedFace>, RecognitionError> {
            assert_eq!((width, height), (PROBE_FRAME_SIZE, PROBE_FRAME_SIZE));
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_default_probe_runs_blank_frame() {
        assert!(Blind.probe().is_ok());
    }

    #[test]
    fn test_confidence_floor_drops_weak_candidates() {
        let boxes = vec![
            BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 },
            BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.3 },
            BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.5 },
        ];
        let kept = apply_confidence_floor(boxes, 0.5);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|b| b.confidence >= 0.5));
    }

    #[test]
    fn test_decode_rows_unmaps_and_drops_degenerate() {
        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };
        let rows = [
            10.0, 20.0, 30.0, 60.0, 0.8, // valid
            30.0, 30.0, 10.0, 10.0, 0.9, // inverted corners
        ];
        let boxes = decode_rows(&rows, &lb);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0], BoundingBox { x: 5.0, y: 10.0, width: 10.0, height: 20.0, confidence: 0.8 });
    }

    #[test]
    fn test_load_missing_models() {
        let dir = std::env::temp_dir().join("sentinel-no-models-here");
        match OnnxRecognizer::load(&dir, 0.5) {
            Err(RecognitionError::ModelNotFound(path)) => assert!(path.ends_with(DETECTOR_FILE)),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("models should not exist"),
        }
    }
}
