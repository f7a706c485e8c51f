//! Enrollment store: enrolled identities and their reference embeddings.
//!
//! Lookups work on an immutable [`Gallery`] snapshot behind an `Arc`.
//! Mutations build a fresh gallery off to the side and swap the pointer,
//! so a lookup never observes a half-applied change and readers only
//! contend with each other for the duration of an `Arc` clone.

use crate::matcher::{nearest_match, DistanceMetric};
use crate::types::{EnrolledIdentity, Embedding, MatchResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("identity {0:?} has no reference embeddings")]
    EmptyReferences(String),
    #[error("identity {0:?} is enrolled twice")]
    DuplicateIdentity(String),
    #[error("identity {0:?} is not enrolled")]
    UnknownIdentity(String),
    #[error("identity {identity:?} has no reference #{index}")]
    UnknownReference { identity: String, index: usize },
    #[error("embedding has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("enrolled embeddings have {actual} dimensions, the model produces {expected}")]
    ModelDimensionMismatch { expected: usize, actual: usize },
    #[error("enrollment store has no backing file")]
    NoBackingFile,
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// On-disk layout of the enrollment file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EnrollmentFile {
    #[serde(default)]
    identities: Vec<EnrolledIdentity>,
}

/// Validated, immutable set of enrolled identities.
#[derive(Debug, Default)]
pub struct Gallery {
    identities: Vec<EnrolledIdentity>,
    dimension: Option<usize>,
}

impl Gallery {
    /// Validate identities: unique ids, non-empty reference sets, one shared dimension.
    pub fn new(identities: Vec<EnrolledIdentity>) -> Result<Self, EnrollmentError> {
        let mut dimension: Option<usize> = None;
        for (i, identity) in identities.iter().enumerate() {
            if identity.reference_embeddings.is_empty() {
                return Err(EnrollmentError::EmptyReferences(identity.identity_id.clone()));
            }
            if identities[..i]
                .iter()
                .any(|other| other.identity_id == identity.identity_id)
            {
                return Err(EnrollmentError::DuplicateIdentity(identity.identity_id.clone()));
            }
            for reference in &identity.reference_embeddings {
                match dimension {
                    None if reference.dim() > 0 => dimension = Some(reference.dim()),
                    Some(expected) if reference.dim() != expected => {
                        return Err(EnrollmentError::DimensionMismatch {
                            expected,
                            actual: reference.dim(),
                        })
                    }
                    None => {
                        return Err(EnrollmentError::DimensionMismatch {
                            expected: 1,
                            actual: 0,
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self {
            identities,
            dimension,
        })
    }

    pub fn identities(&self) -> &[EnrolledIdentity] {
        &self.identities
    }

    pub fn get(&self, identity_id: &str) -> Option<&EnrolledIdentity> {
        self.identities.iter().find(|i| i.identity_id == identity_id)
    }

    /// Shared embedding dimension, `None` while the gallery is empty.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn nearest_match(
        &self,
        probe: &Embedding,
        metric: DistanceMetric,
        threshold: f32,
    ) -> MatchResult {
        nearest_match(probe, &self.identities, metric, threshold)
    }
}

/// Enrollment store with copy-on-write snapshots and optional JSON persistence.
pub struct EnrollmentStore {
    path: Option<PathBuf>,
    /// Embedding size every snapshot must use, when known.
    expected_dim: Option<usize>,
    current: RwLock<Arc<Gallery>>,
    /// Serialises writers; readers never take it.
    write_guard: Mutex<()>,
}

impl EnrollmentStore {
    /// Store with no backing file.
    pub fn in_memory(identities: Vec<EnrolledIdentity>) -> Result<Self, EnrollmentError> {
        Ok(Self {
            path: None,
            expected_dim: None,
            current: RwLock::new(Arc::new(Gallery::new(identities)?)),
            write_guard: Mutex::new(()),
        })
    }

    /// Load from `path`. A missing file yields an empty store bound to that path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EnrollmentError> {
        Self::open_with_dim(path, None)
    }

    /// Like [`open`](Self::open), but every snapshot (the initial one, reloads
    /// and mutations) must hold `expected_dim`-sized embeddings.
    pub fn open_with_dim(
        path: impl Into<PathBuf>,
        expected_dim: Option<usize>,
    ) -> Result<Self, EnrollmentError> {
        let path = path.into();
        let gallery = read_gallery(&path)?;
        check_model_dim(&gallery, expected_dim)?;
        tracing::info!(path = %path.display(), identities = gallery.len(), "enrollment loaded");
        Ok(Self {
            path: Some(path),
            expected_dim,
            current: RwLock::new(Arc::new(gallery)),
            write_guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn nearest_match(
        &self,
        probe: &Embedding,
        metric: DistanceMetric,
        threshold: f32,
    ) -> MatchResult {
        self.snapshot().nearest_match(probe, metric, threshold)
    }

    /// Re-read the backing file and swap it in. Returns the identity count.
    ///
    /// On error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<usize, EnrollmentError> {
        let path = self.path.as_ref().ok_or(EnrollmentError::NoBackingFile)?;
        let _writer = self.write_guard.lock().unwrap_or_else(PoisonError::into_inner);
        let gallery = read_gallery(path)?;
        check_model_dim(&gallery, self.expected_dim)?;
        let count = gallery.len();
        self.swap(gallery);
        tracing::info!(path = %path.display(), identities = count, "enrollment reloaded");
        Ok(count)
    }

    /// Add a new identity or replace an existing one with the same id.
    pub fn upsert_identity(&self, identity: EnrolledIdentity) -> Result<(), EnrollmentError> {
        self.mutate(|identities| {
            match identities
                .iter_mut()
                .find(|i| i.identity_id == identity.identity_id)
            {
                Some(existing) => *existing = identity,
                None => identities.push(identity),
            }
            Ok(())
        })
    }

    /// Remove an identity. Returns whether it was enrolled.
    pub fn remove_identity(&self, identity_id: &str) -> Result<bool, EnrollmentError> {
        let mut removed = false;
        self.mutate(|identities| {
            let before = identities.len();
            identities.retain(|i| i.identity_id != identity_id);
            removed = identities.len() != before;
            Ok(())
        })?;
        Ok(removed)
    }

    /// Append a reference embedding to an enrolled identity.
    pub fn add_reference(
        &self,
        identity_id: &str,
        embedding: Embedding,
    ) -> Result<(), EnrollmentError> {
        self.mutate(|identities| {
            let identity = identities
                .iter_mut()
                .find(|i| i.identity_id == identity_id)
                .ok_or_else(|| EnrollmentError::UnknownIdentity(identity_id.to_string()))?;
            identity.reference_embeddings.push(embedding);
            Ok(())
        })
    }

    /// Remove one reference embedding. Removing the last one is rejected;
    /// remove the identity instead.
    pub fn remove_reference(&self, identity_id: &str, index: usize) -> Result<(), EnrollmentError> {
        self.mutate(|identities| {
            let identity = identities
                .iter_mut()
                .find(|i| i.identity_id == identity_id)
                .ok_or_else(|| EnrollmentError::UnknownIdentity(identity_id.to_string()))?;
            if index >= identity.reference_embeddings.len() {
                return Err(EnrollmentError::UnknownReference {
                    identity: identity_id.to_string(),
                    index,
                });
            }
            identity.reference_embeddings.remove(index);
            Ok(())
        })
    }

    /// Write the current snapshot to the backing file (temp file + rename).
    pub fn save(&self) -> Result<(), EnrollmentError> {
        let path = self.path.as_ref().ok_or(EnrollmentError::NoBackingFile)?;
        let snapshot = self.snapshot();
        let file = EnrollmentFile {
            identities: snapshot.identities().to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|source| EnrollmentError::Parse {
            path: path.clone(),
            source,
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| EnrollmentError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| EnrollmentError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| EnrollmentError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }

    fn mutate<F>(&self, apply: F) -> Result<(), EnrollmentError>
    where
        F: FnOnce(&mut Vec<EnrolledIdentity>) -> Result<(), EnrollmentError>,
    {
        let _writer = self.write_guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut identities = self.snapshot().identities().to_vec();
        apply(&mut identities)?;
        let gallery = Gallery::new(identities)?;
        check_model_dim(&gallery, self.expected_dim)?;
        self.swap(gallery);
        Ok(())
    }

    fn swap(&self, gallery: Gallery) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
    }
}

fn check_model_dim(gallery: &Gallery, expected: Option<usize>) -> Result<(), EnrollmentError> {
    match (expected, gallery.dimension()) {
        (Some(expected), Some(actual)) if expected != actual => {
            Err(EnrollmentError::ModelDimensionMismatch { expected, actual })
        }
        _ => Ok(()),
    }
}

fn read_gallery(path: &Path) -> Result<Gallery, EnrollmentError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Gallery::default()),
        Err(source) => {
            return Err(EnrollmentError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let file: EnrollmentFile =
        serde_json::from_slice(&bytes).map_err(|source| EnrollmentError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Gallery::new(file.identities)
}
