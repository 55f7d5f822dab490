//! On-disk model artifacts: `<model>.json` files in a flat directory, published
//! by write-to-temporary then rename under the artifact's lock.

use crate::kinds::ModelKind;
use crate::lock::{ArtifactLock, LockError, LockOptions};
use crate::pipeline::Pipeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ARTIFACT_EXTENSION: &str = "json";
const TMP_SUFFIX: &str = "tmp";
const LOCK_SUFFIX: &str = "lock";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io {path}")]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("artifact {path} could not be decoded")]
    Decode { path: PathBuf, #[source] source: serde_json::Error },
    #[error("artifact for `{0}` could not be encoded")]
    Encode(String, #[source] serde_json::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Training-time metadata stored next to the fitted pipeline. The categorical
/// vocabularies let the serving path validate requests without looking inside
/// the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub model_name: String,
    pub kind: ModelKind,
    pub feature_columns: Vec<String>,
    pub target_columns: Vec<String>,
    pub vocabularies: BTreeMap<String, Vec<String>>,
    pub dataset_fingerprint: String,
    pub trained_rows: usize,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub manifest: ArtifactManifest,
    pub pipeline: Pipeline,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    lock: LockOptions,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, lock: LockOptions) -> Self { Self { dir: dir.into(), lock } }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn ensure_dir(&self) -> Result<(), ArtifactError> {
        fs::create_dir_all(&self.dir).map_err(|source| ArtifactError::Io { path: self.dir.clone(), source })
    }

    pub fn artifact_path(&self, model: &str) -> PathBuf { self.dir.join(format!("{model}.{ARTIFACT_EXTENSION}")) }
    fn lock_path(&self, model: &str) -> PathBuf { self.dir.join(format!("{model}.{ARTIFACT_EXTENSION}.{LOCK_SUFFIX}")) }
    fn tmp_path(&self, model: &str) -> PathBuf { self.dir.join(format!("{model}.{ARTIFACT_EXTENSION}.{TMP_SUFFIX}")) }

    /// Model names with a published artifact, sorted. Lock and temporary
    /// siblings are not artifacts.
    pub fn list(&self) -> Result<Vec<String>, ArtifactError> {
        let io_err = |source| ArtifactError::Io { path: self.dir.clone(), source };
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) { continue; }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) { names.push(stem.to_string()); }
        }
        names.sort();
        Ok(names)
    }

    /// Write the artifact to a temporary sibling, then atomically rename it
    /// over the published path while holding the artifact lock.
    pub fn publish(&self, artifact: &ModelArtifact) -> Result<PathBuf, ArtifactError> {
        let model = artifact.manifest.model_name.as_str();
        let tmp = self.tmp_path(model);
        let target = self.artifact_path(model);
        {
            let file = File::create(&tmp).map_err(|source| ArtifactError::Io { path: tmp.clone(), source })?;
            let mut w = BufWriter::new(file);
            serde_json::to_writer(&mut w, artifact).map_err(|e| ArtifactError::Encode(model.to_string(), e))?;
            w.flush().map_err(|source| ArtifactError::Io { path: tmp.clone(), source })?;
            let file = w.into_inner().map_err(|e| ArtifactError::Io { path: tmp.clone(), source: e.into_error() })?;
            file.sync_all().map_err(|source| ArtifactError::Io { path: tmp.clone(), source })?;
        }
        {
            let _guard = ArtifactLock::acquire(&self.lock_path(model), self.lock)?;
            fs::rename(&tmp, &target).map_err(|source| ArtifactError::Io { path: target.clone(), source })?;
        }
        if let Ok(dir) = File::open(&self.dir) { let _ = dir.sync_all(); }
        info!(model, path=%target.display(), "artifact published");
        Ok(target)
    }

    /// Read one artifact under its lock; the lock is released as soon as the
    /// bytes are decoded.
    pub fn read(&self, model: &str) -> Result<ModelArtifact, ArtifactError> {
        let path = self.artifact_path(model);
        let _guard = ArtifactLock::acquire(&self.lock_path(model), self.lock)?;
        let file = File::open(&path).map_err(|source| ArtifactError::Io { path: path.clone(), source })?;
        let artifact = serde_json::from_reader(BufReader::new(file)).map_err(|source| ArtifactError::Decode { path: path.clone(), source })?;
        debug!(model, "artifact read");
        Ok(artifact)
    }

    /// Remove temporaries left by failed publishes that are older than `min_age`.
    pub fn sweep_temporaries(&self, min_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.dir) { Ok(e) => e, Err(_) => return 0 };
        let mut removed = 0;
        for path in entries.flatten().map(|e| e.path()) {
            if path.extension().and_then(|e| e.to_str()) != Some(TMP_SUFFIX) { continue; }
            let age = fs::metadata(&path).and_then(|m| m.modified()).ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_default();
            if age < min_age { continue; }
            match fs::remove_file(&path) {
                Ok(()) => { removed += 1; debug!(path=%path.display(), "stale temporary removed"); }
                Err(e) => warn!(path=%path.display(), error=%e, "failed to remove stale temporary"),
            }
        }
        removed
    }
}
