use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::info;

use crate::error::StorageError;
use crate::state_machine::ArtifactRef;

/// Where finished artifacts end up once a stream is fully combined.
///
/// Calls block; the orchestrator runs them off the async workers.
pub trait ArtifactStorage: Send + Sync + 'static {
    /// Stores the artifact and returns its new location.
    fn upload(&self, artifact: &ArtifactRef) -> Result<String, StorageError>;
}

/// Copies local artifacts into an archive directory, keeping the path of
/// relative refs so same-named outputs from different subfolders coexist.
#[derive(Debug, Clone)]
pub struct LocalArtifactStorage {
    artifact_root: Option<PathBuf>,
    destination: PathBuf,
}

impl LocalArtifactStorage {
    /// `artifact_root` is where relative artifact refs live (the render
    /// server's output directory).
    pub fn new(artifact_root: Option<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root,
            destination: destination.into(),
        }
    }
}

impl ArtifactStorage for LocalArtifactStorage {
    fn upload(&self, artifact: &ArtifactRef) -> Result<String, StorageError> {
        let source = artifact
            .resolve(self.artifact_root.as_deref())
            .ok_or_else(|| StorageError::NotLocal(artifact.to_string()))?;
        if !source.is_file() {
            return Err(StorageError::Missing(source.display().to_string()));
        }
        let Some(relative) = archive_path(Path::new(artifact.as_str())) else {
            return Err(StorageError::Missing(source.display().to_string()));
        };

        let io_err = |source| StorageError::Io {
            artifact: artifact.to_string(),
            source,
        };
        let target = self.destination.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::copy(&source, &target).map_err(io_err)?;

        info!(artifact = %artifact, target = %target.display(), "artifact uploaded");
        Ok(target.display().to_string())
    }
}

/// Where an artifact lands under the archive: its own path when relative and
/// plain, otherwise just the file name.
fn archive_path(artifact: &Path) -> Option<PathBuf> {
    let plain = artifact.is_relative() && artifact.components().all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Some(artifact.to_path_buf())
    } else {
        artifact.file_name().map(PathBuf::from)
    }
}
