use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staged file not found: {path}")]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("staging directory unavailable: {path}")]
    NoStagingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a file inside the staging directory")]
    OutsideStaging { path: PathBuf },
}

/// A caller-staged upload. The file is removed when this value is dropped,
/// whatever happened while it was being read.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
}

impl StagedUpload {
    /// Takes ownership of `path` only if it resolves to a regular file under
    /// `staging_root`. A refused path is left untouched.
    pub fn claim(path: &Path, staging_root: &Path) -> Result<Self, StagingError> {
        let root = staging_root
            .canonicalize()
            .map_err(|source| StagingError::NoStagingDir {
                path: staging_root.to_path_buf(),
                source,
            })?;
        let resolved = path.canonicalize().map_err(|source| StagingError::Missing {
            path: path.to_path_buf(),
            source,
        })?;
        if resolved == root || !resolved.starts_with(&root) || !resolved.is_file() {
            return Err(StagingError::OutsideStaging {
                path: path.to_path_buf(),
            });
        }
        Ok(Self { path: resolved })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed staged upload"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove staged upload: {e}"),
        }
    }
}
