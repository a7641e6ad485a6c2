//! Destinations for persisted artifacts.
//!
//! The orchestrator hands every persist-worthy artifact with a resolved
//! output path to an [`ArtifactSink`]. [`FileSink`] writes to disk below a
//! root directory, [`MemorySink`] keeps the bytes in memory for dry runs and
//! tests.

use crate::error::{Error, Result};
use crate::source::DataSource;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Receives artifacts that should be persisted
pub trait ArtifactSink {
    /// Stores `artifact` at `path`
    fn store(&mut self, path: &Path, artifact: &DataSource) -> Result<()>;
}

impl<S: ArtifactSink + ?Sized> ArtifactSink for &mut S {
    fn store(&mut self, path: &Path, artifact: &DataSource) -> Result<()> {
        (**self).store(path, artifact)
    }
}

/// Writes artifacts to disk, creating directories on demand
#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
    force: bool,
    written: Vec<PathBuf>,
}

impl FileSink {
    /// Creates a sink that only writes below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            force: false,
            written: Vec::new(),
        }
    }

    /// Allows overwriting existing files
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Root directory artifacts must stay within
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths written so far, in order
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Rejects paths that leave the root
    fn check_contained(&self, path: &Path) -> Result<()> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| Error::path_traversal(path))?;
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::path_traversal(path));
        }
        Ok(())
    }
}

impl ArtifactSink for FileSink {
    fn store(&mut self, path: &Path, artifact: &DataSource) -> Result<()> {
        self.check_contained(path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::directory_create(parent, e))?;
        }

        if path.exists() && !self.force {
            return Err(Error::FileExists {
                path: path.to_path_buf(),
            });
        }

        let mut file = fs::File::create(path).map_err(|e| Error::file_write(path, e))?;
        file.write_all(artifact.data())
            .map_err(|e| Error::file_write(path, e))?;

        info!("Wrote {} ({} bytes)", path.display(), artifact.len());
        self.written.push(path.to_path_buf());
        Ok(())
    }
}

/// Keeps artifacts in memory, keyed by their would-be path
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    files: BTreeMap<PathBuf, Bytes>,
}

impl MemorySink {
    /// Creates an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored artifacts, ordered by path
    pub fn files(&self) -> &BTreeMap<PathBuf, Bytes> {
        &self.files
    }

    /// Contents stored at `path`
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&Bytes> {
        self.files.get(path.as_ref())
    }

    /// Number of stored artifacts
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if nothing was stored
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Releases the stored buffers
    pub fn into_files(self) -> BTreeMap<PathBuf, Bytes> {
        self.files
    }
}

impl ArtifactSink for MemorySink {
    fn store(&mut self, path: &Path, artifact: &DataSource) -> Result<()> {
        debug!("Buffered {} ({} bytes)", path.display(), artifact.len());
        self.files.insert(path.to_path_buf(), artifact.bytes().clone());
        Ok(())
    }
}
