//! The unit of data flowing through the extraction pipeline.
//!
//! A [`DataSource`] couples an immutable byte buffer with a name, a set of
//! [`SourceFlags`] and an append-only [`Metadata`] store. Placement of an
//! artifact on disk is derived entirely from its metadata:
//!
//! ```text
//! <last BaseDirectoryPath>/<first OutputFileName>
//! ```
//!
//! where the base directory stack is either declared by the artifact itself
//! or inherited from its parent via [`DataSource::inherit_placement`].

use bitflags::bitflags;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

bitflags! {
    /// Role flags of a data source
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SourceFlags: u8 {
        /// Worth persisting as an output artifact
        const OUTPUT = 0b0001;
        /// Intermediate data, never persisted
        const TEMPORARY = 0b0010;
        /// Top-level input handed to the orchestrator
        const INPUT = 0b0100;
        /// Should be fed back into detection
        const PROCESS_FURTHER = 0b1000;
    }
}

/// Kinds of placement metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataKind {
    /// Candidate output root directory
    BaseDirectoryPath,
    /// Subdirectory segment below the inherited base
    OutputDirectoryName,
    /// Leaf file name
    OutputFileName,
}

/// A typed metadata value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Meta {
    /// See [`MetadataKind::BaseDirectoryPath`]
    BaseDirectoryPath(PathBuf),
    /// See [`MetadataKind::OutputDirectoryName`]
    OutputDirectoryName(String),
    /// See [`MetadataKind::OutputFileName`]
    OutputFileName(String),
}

impl Meta {
    /// The kind this value is filed under
    pub fn kind(&self) -> MetadataKind {
        match self {
            Meta::BaseDirectoryPath(_) => MetadataKind::BaseDirectoryPath,
            Meta::OutputDirectoryName(_) => MetadataKind::OutputDirectoryName,
            Meta::OutputFileName(_) => MetadataKind::OutputFileName,
        }
    }

    fn as_path(&self) -> &Path {
        match self {
            Meta::BaseDirectoryPath(p) => p,
            Meta::OutputDirectoryName(s) | Meta::OutputFileName(s) => Path::new(s),
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Meta::BaseDirectoryPath(_) => None,
            Meta::OutputDirectoryName(s) | Meta::OutputFileName(s) => Some(s),
        }
    }
}

/// Append-only mapping from kind to an insertion-ordered list of values.
///
/// Duplicates are kept. There is no removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<MetadataKind, Vec<Meta>>,
}

impl Metadata {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value to the list of its kind
    pub fn add(&mut self, value: Meta) {
        self.entries.entry(value.kind()).or_default().push(value);
    }

    /// All values of `kind` in insertion order
    pub fn of(&self, kind: MetadataKind) -> &[Meta] {
        self.entries.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true if at least one value of `kind` exists
    pub fn has(&self, kind: MetadataKind) -> bool {
        !self.of(kind).is_empty()
    }

    /// "The" value of `kind`: the first one added
    pub fn first(&self, kind: MetadataKind) -> Option<&Meta> {
        self.of(kind).first()
    }

    /// Top of `kind` used as a priority stack: the last one added
    pub fn last(&self, kind: MetadataKind) -> Option<&Meta> {
        self.of(kind).last()
    }
}

/// One blob under analysis: the top-level input or a derived artifact.
///
/// Cloning keeps the metadata but not the fact that placement was already
/// inherited, so a clone can be re-parented with
/// [`DataSource::inherit_placement`].
#[derive(Debug)]
pub struct DataSource {
    name: String,
    data: Bytes,
    flags: SourceFlags,
    metadata: Metadata,
    inherited: bool,
}

impl Clone for DataSource {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            data: self.data.clone(),
            flags: self.flags,
            metadata: self.metadata.clone(),
            inherited: false,
        }
    }
}

impl DataSource {
    /// Creates a source over `data` with no flags
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            flags: SourceFlags::empty(),
            metadata: Metadata::new(),
            inherited: false,
        }
    }

    /// Creates a top-level input that places its artifacts below `output_root`
    pub fn input(
        name: impl Into<String>,
        data: impl Into<Bytes>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self::new(name, data)
            .with_flags(SourceFlags::INPUT)
            .with_meta(Meta::BaseDirectoryPath(output_root.into()))
    }

    /// Creates an artifact viewing `range` of this source's buffer.
    ///
    /// The view shares the parent's allocation.
    pub fn slice(&self, name: impl Into<String>, range: std::ops::Range<usize>) -> Option<Self> {
        if range.start > range.end || range.end > self.data.len() {
            return None;
        }
        Some(Self::new(name, self.data.slice(range)))
    }

    /// Adds flags (builder style)
    pub fn with_flags(mut self, flags: SourceFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Appends a metadata value (builder style)
    pub fn with_meta(mut self, value: Meta) -> Self {
        self.metadata.add(value);
        self
    }

    /// Marks the artifact for persistence under `file_name`
    pub fn with_output_name(self, file_name: impl Into<String>) -> Self {
        self.with_flags(SourceFlags::OUTPUT)
            .with_meta(Meta::OutputFileName(file_name.into()))
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Byte contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the byte contents
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current flags
    pub fn flags(&self) -> SourceFlags {
        self.flags
    }

    /// Adds flags
    pub fn add_flags(&mut self, flags: SourceFlags) {
        self.flags |= flags;
    }

    /// Returns true if every flag in `flags` is set
    pub fn has_flags(&self, flags: SourceFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Metadata store
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Appends a metadata value
    pub fn add_metadata(&mut self, value: Meta) {
        self.metadata.add(value);
    }

    /// All values of `kind` in insertion order
    pub fn metadata_of(&self, kind: MetadataKind) -> &[Meta] {
        self.metadata.of(kind)
    }

    /// Output and not temporary
    pub fn is_persistable(&self) -> bool {
        self.flags.contains(SourceFlags::OUTPUT) && !self.flags.contains(SourceFlags::TEMPORARY)
    }

    /// Should be fed back into detection
    pub fn wants_processing(&self) -> bool {
        self.flags.contains(SourceFlags::PROCESS_FURTHER)
    }

    /// The leaf file name (first `OutputFileName`)
    pub fn output_file_name(&self) -> Option<&str> {
        self.metadata
            .first(MetadataKind::OutputFileName)
            .and_then(Meta::as_str)
    }

    /// The subdirectory segment (first `OutputDirectoryName`)
    pub fn output_directory_name(&self) -> Option<&str> {
        self.metadata
            .first(MetadataKind::OutputDirectoryName)
            .and_then(Meta::as_str)
    }

    /// The effective output directory (last `BaseDirectoryPath`)
    pub fn base_directory(&self) -> Option<&Path> {
        self.metadata
            .last(MetadataKind::BaseDirectoryPath)
            .map(Meta::as_path)
    }

    /// Copies the parent's placement stack forward.
    ///
    /// A child that declared its own base directory keeps it as is and
    /// ignores the parent. Otherwise the parent's stack is copied in order
    /// and the child's `OutputDirectoryName`, if any, is pushed on top of the
    /// inherited base, so the child and its own children land inside that
    /// subdirectory. Calling this more than once is a no-op.
    pub fn inherit_placement(&mut self, parent: &DataSource) {
        if self.inherited {
            return;
        }
        self.inherited = true;

        if self.metadata.has(MetadataKind::BaseDirectoryPath) {
            return;
        }
        for base in parent.metadata_of(MetadataKind::BaseDirectoryPath) {
            self.metadata.add(base.clone());
        }

        let nested = match (self.base_directory(), self.output_directory_name()) {
            (Some(base), Some(dir)) => Some(base.join(dir)),
            _ => None,
        };
        if let Some(nested) = nested {
            self.metadata.add(Meta::BaseDirectoryPath(nested));
        }
    }

    /// Destination path: effective directory joined with the file name.
    ///
    /// `None` when either piece is missing; such artifacts are not written.
    pub fn output_path(&self) -> Option<PathBuf> {
        let base = self.base_directory()?;
        let file = self.output_file_name()?;
        Some(base.join(file))
    }
}
