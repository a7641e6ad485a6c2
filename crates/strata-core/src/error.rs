//! Error types for the strata-core library.
//!
//! Detection misses and exhausted key searches are not errors: they surface
//! as `None` from the finder and the resolver. Everything in this module is a
//! genuine failure that aborts at least the current extraction branch.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all strata operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to create output directory
    #[error("failed to create directory '{path}': {source}")]
    DirectoryCreate {
        /// Path to the directory that failed to create
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Output file exists and overwriting was not requested
    #[error("file already exists: '{path}'")]
    FileExists {
        /// The existing file
        path: PathBuf,
    },

    /// Path traversal attempt detected (security error)
    #[error("path traversal detected: '{path}' would escape output directory")]
    PathTraversal {
        /// The suspicious path
        path: PathBuf,
    },

    /// A key bundle record could not be parsed
    #[error("malformed key bundle at line {line}: {details}")]
    MalformedKeyBundle {
        /// 1-based line of the offending record
        line: usize,
        /// Detailed description of the issue
        details: String,
    },

    /// A key bundle record carries a key that is neither 16 nor 32 bytes
    #[error("unsupported key length {length} bytes at line {line}: expected 16 or 32")]
    UnsupportedKeyLength {
        /// 1-based line of the offending record
        line: usize,
        /// Length of the decoded key in bytes
        length: usize,
    },

    /// A container violated one of its format's invariants during extraction
    #[error("malformed {format} container: {details}")]
    MalformedContainer {
        /// Format identifier of the addon that rejected the data
        format: String,
        /// Detailed description of the issue
        details: String,
    },

    /// An addon does not implement an optional capability
    #[error("capability not supported: {capability}")]
    Unsupported {
        /// Name of the missing capability
        capability: String,
    },

    /// Two addons were registered under the same format identifier
    #[error("format '{id}' is already registered")]
    DuplicateFormat {
        /// The clashing identifier
        id: String,
    },

    /// A failure raised while processing a specific node of the extraction tree
    #[error("while processing '{node}': {source}")]
    Node {
        /// Name of the data source being processed
        node: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a new directory creation error
    pub fn directory_create(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DirectoryCreate {
            path: path.into(),
            source,
        }
    }

    /// Creates a new path traversal error
    pub fn path_traversal(path: impl Into<PathBuf>) -> Self {
        Self::PathTraversal { path: path.into() }
    }

    /// Creates a new key bundle parse error
    pub fn malformed_key_bundle(line: usize, details: impl Into<String>) -> Self {
        Self::MalformedKeyBundle {
            line,
            details: details.into(),
        }
    }

    /// Creates a new container error on behalf of an addon
    pub fn malformed_container(format: impl Into<String>, details: impl Into<String>) -> Self {
        Self::MalformedContainer {
            format: format.into(),
            details: details.into(),
        }
    }

    /// Creates a new unsupported-capability error
    pub fn unsupported(capability: impl Into<String>) -> Self {
        Self::Unsupported {
            capability: capability.into(),
        }
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Attaches the name of the node being processed.
    ///
    /// Errors that already name a node keep the innermost one.
    pub fn in_node(self, node: impl Into<String>) -> Self {
        match self {
            Self::Node { .. } => self,
            other => Self::Node {
                node: node.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns true if this error only reports a missing optional capability
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Returns true if this error came from loading a key bundle
    pub fn is_key_bundle(&self) -> bool {
        matches!(
            self,
            Self::MalformedKeyBundle { .. } | Self::UnsupportedKeyLength { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::path_traversal("/etc/passwd");
        assert!(err.to_string().contains("path traversal"));
        assert!(err.to_string().contains("/etc/passwd"));

        let err = Error::malformed_key_bundle(3, "iv length 8 does not match key length 16");
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_in_node_keeps_innermost() {
        let err = Error::malformed_container("pkg", "segment 3 out of order")
            .in_node("inner.bin")
            .in_node("outer.bin");

        match err {
            Error::Node { node, source } => {
                assert_eq!(node, "inner.bin");
                assert!(matches!(*source, Error::MalformedContainer { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_classification() {
        assert!(Error::unsupported("vfs node").is_unsupported());
        assert!(!Error::internal("boom").is_unsupported());
        assert!(Error::UnsupportedKeyLength { line: 1, length: 8 }.is_key_bundle());
        assert!(!Error::unsupported("vfs node").is_key_bundle());
    }
}
