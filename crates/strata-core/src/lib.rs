//! # strata-core
//!
//! A library for excavating nested, possibly encrypted firmware containers.
//!
//! This crate provides the core functionality for:
//! - Loading keyrings and brute-forcing the AES key a container was sealed with
//! - Recognising container formats through pluggable, scored format addons
//! - Unpacking containers recursively and placing every artifact on disk
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`keys`]: Keyring parsing, AES decryption and key resolution
//! - [`source`]: Data sources with flags and placement metadata
//! - [`addon`]: The format addon contract and the format finder
//! - [`orchestrator`]: Recursive extraction driver
//! - [`sink`]: Where persisted artifacts go
//! - [`vfs`]: In-memory mirror of the extraction tree
//! - [`builtin`]: Formats shipped with the engine
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use strata_core::builtin::{builtin_finder, EnvelopeConfig};
//! use strata_core::{DataSource, FileSink, KeyBundle, Orchestrator};
//! use std::fs;
//! use std::sync::Arc;
//!
//! let keys = Arc::new(KeyBundle::load("keys.txt")?);
//! let finder = builtin_finder(keys, EnvelopeConfig::default())?;
//!
//! let input = DataSource::input("fw.bin", fs::read("fw.bin")?, "out");
//! let mut orchestrator = Orchestrator::new(&finder, FileSink::new("out"));
//! let report = orchestrator.run(&input)?;
//! println!("{} artifacts written", report.artifacts_written);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! - [`FormatAddon`]: Teach the engine a new container format
//! - [`ArtifactSink`]: Send artifacts somewhere other than the filesystem

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod addon;
pub mod builtin;
pub mod error;
pub mod keys;
pub mod orchestrator;
pub mod sink;
pub mod source;
pub mod vfs;

// Re-export primary types for convenience
pub use addon::{Detection, Extractor, FormatAddon, FormatFinder, FormatMatch};
pub use error::{Error, Result};
pub use keys::{Decryptor, DecryptorSlot, KeyBundle, KeyEntry, KeyResolver};
pub use orchestrator::{ExtractionReport, Orchestrator, OrchestratorConfig};
pub use sink::{ArtifactSink, FileSink, MemorySink};
pub use source::{DataSource, Meta, MetadataKind, SourceFlags};
pub use vfs::{VfsDirectory, VfsNode};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
