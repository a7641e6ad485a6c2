//! The format addon contract.
//!
//! A format addon bundles everything the engine needs to handle one
//! container format:
//!
//! 1. [`FormatAddon::detect`] scores a [`DataSource`] and returns parsed
//!    header state as a typed context
//! 2. [`FormatAddon::create_extractor`] turns the winning detection into an
//!    [`Extractor`]
//! 3. [`FormatAddon::create_vfs_node`] optionally builds a virtual
//!    filesystem node for an extracted artifact
//!
//! The context type is an associated type, so the detector and extractor of
//! one format share statically typed state. The [`FormatFinder`] erases the
//! addons behind a private object-safe trait when they are registered.
//!
//! ## Example
//!
//! ```
//! use strata_core::addon::{Artifacts, Detection, Extractor, FormatAddon};
//! use strata_core::{DataSource, Result};
//!
//! struct Header {
//!     body_offset: usize,
//! }
//!
//! struct Tagged;
//!
//! impl FormatAddon for Tagged {
//!     type Context = Header;
//!     type Extractor = TaggedExtractor;
//!
//!     fn id(&self) -> &str {
//!         "tagged"
//!     }
//!
//!     fn detect(&self, source: &DataSource) -> Result<Detection<Header>> {
//!         let confidence = if source.data().starts_with(b"TAG!") { 100 } else { 0 };
//!         Ok(Detection::new(confidence, Header { body_offset: 4 }))
//!     }
//!
//!     fn create_extractor(&self, detection: Detection<Header>) -> TaggedExtractor {
//!         TaggedExtractor { header: detection.into_context() }
//!     }
//! }
//!
//! struct TaggedExtractor {
//!     header: Header,
//! }
//!
//! impl Extractor for TaggedExtractor {
//!     fn extract<'a>(&'a mut self, source: &'a DataSource) -> Result<Artifacts<'a>> {
//!         let body = source.slice("body", self.header.body_offset..source.len());
//!         Ok(Box::new(body.into_iter().map(Ok)))
//!     }
//! }
//! ```

mod finder;

use crate::error::{Error, Result};
use crate::source::DataSource;
use crate::vfs::VfsNode;

pub use finder::{FormatFinder, FormatMatch, MatchedAddon};

/// Confidence conventionally reported for a certain match
pub const CERTAIN: u32 = 100;

/// Outcome of one detector invocation.
///
/// A confidence of zero means "not this format". Scores add up partial
/// evidence and have no fixed ceiling, though [`CERTAIN`] is customary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection<C> {
    confidence: u32,
    context: C,
}

impl<C> Detection<C> {
    /// Creates a detection with the given score
    pub fn new(confidence: u32, context: C) -> Self {
        Self {
            confidence,
            context,
        }
    }

    /// Creates a zero-confidence detection
    pub fn no_match(context: C) -> Self {
        Self::new(0, context)
    }

    /// The confidence score
    pub fn confidence(&self) -> u32 {
        self.confidence
    }

    /// Returns true if the score is above zero
    pub fn is_match(&self) -> bool {
        self.confidence > 0
    }

    /// Borrows the format-specific context
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Mutably borrows the format-specific context
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Takes ownership of the context
    pub fn into_context(self) -> C {
        self.context
    }
}

impl<C: Default> Detection<C> {
    /// Zero-confidence detection with a default context
    pub fn none() -> Self {
        Self::no_match(C::default())
    }
}

/// Lazily produced, finite, one-shot sequence of artifacts.
///
/// Pulling the next item may perform I/O or decryption.
pub type Artifacts<'a> = Box<dyn Iterator<Item = Result<DataSource>> + 'a>;

/// Unpacks a recognised container into its artifacts
pub trait Extractor {
    /// Starts extraction of `source`.
    ///
    /// Errors found while reading headers are returned directly; errors met
    /// later surface as items of the sequence.
    fn extract<'a>(&'a mut self, source: &'a DataSource) -> Result<Artifacts<'a>>;
}

/// Plugin contract for one container format
pub trait FormatAddon: Send + Sync {
    /// Parsed header state shared between detection and extraction
    type Context: 'static;
    /// Extractor built from a winning detection
    type Extractor: Extractor + 'static;

    /// Stable identifier used for registration
    fn id(&self) -> &str;

    /// One-line description for listings
    fn description(&self) -> &str {
        ""
    }

    /// Scores `source`; zero confidence means no match
    fn detect(&self, source: &DataSource) -> Result<Detection<Self::Context>>;

    /// Builds the extractor for a detection this addon produced
    fn create_extractor(&self, detection: Detection<Self::Context>) -> Self::Extractor;

    /// Builds a virtual filesystem node for one of this addon's artifacts.
    ///
    /// Optional: the default reports [`Error::Unsupported`], which the
    /// orchestrator treats as "skip".
    fn create_vfs_node(&self, artifact: &DataSource) -> Result<VfsNode> {
        let _ = artifact;
        Err(Error::unsupported(format!("vfs nodes for '{}'", self.id())))
    }
}
