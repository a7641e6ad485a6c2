//! Registration table and best-match selection across addons.

use super::{Extractor, FormatAddon};
use crate::error::{Error, Result};
use crate::source::DataSource;
use crate::vfs::VfsNode;
use std::fmt;
use tracing::{debug, trace};

type PendingExtractor<'s> = Box<dyn FnOnce() -> Box<dyn Extractor> + 's>;

/// A scored detection whose extractor has not been built yet
struct Candidate<'s> {
    confidence: u32,
    build: PendingExtractor<'s>,
}

/// Object-safe view of a [`FormatAddon`]
trait ErasedAddon: Send + Sync {
    fn addon_id(&self) -> &str;
    fn addon_description(&self) -> &str;
    fn detect_candidate<'s>(&'s self, source: &DataSource) -> Result<Candidate<'s>>;
    fn vfs_node(&self, artifact: &DataSource) -> Result<VfsNode>;
}

impl<A: FormatAddon> ErasedAddon for A {
    fn addon_id(&self) -> &str {
        self.id()
    }

    fn addon_description(&self) -> &str {
        self.description()
    }

    fn detect_candidate<'s>(&'s self, source: &DataSource) -> Result<Candidate<'s>> {
        let detection = self.detect(source)?;
        Ok(Candidate {
            confidence: detection.confidence(),
            build: Box::new(move || {
                Box::new(self.create_extractor(detection)) as Box<dyn Extractor>
            }),
        })
    }

    fn vfs_node(&self, artifact: &DataSource) -> Result<VfsNode> {
        self.create_vfs_node(artifact)
    }
}

/// Handle to the addon that won a detection
#[derive(Clone, Copy)]
pub struct MatchedAddon<'f> {
    addon: &'f dyn ErasedAddon,
}

impl<'f> MatchedAddon<'f> {
    /// Identifier of the addon
    pub fn id(&self) -> &'f str {
        self.addon.addon_id()
    }

    /// Asks the addon for a virtual node of one of its artifacts
    pub fn create_vfs_node(&self, artifact: &DataSource) -> Result<VfsNode> {
        self.addon.vfs_node(artifact)
    }
}

impl fmt::Debug for MatchedAddon<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MatchedAddon").field(&self.id()).finish()
    }
}

/// The winning addon for a data source, with its extractor ready
pub struct FormatMatch<'f> {
    addon: MatchedAddon<'f>,
    confidence: u32,
    extractor: Box<dyn Extractor>,
}

impl<'f> FormatMatch<'f> {
    /// Identifier of the winning addon
    pub fn id(&self) -> &'f str {
        self.addon.id()
    }

    /// Confidence the winner reported
    pub fn confidence(&self) -> u32 {
        self.confidence
    }

    /// Handle to the winning addon, independent of the extractor borrow
    pub fn addon(&self) -> MatchedAddon<'f> {
        self.addon
    }

    /// The extractor built from the winning detection
    pub fn extractor(&mut self) -> &mut dyn Extractor {
        self.extractor.as_mut()
    }

    /// Takes the extractor out of the match
    pub fn into_extractor(self) -> Box<dyn Extractor> {
        self.extractor
    }

    /// Asks the winning addon for a virtual node of one of its artifacts
    pub fn create_vfs_node(&self, artifact: &DataSource) -> Result<VfsNode> {
        self.addon.create_vfs_node(artifact)
    }
}

impl fmt::Debug for FormatMatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatMatch")
            .field("id", &self.id())
            .field("confidence", &self.confidence)
            .finish()
    }
}

/// Runs every registered addon's detector and picks the best.
///
/// Registration order matters: on equal confidence the addon registered
/// first wins.
#[derive(Default)]
pub struct FormatFinder {
    addons: Vec<Box<dyn ErasedAddon>>,
}

impl FormatFinder {
    /// Creates an empty finder
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an addon under its identifier.
    ///
    /// Fails if the identifier is already taken.
    pub fn register<A: FormatAddon + 'static>(&mut self, addon: A) -> Result<()> {
        if self.addons.iter().any(|a| a.addon_id() == addon.id()) {
            return Err(Error::DuplicateFormat {
                id: addon.id().to_string(),
            });
        }
        debug!("Registered format '{}'", addon.id());
        self.addons.push(Box::new(addon));
        Ok(())
    }

    /// Registers an addon (builder style)
    pub fn with<A: FormatAddon + 'static>(mut self, addon: A) -> Result<Self> {
        self.register(addon)?;
        Ok(self)
    }

    /// Identifiers in registration (tie-break) order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.addons.iter().map(|a| a.addon_id())
    }

    /// Identifier and description pairs in registration order
    pub fn describe(&self) -> impl Iterator<Item = (&str, &str)> {
        self.addons
            .iter()
            .map(|a| (a.addon_id(), a.addon_description()))
    }

    /// Number of registered addons
    pub fn len(&self) -> usize {
        self.addons.len()
    }

    /// Returns true if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    /// Detects the format of `source`.
    ///
    /// Returns `Ok(None)` when no addon reports a confidence above zero. A
    /// later addon replaces the current best only with a strictly greater
    /// score. Detector errors propagate.
    pub fn find(&self, source: &DataSource) -> Result<Option<FormatMatch<'_>>> {
        let mut best: Option<(&dyn ErasedAddon, Candidate<'_>)> = None;

        for addon in &self.addons {
            let candidate = addon.detect_candidate(source)?;
            trace!(
                "Format '{}' scored {} on '{}'",
                addon.addon_id(),
                candidate.confidence,
                source.name()
            );

            let best_confidence = best.as_ref().map(|(_, c)| c.confidence).unwrap_or(0);
            if candidate.confidence > best_confidence {
                best = Some((addon.as_ref(), candidate));
            }
        }

        let Some((addon, candidate)) = best else {
            trace!("No format matched '{}'", source.name());
            return Ok(None);
        };

        debug!(
            "Detected '{}' as {} (confidence {})",
            source.name(),
            addon.addon_id(),
            candidate.confidence
        );

        Ok(Some(FormatMatch {
            addon: MatchedAddon { addon },
            confidence: candidate.confidence,
            extractor: (candidate.build)(),
        }))
    }
}

impl fmt::Debug for FormatFinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
