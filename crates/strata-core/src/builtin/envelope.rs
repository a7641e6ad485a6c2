//! Whole-image AES envelopes.
//!
//! Vendors often seal an ordinary filesystem or kernel image with a single
//! AES key and ship it without any header. Such a blob is recognised by
//! trial-decrypting its leading bytes with every keyring candidate until the
//! plaintext starts with a known image signature.

use super::{match_signature, Signature, KNOWN_SIGNATURES};
use crate::addon::{Artifacts, Detection, Extractor, FormatAddon, CERTAIN};
use crate::error::{Error, Result};
use crate::keys::{DecryptorSlot, KeyBundle, KeyResolver, AES_BLOCK_SIZE};
use crate::source::{DataSource, SourceFlags};
use crate::vfs::VfsNode;
use std::sync::Arc;
use tracing::debug;

/// Registration id of the envelope addon
pub const ENVELOPE_ID: &str = "aes-envelope";

/// Default number of leading bytes decrypted per candidate key
const DEFAULT_PROBE_LEN: usize = AES_BLOCK_SIZE;

/// Configuration for [`EnvelopeAddon`]
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    /// Only try keys of this collection
    pub collection: Option<String>,
    /// Leading bytes decrypted per candidate, rounded down to whole blocks
    pub probe_len: usize,
    /// Plaintext signatures that prove a key correct
    pub signatures: Vec<Signature>,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            collection: None,
            probe_len: DEFAULT_PROBE_LEN,
            signatures: KNOWN_SIGNATURES.to_vec(),
        }
    }
}

impl EnvelopeConfig {
    /// Creates a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the key search to one collection
    pub fn collection(mut self, collection: Option<String>) -> Self {
        self.collection = collection;
        self
    }

    /// Sets the probe length
    pub fn probe_len(mut self, len: usize) -> Self {
        self.probe_len = len;
        self
    }

    /// Replaces the accepted signatures
    pub fn signatures(mut self, signatures: Vec<Signature>) -> Self {
        self.signatures = signatures;
        self
    }

    /// Probe length for a blob of `available` bytes, in whole blocks
    fn probe_for(&self, available: usize) -> usize {
        let wanted = self.probe_len.max(AES_BLOCK_SIZE).min(available);
        wanted - wanted % AES_BLOCK_SIZE
    }
}

/// Detection state: the key found for this container, if any
#[derive(Debug, Default)]
pub struct EnvelopeContext {
    slot: DecryptorSlot,
    signature: Option<Signature>,
}

impl EnvelopeContext {
    /// Signature the decrypted probe started with
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// The cached key search
    pub fn slot(&self) -> &DecryptorSlot {
        &self.slot
    }
}

/// Addon for headerless AES-sealed images
#[derive(Debug)]
pub struct EnvelopeAddon {
    keys: Arc<KeyBundle>,
    config: EnvelopeConfig,
}

impl EnvelopeAddon {
    /// Creates the addon over a shared keyring
    pub fn new(keys: Arc<KeyBundle>, config: EnvelopeConfig) -> Self {
        Self { keys, config }
    }

    /// The keyring searched during detection
    pub fn keys(&self) -> &KeyBundle {
        &self.keys
    }

    /// Current configuration
    pub fn config(&self) -> &EnvelopeConfig {
        &self.config
    }
}

impl FormatAddon for EnvelopeAddon {
    type Context = EnvelopeContext;
    type Extractor = EnvelopeExtractor;

    fn id(&self) -> &str {
        ENVELOPE_ID
    }

    fn description(&self) -> &str {
        "Headerless image sealed with a keyring AES key"
    }

    fn detect(&self, source: &DataSource) -> Result<Detection<EnvelopeContext>> {
        let signatures = &self.config.signatures;
        let mut context = EnvelopeContext::default();

        // Already plaintext, or too short to hold a single block
        if source.len() < AES_BLOCK_SIZE || match_signature(source.data(), signatures).is_some() {
            return Ok(Detection::no_match(context));
        }

        let probe = &source.data()[..self.config.probe_for(source.len())];
        let resolver = KeyResolver::new(&self.keys);
        let plaintext = context.slot.resolve_with(
            &resolver,
            self.config.collection.as_deref(),
            probe,
            |candidate| match_signature(candidate, signatures).is_some(),
        )?;

        let Some(plaintext) = plaintext else {
            return Ok(Detection::no_match(context));
        };

        context.signature = match_signature(&plaintext, signatures).copied();
        if let (Some(signature), Some(entry)) = (context.signature.as_ref(), context.slot.entry()) {
            debug!(
                "'{}' decrypts to {} with the key from line {}",
                source.name(),
                signature.name,
                entry.line()
            );
        }
        Ok(Detection::new(CERTAIN, context))
    }

    fn create_extractor(&self, detection: Detection<EnvelopeContext>) -> EnvelopeExtractor {
        EnvelopeExtractor {
            context: detection.into_context(),
        }
    }

    fn create_vfs_node(&self, artifact: &DataSource) -> Result<VfsNode> {
        let name = artifact.output_file_name().unwrap_or(artifact.name());
        Ok(VfsNode::file(name, artifact.bytes().clone()))
    }
}

/// Decrypts the whole envelope with the key found during detection
#[derive(Debug)]
pub struct EnvelopeExtractor {
    context: EnvelopeContext,
}

impl Extractor for EnvelopeExtractor {
    fn extract<'a>(&'a mut self, source: &'a DataSource) -> Result<Artifacts<'a>> {
        let decryptor = self.context.slot.get().ok_or_else(|| {
            Error::malformed_container(ENVELOPE_ID, "no key was resolved for this envelope")
        })?;
        let name = format!("{}.dec", source.name());

        Ok(Box::new(std::iter::once_with(move || {
            let plaintext = decryptor.decrypt(source.data());
            Ok(DataSource::new(name.clone(), plaintext)
                .with_output_name(name)
                .with_flags(SourceFlags::PROCESS_FURTHER))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::builtin_finder;
    use crate::keys::test_encrypt;
    use crate::orchestrator::Orchestrator;
    use crate::sink::MemorySink;
    use crate::vfs::VfsDirectory;
    use pretty_assertions::assert_eq;

    const WRONG_KEY: &str = "000102030405060708090A0B0C0D0E0F";
    const RIGHT_KEY: &str = "603DEB1015CA71BE2B73AEF0857D77811F352C073B6108D72D9810A30914DFF4";
    const RIGHT_IV: &str = "F0F1F2F3F4F5F6F7F8F9FAFBFCFDFEFF000102030405060708090A0B0C0D0E0F";

    fn keyring() -> Arc<KeyBundle> {
        Arc::new(KeyBundle::parse(format!(
            "[router]\n{WRONG_KEY} // decoy\n[camera]\n{RIGHT_KEY},{RIGHT_IV} // camera fw\n"
        )))
    }

    fn image() -> Vec<u8> {
        let mut plaintext = b"hsqs".to_vec();
        plaintext.extend((0u8..60).map(|i| i.wrapping_mul(7)));
        plaintext
    }

    fn sealed() -> Vec<u8> {
        let key = hex::decode(RIGHT_KEY).unwrap();
        let iv = hex::decode(RIGHT_IV).unwrap();
        test_encrypt(&key, Some(iv.as_slice()), &image())
    }

    #[test]
    fn test_detects_and_decrypts() {
        let addon = EnvelopeAddon::new(keyring(), EnvelopeConfig::default());
        let source = DataSource::new("fw.bin", sealed());

        let detection = addon.detect(&source).unwrap();
        assert_eq!(detection.confidence(), CERTAIN);
        assert_eq!(detection.context().signature().map(|s| s.name), Some("squashfs"));
        assert_eq!(detection.context().slot().entry().unwrap().comment(), "camera fw");

        let mut extractor = addon.create_extractor(detection);
        let artifacts: Vec<_> = extractor
            .extract(&source)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name(), "fw.bin.dec");
        assert_eq!(artifacts[0].output_file_name(), Some("fw.bin.dec"));
        assert_eq!(artifacts[0].data(), image().as_slice());
        assert!(artifacts[0].has_flags(SourceFlags::OUTPUT | SourceFlags::PROCESS_FURTHER));
    }

    #[test]
    fn test_plaintext_is_not_an_envelope() {
        // A malformed keyring proves the keys are never consulted
        let broken = Arc::new(KeyBundle::parse("0011\n"));
        let addon = EnvelopeAddon::new(broken, EnvelopeConfig::default());
        let detection = addon.detect(&DataSource::new("fs", image())).unwrap();
        assert!(!detection.is_match());
    }

    #[test]
    fn test_short_or_unknown_blobs_score_zero() {
        let addon = EnvelopeAddon::new(keyring(), EnvelopeConfig::default());
        assert!(!addon.detect(&DataSource::new("tiny", vec![0xAA; 8])).unwrap().is_match());
        assert!(!addon.detect(&DataSource::new("noise", vec![0xAA; 64])).unwrap().is_match());
    }

    #[test]
    fn test_collection_limits_search() {
        let config = EnvelopeConfig::new().collection(Some("router".to_string()));
        let addon = EnvelopeAddon::new(keyring(), config);
        let detection = addon.detect(&DataSource::new("fw.bin", sealed())).unwrap();
        assert!(!detection.is_match());
        assert!(detection.context().slot().is_searched());
    }

    #[test]
    fn test_malformed_keyring_propagates() {
        let broken = Arc::new(KeyBundle::parse("0011\n"));
        let addon = EnvelopeAddon::new(broken, EnvelopeConfig::default());
        let err = addon.detect(&DataSource::new("fw.bin", sealed())).unwrap_err();
        assert!(err.is_key_bundle());
    }

    #[test]
    fn test_probe_length_is_whole_blocks() {
        let config = EnvelopeConfig::new().probe_len(40);
        assert_eq!(config.probe_for(100), 32);
        assert_eq!(config.probe_for(20), 16);
        assert_eq!(EnvelopeConfig::new().probe_len(0).probe_for(64), 16);
    }

    #[test]
    fn test_orchestrated_envelope() {
        let finder = builtin_finder(keyring(), EnvelopeConfig::default()).unwrap();
        let mut root = VfsDirectory::new("");
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new());
        let input = DataSource::input("fw.bin", sealed(), "/out");

        let report = orchestrator.run_with_vfs(&input, &mut root).unwrap();

        assert_eq!(report.nodes_visited, 2);
        assert_eq!(report.nodes_matched, 1);
        assert_eq!(
            orchestrator.sink().get("/out/fw.bin.dec").map(|b| b.to_vec()),
            Some(image())
        );
        assert!(root.get("fw.bin/fw.bin.dec").is_some());
    }
}
