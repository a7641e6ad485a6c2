//! Brute-force key resolution against a keyring.

use super::{Decryptor, KeyBundle, KeyEntry};
use crate::error::Result;
use std::sync::Arc;
use tracing::{debug, trace};

/// The winning candidate of a key search
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    /// The key that produced valid plaintext
    pub entry: Arc<KeyEntry>,
    /// Decryption of the searched ciphertext under `entry`
    pub plaintext: Vec<u8>,
    /// Decryptor for further data sealed with the same key
    pub decryptor: Decryptor,
}

/// Finds the first key in a bundle whose plaintext passes a validity check.
///
/// The resolver keeps no state between calls. Callers that need the same
/// key repeatedly should cache the returned decryptor, see [`DecryptorSlot`].
#[derive(Debug, Clone, Copy)]
pub struct KeyResolver<'a> {
    bundle: &'a KeyBundle,
}

impl<'a> KeyResolver<'a> {
    /// Creates a resolver over `bundle`
    pub fn new(bundle: &'a KeyBundle) -> Self {
        Self { bundle }
    }

    /// Returns the bundle being searched
    pub fn bundle(&self) -> &'a KeyBundle {
        self.bundle
    }

    /// Trial-decrypts `ciphertext` with each candidate in bundle order.
    ///
    /// Only keys in `collection` are tried when it is set. Returns the first
    /// candidate whose plaintext satisfies `is_valid`, or `None` once the
    /// candidates run out. Errors only come from a malformed keyring.
    pub fn resolve<F>(
        &self,
        collection: Option<&str>,
        ciphertext: &[u8],
        mut is_valid: F,
    ) -> Result<Option<ResolvedKey>>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let mut attempts = 0usize;

        for entry in self.bundle.select(collection) {
            let entry = entry?;
            let decryptor = entry.decryptor()?;
            let plaintext = decryptor.decrypt(ciphertext);
            attempts += 1;

            if is_valid(&plaintext) {
                debug!(
                    "Resolved key from line {} ({} {}) after {} attempt(s)",
                    entry.line(),
                    entry.cipher().as_str(),
                    entry.mode().as_str(),
                    attempts
                );
                return Ok(Some(ResolvedKey {
                    entry,
                    plaintext,
                    decryptor,
                }));
            }
            trace!("Key from line {} rejected", entry.line());
        }

        debug!(
            "No key found after {} attempt(s){}",
            attempts,
            collection
                .map(|c| format!(" in collection '{}'", c))
                .unwrap_or_default()
        );
        Ok(None)
    }
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Unsearched,
    Missing,
    Found {
        entry: Arc<KeyEntry>,
        decryptor: Decryptor,
    },
}

/// Per-container memo of the key search.
///
/// A detection context holds one slot; the first search result (hit or
/// miss) is kept and every later decrypt within the container reuses it.
#[derive(Debug, Default)]
pub struct DecryptorSlot {
    state: SlotState,
}

impl DecryptorSlot {
    /// Creates an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once a search has been performed
    pub fn is_searched(&self) -> bool {
        !matches!(self.state, SlotState::Unsearched)
    }

    /// The cached decryptor, if a search found one
    pub fn get(&self) -> Option<&Decryptor> {
        match &self.state {
            SlotState::Found { decryptor, .. } => Some(decryptor),
            _ => None,
        }
    }

    /// The key that was found, if any
    pub fn entry(&self) -> Option<&KeyEntry> {
        match &self.state {
            SlotState::Found { entry, .. } => Some(entry),
            _ => None,
        }
    }

    /// Searches on first use, then returns the cached outcome.
    ///
    /// The plaintext of a successful search is returned only by the call
    /// that performed it.
    pub fn resolve_with<F>(
        &mut self,
        resolver: &KeyResolver<'_>,
        collection: Option<&str>,
        ciphertext: &[u8],
        is_valid: F,
    ) -> Result<Option<Vec<u8>>>
    where
        F: FnMut(&[u8]) -> bool,
    {
        if self.is_searched() {
            return Ok(self.get().map(|d| d.decrypt(ciphertext)));
        }

        match resolver.resolve(collection, ciphertext, is_valid)? {
            Some(resolved) => {
                self.state = SlotState::Found {
                    entry: resolved.entry,
                    decryptor: resolved.decryptor,
                };
                Ok(Some(resolved.plaintext))
            }
            None => {
                self.state = SlotState::Missing;
                Ok(None)
            }
        }
    }

    /// Decrypts with the cached decryptor
    pub fn decrypt(&self, data: &[u8]) -> Option<Vec<u8>> {
        self.get().map(|d| d.decrypt(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_encrypt;
    use pretty_assertions::assert_eq;

    const MAGIC: &[u8] = b"MAGICHDR";

    fn bundle() -> KeyBundle {
        KeyBundle::parse(
            "[first]\n\
             000102030405060708090A0B0C0D0E0F // one\n\
             [second]\n\
             101112131415161718191A1B1C1D1E1F,A0A1A2A3A4A5A6A7A8A9AAABACADAEAF // two\n\
             [first, second]\n\
             202122232425262728292A2B2C2D2E2F // three\n",
        )
    }

    fn sealed_with_second() -> Vec<u8> {
        let mut plaintext = MAGIC.to_vec();
        plaintext.resize(32, 0x11);
        let key = hex::decode("101112131415161718191A1B1C1D1E1F").unwrap();
        let iv = hex::decode("A0A1A2A3A4A5A6A7A8A9AAABACADAEAF").unwrap();
        test_encrypt(&key, Some(iv.as_slice()), &plaintext)
    }

    #[test]
    fn test_resolves_only_matching_key() {
        let bundle = bundle();
        let resolver = KeyResolver::new(&bundle);
        let ciphertext = sealed_with_second();

        let resolved = resolver
            .resolve(None, &ciphertext, |p| p.starts_with(MAGIC))
            .unwrap()
            .unwrap();

        assert_eq!(resolved.entry.comment(), "two");
        assert!(resolved.plaintext.starts_with(MAGIC));
        assert_eq!(resolved.decryptor.decrypt(&ciphertext), resolved.plaintext);
    }

    #[test]
    fn test_first_valid_candidate_wins() {
        let bundle = bundle();
        let resolver = KeyResolver::new(&bundle);
        let mut seen = Vec::new();

        let resolved = resolver
            .resolve(None, &[0u8; 16], |_| {
                seen.push(());
                true
            })
            .unwrap()
            .unwrap();

        assert_eq!(resolved.entry.comment(), "one");
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_no_match_is_not_an_error() {
        let bundle = bundle();
        let resolver = KeyResolver::new(&bundle);
        let result = resolver.resolve(None, &sealed_with_second(), |_| false).unwrap();
        assert!(result.is_none());

        let empty = KeyBundle::empty();
        assert!(KeyResolver::new(&empty)
            .resolve(None, &[0u8; 16], |_| true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_collection_restricts_candidates() {
        let bundle = bundle();
        let resolver = KeyResolver::new(&bundle);
        let ciphertext = sealed_with_second();

        let miss = resolver
            .resolve(Some("first"), &ciphertext, |p| p.starts_with(MAGIC))
            .unwrap();
        assert!(miss.is_none());

        let hit = resolver
            .resolve(Some("second"), &ciphertext, |p| p.starts_with(MAGIC))
            .unwrap();
        assert_eq!(hit.unwrap().entry.line(), 4);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let bundle = bundle();
        let resolver = KeyResolver::new(&bundle);
        let ciphertext = sealed_with_second();

        let lines: Vec<_> = (0..3)
            .map(|_| {
                resolver
                    .resolve(None, &ciphertext, |p| p.starts_with(MAGIC))
                    .unwrap()
                    .map(|r| r.entry.line())
            })
            .collect();
        assert_eq!(lines, vec![Some(4), Some(4), Some(4)]);
    }

    #[test]
    fn test_malformed_bundle_propagates() {
        let bundle = KeyBundle::parse("000102030405060708090A0B0C0D0E0F,0011\n");
        let resolver = KeyResolver::new(&bundle);
        assert!(resolver.resolve(None, &[0u8; 16], |_| true).is_err());
    }

    #[test]
    fn test_slot_searches_once() {
        let bundle = bundle();
        let resolver = KeyResolver::new(&bundle);
        let ciphertext = sealed_with_second();
        let mut slot = DecryptorSlot::new();
        let mut calls = 0;

        let first = slot
            .resolve_with(&resolver, None, &ciphertext, |p| {
                calls += 1;
                p.starts_with(MAGIC)
            })
            .unwrap();
        assert!(first.unwrap().starts_with(MAGIC));
        assert_eq!(calls, 2);
        assert_eq!(slot.entry().unwrap().comment(), "two");

        let second = slot
            .resolve_with(&resolver, None, &ciphertext, |_| panic!("searched twice"))
            .unwrap();
        assert!(second.unwrap().starts_with(MAGIC));
    }

    #[test]
    fn test_slot_remembers_miss() {
        let bundle = bundle();
        let resolver = KeyResolver::new(&bundle);
        let mut slot = DecryptorSlot::new();

        assert!(slot
            .resolve_with(&resolver, None, &[0u8; 16], |_| false)
            .unwrap()
            .is_none());
        assert!(slot.is_searched());
        assert!(slot
            .resolve_with(&resolver, None, &[0u8; 16], |_| panic!("searched twice"))
            .unwrap()
            .is_none());
        assert!(slot.decrypt(&[0u8; 16]).is_none());
    }
}
