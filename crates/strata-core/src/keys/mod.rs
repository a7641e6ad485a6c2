//! Keyring loading, trial decryption and key resolution.
//!
//! Encrypted containers rarely say which key they were sealed with. This
//! module turns a textual keyring into a [`KeyBundle`] and provides a
//! [`KeyResolver`] that finds the first key whose plaintext passes a
//! caller-supplied validity check.
//!
//! ## Laziness
//!
//! A [`KeyBundle`] parses its source on demand and caches every produced
//! entry. Iterating it again (or jumping to an index) replays the cache and
//! only touches the source for records not yet seen:
//!
//! ```
//! use strata_core::keys::KeyBundle;
//!
//! let bundle = KeyBundle::parse(
//!     "000102030405060708090A0B0C0D0E0F\n\
//!      101112131415161718191A1B1C1D1E1F\n",
//! );
//! assert!(bundle.get(1)?.is_some());
//! assert_eq!(bundle.parsed_len(), 2);
//! # Ok::<(), strata_core::Error>(())
//! ```

mod cipher;
mod parser;
mod resolver;

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub use cipher::{Decryptor, AES_BLOCK_SIZE};
pub use parser::SUPPORTED_KEY_LENGTHS;
pub use resolver::{DecryptorSlot, KeyResolver, ResolvedKey};

use parser::RecordParser;

#[cfg(test)]
pub(crate) use cipher::tests::encrypt as test_encrypt;

/// Block cipher variant, implied by the key length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherFamily {
    /// 16-byte key
    Aes128,
    /// 32-byte key
    Aes256,
}

impl CipherFamily {
    /// Returns the family for a key of the given length
    pub fn from_key_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(CipherFamily::Aes128),
            32 => Some(CipherFamily::Aes256),
            _ => None,
        }
    }

    /// Returns a short display name
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherFamily::Aes128 => "aes-128",
            CipherFamily::Aes256 => "aes-256",
        }
    }
}

/// Block chaining mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockMode {
    /// Unchained: every block decrypted independently
    Ecb,
    /// Chained with an initialization vector
    Cbc,
}

impl BlockMode {
    /// Returns a short display name
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockMode::Ecb => "ecb",
            BlockMode::Cbc => "cbc",
        }
    }
}

/// A single candidate key from a keyring
#[derive(Clone, PartialEq, Eq)]
pub struct KeyEntry {
    key: Vec<u8>,
    iv: Option<Vec<u8>>,
    comment: String,
    collections: Vec<String>,
    line: usize,
}

impl KeyEntry {
    pub(crate) fn new(
        key: Vec<u8>,
        iv: Option<Vec<u8>>,
        comment: impl Into<String>,
        line: usize,
    ) -> Self {
        Self {
            key,
            iv,
            comment: comment.into(),
            collections: Vec::new(),
            line,
        }
    }

    pub(crate) fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = collections;
        self
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Raw IV bytes, if the record is chained
    pub fn iv(&self) -> Option<&[u8]> {
        self.iv.as_deref()
    }

    /// Free-text comment following the hex material
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Collections this key was listed under
    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    /// Returns true if the key was listed under the given collection
    pub fn belongs_to(&self, collection: &str) -> bool {
        self.collections.iter().any(|c| c == collection)
    }

    /// 1-based line of the keyring this entry came from
    pub fn line(&self) -> usize {
        self.line
    }

    /// Cipher family implied by the key length
    pub fn cipher(&self) -> CipherFamily {
        // Key length is validated by the parser
        CipherFamily::from_key_len(self.key.len()).unwrap_or(CipherFamily::Aes128)
    }

    /// Block mode implied by the presence of an IV
    pub fn mode(&self) -> BlockMode {
        if self.iv.is_some() {
            BlockMode::Cbc
        } else {
            BlockMode::Ecb
        }
    }

    /// Builds a decryptor for this key
    pub fn decryptor(&self) -> Result<Decryptor> {
        Decryptor::new(&self.key, self.iv.as_deref())
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs
        f.debug_struct("KeyEntry")
            .field("cipher", &self.cipher())
            .field("mode", &self.mode())
            .field("comment", &self.comment)
            .field("collections", &self.collections)
            .field("line", &self.line)
            .finish()
    }
}

/// Parse failure remembered by the bundle so later reads report it again
#[derive(Debug, Clone)]
enum ParseFailure {
    Malformed { line: usize, details: String },
    KeyLength { line: usize, length: usize },
}

impl ParseFailure {
    fn from_error(err: &Error) -> Self {
        match err {
            Error::MalformedKeyBundle { line, details } => ParseFailure::Malformed {
                line: *line,
                details: details.clone(),
            },
            Error::UnsupportedKeyLength { line, length } => ParseFailure::KeyLength {
                line: *line,
                length: *length,
            },
            other => ParseFailure::Malformed {
                line: 0,
                details: other.to_string(),
            },
        }
    }

    fn to_error(&self) -> Error {
        match self {
            ParseFailure::Malformed { line, details } => {
                Error::malformed_key_bundle(*line, details.clone())
            }
            ParseFailure::KeyLength { line, length } => Error::UnsupportedKeyLength {
                line: *line,
                length: *length,
            },
        }
    }
}

type Source = Box<dyn BufRead + Send>;

struct BundleState {
    entries: Vec<Arc<KeyEntry>>,
    parser: Option<RecordParser<Source>>,
    failure: Option<ParseFailure>,
}

impl BundleState {
    /// Parses until `index` is cached or the source ends
    fn fill_to(&mut self, index: usize) -> Result<()> {
        while self.entries.len() <= index {
            if let Some(failure) = &self.failure {
                return Err(failure.to_error());
            }
            let Some(parser) = self.parser.as_mut() else {
                return Ok(());
            };
            match parser.next_record() {
                Ok(Some(entry)) => self.entries.push(Arc::new(entry)),
                Ok(None) => self.parser = None,
                Err(e) => {
                    self.failure = Some(ParseFailure::from_error(&e));
                    self.parser = None;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// An ordered, lazily materialized keyring
pub struct KeyBundle {
    state: Mutex<BundleState>,
}

impl KeyBundle {
    /// Creates a bundle reading records from `reader` on demand
    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            state: Mutex::new(BundleState {
                entries: Vec::new(),
                parser: Some(RecordParser::new(Box::new(reader))),
                failure: None,
            }),
        }
    }

    /// Creates a bundle over keyring text
    pub fn parse(text: impl Into<String>) -> Self {
        Self::from_reader(Cursor::new(text.into()))
    }

    /// Creates a bundle with no keys
    pub fn empty() -> Self {
        Self::parse(String::new())
    }

    /// Loads a keyring file and validates every record.
    ///
    /// Malformed records are reported here, before any detection runs.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| Error::file_read(path, e))?;
        let bundle = Self::from_reader(BufReader::new(file));
        let count = bundle.validate()?;
        debug!("Loaded {} keys from {}", count, path.display());
        Ok(bundle)
    }

    /// Parses the whole source, returning the number of keys
    pub fn validate(&self) -> Result<usize> {
        let mut state = self.state.lock();
        state.fill_to(usize::MAX)?;
        Ok(state.entries.len())
    }

    /// Returns the entry at `index`, parsing further records if needed
    pub fn get(&self, index: usize) -> Result<Option<Arc<KeyEntry>>> {
        let mut state = self.state.lock();
        state.fill_to(index)?;
        Ok(state.entries.get(index).cloned())
    }

    /// Number of entries materialized so far
    pub fn parsed_len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Iterates every key in bundle order
    pub fn iter(&self) -> KeyIter<'_> {
        KeyIter {
            bundle: self,
            index: 0,
            collection: None,
            done: false,
        }
    }

    /// Iterates the keys listed under `collection`, in bundle order
    pub fn collection<'a>(&'a self, collection: &'a str) -> KeyIter<'a> {
        KeyIter {
            bundle: self,
            index: 0,
            collection: Some(collection),
            done: false,
        }
    }

    /// Iterates all keys, or only one collection when `collection` is set
    pub fn select<'a>(&'a self, collection: Option<&'a str>) -> KeyIter<'a> {
        match collection {
            Some(id) => self.collection(id),
            None => self.iter(),
        }
    }
}

impl fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("KeyBundle")
            .field("parsed", &state.entries.len())
            .field("exhausted", &state.parser.is_none())
            .finish()
    }
}

/// Replayable iterator over a [`KeyBundle`].
///
/// Yields `Err` once if the underlying source is malformed, then stops.
pub struct KeyIter<'a> {
    bundle: &'a KeyBundle,
    index: usize,
    collection: Option<&'a str>,
    done: bool,
}

impl Iterator for KeyIter<'_> {
    type Item = Result<Arc<KeyEntry>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let entry = match self.bundle.get(self.index) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            self.index += 1;

            match self.collection {
                Some(id) if !entry.belongs_to(id) => continue,
                _ => return Some(Ok(entry)),
            }
        }
        None
    }
}
