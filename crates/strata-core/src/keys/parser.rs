//! Line-oriented parsing of keyring text.
//!
//! ## Grammar
//!
//! ```text
//! <hex-key>[,<hex-iv>] [// <comment>]
//! [collection-a, collection-b]
//! # whole-line comment
//! ```
//!
//! - Keys are 32 or 64 hex digits (16 or 32 raw bytes).
//! - A comma directly after the key introduces an IV of the same length.
//! - Text after the hex material is the record's comment, up to end of line.
//! - The key is the first whitespace-delimited token made only of hex digits,
//!   ending at whitespace, `,`, `/` or end of line. Words before it, and
//!   lines with no such token, are skipped, so hex letters inside prose
//!   never start a record.
//! - A bracketed line opens a section: following keys belong to the listed
//!   collections until the next section line. `[]` returns to no collection.

use super::KeyEntry;
use crate::error::{Error, Result};
use std::io::BufRead;
use tracing::trace;

/// Key lengths (in bytes) the bundle accepts
pub const SUPPORTED_KEY_LENGTHS: [usize; 2] = [16, 32];

/// One classified line of keyring text
#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    /// Nothing to produce (blank, comment, or no hex material)
    Skip,
    /// Section header listing collection identifiers
    Section(Vec<String>),
    /// Raw record pieces before decoding
    Record {
        key: &'a str,
        iv: Option<&'a str>,
        comment: &'a str,
    },
}

/// Incremental parser producing one [`KeyEntry`] per call.
///
/// The reader is only advanced as far as the next record, so a consumer
/// that stops early never pays for the rest of the keyring.
pub(crate) struct RecordParser<R> {
    reader: R,
    line_no: usize,
    collections: Vec<String>,
    buf: String,
}

impl<R: BufRead> RecordParser<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            collections: Vec::new(),
            buf: String::new(),
        }
    }

    /// Reads lines until the next record is complete.
    ///
    /// Returns `Ok(None)` once the source is exhausted.
    pub(crate) fn next_record(&mut self) -> Result<Option<KeyEntry>> {
        loop {
            self.buf.clear();
            let read = self
                .reader
                .read_line(&mut self.buf)
                .map_err(|e| Error::file_read("<key bundle>", e))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            match classify_line(&self.buf, self.line_no)? {
                Line::Skip => continue,
                Line::Section(names) => {
                    trace!("Key bundle section at line {}: {:?}", self.line_no, names);
                    self.collections = names;
                }
                Line::Record { key, iv, comment } => {
                    let entry = decode_record(key, iv, comment, self.line_no)?
                        .with_collections(self.collections.clone());
                    return Ok(Some(entry));
                }
            }
        }
    }
}

fn classify_line(raw: &str, line_no: usize) -> Result<Line<'_>> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return Ok(Line::Skip);
    }

    if let Some(header) = line.strip_prefix('[') {
        let Some(body) = header.strip_suffix(']') else {
            return Err(Error::malformed_key_bundle(
                line_no,
                "unterminated collection header",
            ));
        };
        let names = body
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        return Ok(Line::Section(names));
    }

    let Some(start) = find_record_start(line) else {
        return Ok(Line::Skip);
    };
    let (key, rest) = split_hex_run(&line[start..]);

    let (iv, rest) = match rest.strip_prefix(',') {
        Some(after_comma) => {
            let (iv, rest) = split_hex_run(after_comma);
            if iv.is_empty() {
                return Err(Error::malformed_key_bundle(
                    line_no,
                    "truncated record: expected an IV after ','",
                ));
            }
            (Some(iv), rest)
        }
        None => (None, rest),
    };

    let comment = rest.trim();
    let comment = comment.strip_prefix("//").map(str::trim).unwrap_or(comment);

    Ok(Line::Record { key, iv, comment })
}

/// Byte offset of the first token-bounded hex run in `line`
fn find_record_start(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        let at_boundary = pos == 0 || bytes[pos - 1].is_ascii_whitespace();
        if !at_boundary || !bytes[pos].is_ascii_hexdigit() {
            pos += 1;
            continue;
        }
        let (run, rest) = split_hex_run(&line[pos..]);
        if ends_token(rest) {
            return Some(pos);
        }
        pos += run.len();
    }
    None
}

fn ends_token(rest: &str) -> bool {
    rest.chars()
        .next()
        .map_or(true, |c| c.is_whitespace() || c == ',' || c == '/')
}

/// Splits a string at the first non-hex character
fn split_hex_run(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(s.len());
    s.split_at(end)
}

fn decode_hex(run: &str, what: &str, line_no: usize) -> Result<Vec<u8>> {
    if run.len() % 2 != 0 {
        return Err(Error::malformed_key_bundle(
            line_no,
            format!("{} has an odd number of hex digits ({})", what, run.len()),
        ));
    }
    hex::decode(run).map_err(|e| Error::malformed_key_bundle(line_no, format!("{}: {}", what, e)))
}

fn decode_record(key: &str, iv: Option<&str>, comment: &str, line_no: usize) -> Result<KeyEntry> {
    let key = decode_hex(key, "key", line_no)?;
    if !SUPPORTED_KEY_LENGTHS.contains(&key.len()) {
        return Err(Error::UnsupportedKeyLength {
            line: line_no,
            length: key.len(),
        });
    }

    let iv = match iv {
        Some(run) => {
            let iv = decode_hex(run, "iv", line_no)?;
            if iv.len() != key.len() {
                return Err(Error::malformed_key_bundle(
                    line_no,
                    format!(
                        "iv length {} does not match key length {}",
                        iv.len(),
                        key.len()
                    ),
                ));
            }
            Some(iv)
        }
        None => None,
    };

    Ok(KeyEntry::new(key, iv, comment, line_no))
}
