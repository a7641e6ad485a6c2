//! Formats shipped with the engine.
//!
//! Only format-agnostic addons live here. The [`KNOWN_SIGNATURES`] table is
//! what the envelope addon uses to tell a correct key from a wrong one.

mod envelope;

use crate::addon::FormatFinder;
use crate::error::Result;
use crate::keys::KeyBundle;
use std::sync::Arc;

pub use envelope::{EnvelopeAddon, EnvelopeConfig, EnvelopeContext, EnvelopeExtractor, ENVELOPE_ID};

/// Leading magic of a well-known plaintext image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Short human-readable name
    pub name: &'static str,
    /// Bytes the image starts with
    pub magic: &'static [u8],
}

impl Signature {
    /// Returns true if `data` starts with this signature
    pub fn matches(&self, data: &[u8]) -> bool {
        data.starts_with(self.magic)
    }
}

/// Image signatures recognised out of the box
pub const KNOWN_SIGNATURES: &[Signature] = &[
    Signature { name: "squashfs", magic: b"hsqs" },
    Signature { name: "ubi", magic: b"UBI#" },
    Signature { name: "uimage", magic: &[0x27, 0x05, 0x19, 0x56] },
    Signature { name: "android-boot", magic: b"ANDROID!" },
    Signature { name: "elf", magic: b"\x7fELF" },
    Signature { name: "zip", magic: b"PK\x03\x04" },
    Signature { name: "gzip", magic: &[0x1F, 0x8B, 0x08] },
    Signature { name: "xz", magic: &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00] },
    Signature { name: "cpio", magic: b"070701" },
    Signature { name: "cramfs", magic: &[0x45, 0x3D, 0xCD, 0x28] },
];

/// First signature in `signatures` that `data` starts with
pub fn match_signature<'s>(data: &[u8], signatures: &'s [Signature]) -> Option<&'s Signature> {
    signatures.iter().find(|s| s.matches(data))
}

/// A finder with every built-in addon registered
pub fn builtin_finder(keys: Arc<KeyBundle>, envelope: EnvelopeConfig) -> Result<FormatFinder> {
    FormatFinder::new().with(EnvelopeAddon::new(keys, envelope))
}
