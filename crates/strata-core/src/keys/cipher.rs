//! AES decryption in unchained (ECB) and chained (CBC) modes.

use super::{BlockMode, CipherFamily};
use crate::error::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::{Aes128Dec, Aes256Dec};
use std::fmt;

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Clone)]
enum BlockCipher {
    Aes128(Aes128Dec),
    Aes256(Aes256Dec),
}

impl BlockCipher {
    fn new(key: &[u8]) -> Result<Self> {
        let cipher = match CipherFamily::from_key_len(key.len()) {
            Some(CipherFamily::Aes128) => BlockCipher::Aes128(
                Aes128Dec::new_from_slice(key).map_err(|e| Error::internal(e.to_string()))?,
            ),
            Some(CipherFamily::Aes256) => BlockCipher::Aes256(
                Aes256Dec::new_from_slice(key).map_err(|e| Error::internal(e.to_string()))?,
            ),
            None => {
                return Err(Error::internal(format!(
                    "cannot build a decryptor for a {}-byte key",
                    key.len()
                )))
            }
        };
        Ok(cipher)
    }

    fn family(&self) -> CipherFamily {
        match self {
            BlockCipher::Aes128(_) => CipherFamily::Aes128,
            BlockCipher::Aes256(_) => CipherFamily::Aes256,
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.decrypt_block(block),
            BlockCipher::Aes256(c) => c.decrypt_block(block),
        }
    }
}

/// A ready-to-use decryptor for one key.
///
/// In chained mode every call to [`Decryptor::decrypt`] starts a fresh chain
/// from the IV. Trailing bytes that do not fill a whole block are left as is.
#[derive(Clone)]
pub struct Decryptor {
    cipher: BlockCipher,
    iv: Option<[u8; AES_BLOCK_SIZE]>,
}

impl Decryptor {
    /// Creates a decryptor from raw key material.
    ///
    /// The AES block is 128 bits wide, so only the leading 16 bytes of a
    /// longer IV seed the chain.
    pub fn new(key: &[u8], iv: Option<&[u8]>) -> Result<Self> {
        let cipher = BlockCipher::new(key)?;
        let iv = match iv {
            Some(iv) if iv.len() >= AES_BLOCK_SIZE => {
                let mut block = [0u8; AES_BLOCK_SIZE];
                block.copy_from_slice(&iv[..AES_BLOCK_SIZE]);
                Some(block)
            }
            Some(iv) => {
                return Err(Error::internal(format!(
                    "iv of {} bytes is shorter than one block",
                    iv.len()
                )))
            }
            None => None,
        };
        Ok(Self { cipher, iv })
    }

    /// Cipher family of the underlying key
    pub fn cipher(&self) -> CipherFamily {
        self.cipher.family()
    }

    /// Chaining mode
    pub fn mode(&self) -> BlockMode {
        if self.iv.is_some() {
            BlockMode::Cbc
        } else {
            BlockMode::Ecb
        }
    }

    /// Decrypts `data` into a new buffer
    pub fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.decrypt_in_place(&mut out);
        out
    }

    /// Decrypts `buf` in place
    pub fn decrypt_in_place(&self, buf: &mut [u8]) {
        let mut previous = self.iv;

        for chunk in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            let mut ciphertext = [0u8; AES_BLOCK_SIZE];
            ciphertext.copy_from_slice(chunk);

            self.cipher.decrypt_block(chunk);

            if let Some(prev) = previous.as_mut() {
                for (b, p) in chunk.iter_mut().zip(prev.iter()) {
                    *b ^= p;
                }
                *prev = ciphertext;
            }
        }
    }
}

impl fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decryptor")
            .field("cipher", &self.cipher())
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;
    use aes::{Aes128Enc, Aes256Enc};
    use pretty_assertions::assert_eq;

    /// Encrypts whole blocks for tests, mirroring [`Decryptor`]
    pub(crate) fn encrypt(key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        let mut previous: Option<[u8; 16]> = iv.map(|iv| {
            let mut b = [0u8; 16];
            b.copy_from_slice(&iv[..16]);
            b
        });

        for chunk in out.chunks_exact_mut(16) {
            if let Some(prev) = previous.as_ref() {
                for (b, p) in chunk.iter_mut().zip(prev.iter()) {
                    *b ^= p;
                }
            }
            let block = GenericArray::from_mut_slice(chunk);
            match key.len() {
                16 => Aes128Enc::new_from_slice(key).unwrap().encrypt_block(block),
                32 => Aes256Enc::new_from_slice(key).unwrap().encrypt_block(block),
                n => panic!("bad test key length {n}"),
            }
            if let Some(prev) = previous.as_mut() {
                prev.copy_from_slice(chunk);
            }
        }
        out
    }

    #[test]
    fn test_fips197_aes128_vector() {
        let key = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let ciphertext = hex::decode("69c4e0d86a7b0430d8cdb78070b4c55a").unwrap();
        let decryptor = Decryptor::new(&key, None).unwrap();

        assert_eq!(
            decryptor.decrypt(&ciphertext),
            hex::decode("00112233445566778899aabbccddeeff").unwrap()
        );
        assert_eq!(decryptor.mode(), BlockMode::Ecb);
        assert_eq!(decryptor.cipher(), CipherFamily::Aes128);
    }

    #[test]
    fn test_fips197_aes256_vector() {
        let key = hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            .unwrap();
        let ciphertext = hex::decode("8ea2b7ca516745bfeafc49904b496089").unwrap();
        let decryptor = Decryptor::new(&key, None).unwrap();

        assert_eq!(
            decryptor.decrypt(&ciphertext),
            hex::decode("00112233445566778899aabbccddeeff").unwrap()
        );
        assert_eq!(decryptor.cipher(), CipherFamily::Aes256);
    }

    #[test]
    fn test_cbc_chains_blocks() {
        let key = [7u8; 16];
        let iv: Vec<u8> = (0u8..16).collect();
        let plaintext: Vec<u8> = (0u8..64).collect();
        let ciphertext = encrypt(&key, Some(&iv), &plaintext);

        let cbc = Decryptor::new(&key, Some(&iv)).unwrap();
        assert_eq!(cbc.mode(), BlockMode::Cbc);
        assert_eq!(cbc.decrypt(&ciphertext), plaintext);

        // Without the chain only the blocks differ by the xor
        let ecb = Decryptor::new(&key, None).unwrap();
        assert_ne!(ecb.decrypt(&ciphertext), plaintext);
    }

    #[test]
    fn test_trailing_partial_block_untouched() {
        let key = [3u8; 32];
        let mut plaintext = vec![0xAAu8; 32];
        let mut ciphertext = encrypt(&key, None, &plaintext);
        ciphertext.extend_from_slice(&[1, 2, 3]);
        plaintext.extend_from_slice(&[1, 2, 3]);

        let decryptor = Decryptor::new(&key, None).unwrap();
        assert_eq!(decryptor.decrypt(&ciphertext), plaintext);
    }

    #[test]
    fn test_long_iv_uses_leading_block() {
        let key = [9u8; 32];
        let iv: Vec<u8> = (0u8..32).collect();
        let plaintext = vec![0x55u8; 48];
        let ciphertext = encrypt(&key, Some(&iv[..16]), &plaintext);

        let decryptor = Decryptor::new(&key, Some(&iv)).unwrap();
        assert_eq!(decryptor.decrypt(&ciphertext), plaintext);
    }

    #[test]
    fn test_rejects_bad_key_length() {
        assert!(Decryptor::new(&[0u8; 8], None).is_err());
        assert!(Decryptor::new(&[0u8; 16], Some(&[0u8; 4])).is_err());
    }
}
