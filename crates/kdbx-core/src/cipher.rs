//! Outer (bulk) ciphers

use crate::error::{Error, Result};
use aes::Aes256;
use chacha20::ChaCha20;
use cipher::block_padding::{NoPadding, Pkcs7};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use uuid::Uuid;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const AES_BLOCK_LEN: usize = 16;

/// AES-256 in CBC mode with PKCS#7 padding
pub const CIPHER_AES256: Uuid = Uuid::from_bytes([
    0x31, 0xc1, 0xf2, 0xe6, 0xbf, 0x71, 0x43, 0x50, 0xbe, 0x58, 0x05, 0x21, 0x6a, 0xfc, 0x5a, 0xff,
]);

/// ChaCha20 with a 96-bit nonce
pub const CIPHER_CHACHA20: Uuid = Uuid::from_bytes([
    0xd6, 0x03, 0x8a, 0x2b, 0x8b, 0x6f, 0x4c, 0xb5, 0xa5, 0x24, 0x33, 0x9a, 0x31, 0xdb, 0xb5, 0x9a,
]);

/// The closed set of outer ciphers a KDBX header can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    Aes256Cbc,
    ChaCha20,
}

impl CipherSuite {
    /// Look a cipher up by its header UUID
    pub fn from_uuid(uuid: &Uuid) -> Result<Self> {
        match *uuid {
            CIPHER_AES256 => Ok(Self::Aes256Cbc),
            CIPHER_CHACHA20 => Ok(Self::ChaCha20),
            other => Err(Error::UnknownCipher(other)),
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Aes256Cbc => CIPHER_AES256,
            Self::ChaCha20 => CIPHER_CHACHA20,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            Self::Aes256Cbc => 16,
            Self::ChaCha20 => 12,
        }
    }

    pub fn key_len(&self) -> usize {
        32
    }

    pub fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.check_lengths(key, iv)?;
        match self {
            Self::Aes256Cbc => {
                let enc = Aes256CbcEnc::new_from_slices(key, iv)
                    .map_err(|e| Error::KeyDerivation(format!("AES init failed: {}", e)))?;
                Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
            }
            Self::ChaCha20 => Ok(chacha20_apply(key, iv, plaintext)),
        }
    }

    /// Decrypt and strip padding in one go.
    ///
    /// A padding failure means the key was wrong, or the data was altered
    /// after authentication, which the block layer already rules out.
    pub fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let mut plaintext = Zeroizing::new(self.decrypt_raw(key, iv, ciphertext)?);
        let body_len = self
            .unpad(&plaintext)
            .ok_or(Error::LikelyWrongCredentials)?
            .len();
        plaintext.truncate(body_len);
        Ok(plaintext)
    }

    /// Decrypt without looking at padding, so callers can inspect a known
    /// prefix before deciding how to classify a padding failure.
    pub fn decrypt_raw(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_lengths(key, iv)?;
        match self {
            Self::Aes256Cbc => {
                if ciphertext.len() % AES_BLOCK_LEN != 0 {
                    return Err(Error::IntegrityCheckFailed(format!(
                        "ciphertext length {} is not a multiple of the AES block size",
                        ciphertext.len()
                    )));
                }
                let dec = Aes256CbcDec::new_from_slices(key, iv)
                    .map_err(|e| Error::KeyDerivation(format!("AES init failed: {}", e)))?;
                dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                    .map_err(|_| Error::LikelyWrongCredentials)
            }
            Self::ChaCha20 => Ok(chacha20_apply(key, iv, ciphertext)),
        }
    }

    /// Remove block padding; `None` if it is malformed
    pub fn unpad<'a>(&self, plaintext: &'a [u8]) -> Option<&'a [u8]> {
        match self {
            Self::Aes256Cbc => {
                let pad = *plaintext.last()? as usize;
                if pad == 0 || pad > AES_BLOCK_LEN || pad > plaintext.len() {
                    return None;
                }
                let (body, padding) = plaintext.split_at(plaintext.len() - pad);
                if padding.iter().any(|&b| b as usize != pad) {
                    return None;
                }
                Some(body)
            }
            Self::ChaCha20 => Some(plaintext),
        }
    }

    fn check_lengths(&self, key: &[u8], iv: &[u8]) -> Result<()> {
        if key.len() != self.key_len() {
            return Err(Error::KeyDerivation(format!(
                "cipher key must be {} bytes, got {}",
                self.key_len(),
                key.len()
            )));
        }
        if iv.len() != self.iv_len() {
            return Err(Error::InvalidHeaderField {
                field: "EncryptionIV",
                reason: format!("expected {} bytes, got {}", self.iv_len(), iv.len()),
            });
        }
        Ok(())
    }
}

fn chacha20_apply(key: &[u8], nonce: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(&mut out);
    out
}
