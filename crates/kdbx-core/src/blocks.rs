//! Body framing: hashed blocks (3.x), HMAC blocks (4.x) and gzip

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use std::io::{Read, Write};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Payload bytes per block when writing
pub const BLOCK_SIZE: usize = 1024 * 1024;

const HASH_LEN: usize = 32;

/// Split into `index u32, sha256, size u32, data` blocks plus an empty terminator
pub fn write_hashed_blocks(data: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + (data.len() / BLOCK_SIZE + 2) * 40);
    let mut index: u32 = 0;
    for chunk in data.chunks(BLOCK_SIZE) {
        cancel.check()?;
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&Sha256::digest(chunk));
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(chunk);
        index += 1;
    }
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&[0u8; HASH_LEN]);
    out.extend_from_slice(&0u32.to_le_bytes());
    Ok(out)
}

/// Verify and join hashed blocks; the first bad block aborts the whole read
pub fn read_hashed_blocks(data: &[u8], cancel: &CancellationToken) -> Result<Zeroizing<Vec<u8>>> {
    let mut result = Zeroizing::new(Vec::with_capacity(data.len()));
    let mut pos = 0;
    let mut expected_index: u32 = 0;

    loop {
        cancel.check()?;
        if pos + 4 + HASH_LEN + 4 > data.len() {
            return Err(Error::IntegrityCheckFailed(format!(
                "hashed block {} is truncated",
                expected_index
            )));
        }
        let index = LittleEndian::read_u32(&data[pos..pos + 4]);
        let hash = &data[pos + 4..pos + 4 + HASH_LEN];
        let size = LittleEndian::read_u32(&data[pos + 4 + HASH_LEN..pos + 8 + HASH_LEN]) as usize;
        pos += 8 + HASH_LEN;

        if index != expected_index {
            return Err(Error::IntegrityCheckFailed(format!(
                "expected block {}, found {}",
                expected_index, index
            )));
        }

        if size == 0 {
            if hash.iter().any(|&b| b != 0) {
                return Err(Error::IntegrityCheckFailed(
                    "terminating block has a non-zero hash".to_string(),
                ));
            }
            break;
        }

        if pos + size > data.len() {
            return Err(Error::IntegrityCheckFailed(format!(
                "hashed block {} is truncated",
                index
            )));
        }
        let block = &data[pos..pos + size];
        if Sha256::digest(block).as_slice() != hash {
            return Err(Error::IntegrityCheckFailed(format!(
                "hash mismatch in block {}",
                index
            )));
        }
        result.extend_from_slice(block);
        pos += size;
        expected_index += 1;
    }

    tracing::debug!(blocks = expected_index, bytes = result.len(), "Verified hashed blocks");
    Ok(result)
}

/// SHA-512(index ‖ base key); `u64::MAX` is reserved for the header
pub fn hmac_block_key(block_index: u64, hmac_key: &[u8; 64]) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(block_index.to_le_bytes());
    hasher.update(hmac_key);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&hasher.finalize());
    out
}

fn block_mac(block_index: u64, hmac_key: &[u8; 64], block: &[u8]) -> Result<HmacSha256> {
    let key = hmac_block_key(block_index, hmac_key);
    let mut mac = HmacSha256::new_from_slice(key.as_slice())
        .map_err(|e| Error::KeyDerivation(format!("HMAC init failed: {}", e)))?;
    mac.update(&block_index.to_le_bytes());
    mac.update(&(block.len() as u32).to_le_bytes());
    mac.update(block);
    Ok(mac)
}

/// HMAC-SHA-256 of the outer header bytes
pub fn header_hmac(header: &[u8], hmac_key: &[u8; 64]) -> Result<[u8; 32]> {
    let key = hmac_block_key(u64::MAX, hmac_key);
    let mut mac = HmacSha256::new_from_slice(key.as_slice())
        .map_err(|e| Error::KeyDerivation(format!("HMAC init failed: {}", e)))?;
    mac.update(header);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time check of a stored header HMAC
pub fn verify_header_hmac(header: &[u8], stored: &[u8], hmac_key: &[u8; 64]) -> Result<bool> {
    let key = hmac_block_key(u64::MAX, hmac_key);
    let mut mac = HmacSha256::new_from_slice(key.as_slice())
        .map_err(|e| Error::KeyDerivation(format!("HMAC init failed: {}", e)))?;
    mac.update(header);
    Ok(mac.verify_slice(stored).is_ok())
}

/// Whether block 0 authenticates under `hmac_key`, without reading further
pub fn first_hmac_block_verifies(data: &[u8], hmac_key: &[u8; 64]) -> Result<bool> {
    if data.len() < HASH_LEN + 4 {
        return Ok(false);
    }
    let size = LittleEndian::read_u32(&data[HASH_LEN..HASH_LEN + 4]) as usize;
    let Some(block) = data.get(HASH_LEN + 4..HASH_LEN + 4 + size) else {
        return Ok(false);
    };
    Ok(block_mac(0, hmac_key, block)?
        .verify_slice(&data[..HASH_LEN])
        .is_ok())
}

/// Split into `mac, size u32, data` blocks plus an empty terminator
pub fn write_hmac_blocks(
    data: &[u8],
    hmac_key: &[u8; 64],
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + (data.len() / BLOCK_SIZE + 2) * 36);
    let mut index: u64 = 0;
    for chunk in data.chunks(BLOCK_SIZE) {
        cancel.check()?;
        let mac = block_mac(index, hmac_key, chunk)?.finalize().into_bytes();
        out.extend_from_slice(&mac);
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(chunk);
        index += 1;
    }
    let mac = block_mac(index, hmac_key, &[])?.finalize().into_bytes();
    out.extend_from_slice(&mac);
    out.extend_from_slice(&0u32.to_le_bytes());
    Ok(out)
}

/// Verify and join HMAC blocks, terminator included
pub fn read_hmac_blocks(
    data: &[u8],
    hmac_key: &[u8; 64],
    cancel: &CancellationToken,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut result = Zeroizing::new(Vec::with_capacity(data.len()));
    let mut pos = 0;
    let mut index: u64 = 0;

    loop {
        cancel.check()?;
        if pos + HASH_LEN + 4 > data.len() {
            return Err(Error::IntegrityCheckFailed(format!(
                "HMAC block {} is truncated",
                index
            )));
        }
        let stored = &data[pos..pos + HASH_LEN];
        let size = LittleEndian::read_u32(&data[pos + HASH_LEN..pos + HASH_LEN + 4]) as usize;
        pos += HASH_LEN + 4;

        if pos + size > data.len() {
            return Err(Error::IntegrityCheckFailed(format!(
                "HMAC block {} is truncated",
                index
            )));
        }
        let block = &data[pos..pos + size];
        pos += size;

        if block_mac(index, hmac_key, block)?.verify_slice(stored).is_err() {
            return Err(Error::IntegrityCheckFailed(format!(
                "HMAC mismatch in block {}",
                index
            )));
        }
        if size == 0 {
            break;
        }
        result.extend_from_slice(block);
        index += 1;
    }

    tracing::debug!(blocks = index, bytes = result.len(), "Verified HMAC blocks");
    Ok(result)
}

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::DecompressionFailed(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::DecompressionFailed(format!("compression failed: {}", e)))
}

pub fn gzip_decompress(data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut decoder = GzDecoder::new(data);
    let mut result = Zeroizing::new(Vec::new());
    decoder
        .read_to_end(&mut result)
        .map_err(|e| Error::DecompressionFailed(e.to_string()))?;
    Ok(result)
}
