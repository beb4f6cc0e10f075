//! Key derivation: AES-KDF and Argon2
//!
//! Both engines turn the 32-byte composite key into the 32-byte transformed
//! key. They are deliberately slow, so both observe a [`CancellationToken`].

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::random_bytes;
use crate::variant_dictionary::{VariantDictionary, VariantValue};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use argon2::{Algorithm, Argon2, AssociatedData, ParamsBuilder, Version};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

pub const KDF_AES: Uuid = Uuid::from_bytes([
    0xc9, 0xd9, 0xf3, 0x9a, 0x62, 0x8a, 0x44, 0x60, 0xbf, 0x74, 0x0d, 0x08, 0xc1, 0x8a, 0x4f, 0xea,
]);
pub const KDF_ARGON2D: Uuid = Uuid::from_bytes([
    0xef, 0x63, 0x6d, 0xdf, 0x8c, 0x29, 0x44, 0x4b, 0x91, 0xf7, 0xa9, 0xa4, 0x03, 0xe3, 0x0a, 0x0c,
]);
pub const KDF_ARGON2ID: Uuid = Uuid::from_bytes([
    0x9e, 0x29, 0x8b, 0x19, 0x56, 0xdb, 0x47, 0x73, 0xb2, 0x3d, 0xfc, 0x3e, 0xc6, 0xf0, 0xa1, 0xe6,
]);

// Variant dictionary keys
const KEY_UUID: &str = "$UUID";
const KEY_AES_ROUNDS: &str = "R";
const KEY_AES_SEED: &str = "S";
const KEY_ARGON2_SALT: &str = "S";
const KEY_ARGON2_PARALLELISM: &str = "P";
const KEY_ARGON2_MEMORY: &str = "M";
const KEY_ARGON2_ITERATIONS: &str = "I";
const KEY_ARGON2_VERSION: &str = "V";
const KEY_ARGON2_SECRET: &str = "K";
const KEY_ARGON2_ASSOC: &str = "A";

pub const DEFAULT_AES_ROUNDS: u64 = 6000;
pub const DEFAULT_ARGON2_MEMORY_KIB: u64 = 64 * 1024;
pub const DEFAULT_ARGON2_ITERATIONS: u64 = 2;
pub const DEFAULT_ARGON2_PARALLELISM: u32 = 2;
pub const ARGON2_VERSION_10: u32 = 0x10;
pub const ARGON2_VERSION_13: u32 = 0x13;

const SEED_LEN: usize = 32;

/// Rounds between cancellation checks in the AES-KDF loop
const AES_CANCEL_INTERVAL: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Variant {
    Argon2d,
    Argon2id,
}

impl Argon2Variant {
    fn uuid(&self) -> Uuid {
        match self {
            Self::Argon2d => KDF_ARGON2D,
            Self::Argon2id => KDF_ARGON2ID,
        }
    }

    fn algorithm(&self) -> Algorithm {
        match self {
            Self::Argon2d => Algorithm::Argon2d,
            Self::Argon2id => Algorithm::Argon2id,
        }
    }
}

/// KDF selection and tuning, as stored in the outer header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdfParameters {
    AesKdf {
        seed: Vec<u8>,
        rounds: u64,
    },
    Argon2 {
        variant: Argon2Variant,
        salt: Vec<u8>,
        memory_kib: u64,
        iterations: u64,
        parallelism: u32,
        version: u32,
        secret: Option<Vec<u8>>,
        associated_data: Option<Vec<u8>>,
    },
}

impl KdfParameters {
    /// AES-KDF with a fresh seed
    pub fn aes(rounds: u64) -> Self {
        Self::AesKdf {
            seed: random_bytes(SEED_LEN),
            rounds,
        }
    }

    /// Argon2 with a fresh salt and the current algorithm version
    pub fn argon2(variant: Argon2Variant, memory_kib: u64, iterations: u64, parallelism: u32) -> Self {
        Self::Argon2 {
            variant,
            salt: random_bytes(SEED_LEN),
            memory_kib,
            iterations,
            parallelism,
            version: ARGON2_VERSION_13,
            secret: None,
            associated_data: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::AesKdf { .. } => KDF_AES,
            Self::Argon2 { variant, .. } => variant.uuid(),
        }
    }

    pub fn is_aes(&self) -> bool {
        matches!(self, Self::AesKdf { .. })
    }

    /// Replace the seed or salt with fresh randomness, keeping the costs
    pub fn reseed(&mut self) {
        match self {
            Self::AesKdf { seed, .. } => *seed = random_bytes(SEED_LEN),
            Self::Argon2 { salt, .. } => *salt = random_bytes(SEED_LEN),
        }
    }

    pub fn from_variant_dictionary(dict: &VariantDictionary) -> Result<Self> {
        let uuid_bytes = dict
            .get_bytes(KEY_UUID)
            .ok_or_else(|| missing_param(KEY_UUID))?;
        let uuid = Uuid::from_slice(uuid_bytes).map_err(|_| Error::InvalidHeaderField {
            field: "KdfParameters",
            reason: format!("$UUID has {} bytes", uuid_bytes.len()),
        })?;

        let variant = match uuid {
            KDF_AES => {
                let seed = dict
                    .get_bytes(KEY_AES_SEED)
                    .ok_or_else(|| missing_param(KEY_AES_SEED))?
                    .to_vec();
                let rounds = dict
                    .get_u64(KEY_AES_ROUNDS)
                    .ok_or_else(|| missing_param(KEY_AES_ROUNDS))?;
                return Ok(Self::AesKdf { seed, rounds });
            }
            KDF_ARGON2D => Argon2Variant::Argon2d,
            KDF_ARGON2ID => Argon2Variant::Argon2id,
            other => return Err(Error::UnknownKdf(other)),
        };

        let salt = dict
            .get_bytes(KEY_ARGON2_SALT)
            .ok_or_else(|| missing_param(KEY_ARGON2_SALT))?
            .to_vec();
        let memory = dict
            .get_u64(KEY_ARGON2_MEMORY)
            .ok_or_else(|| missing_param(KEY_ARGON2_MEMORY))?;
        let iterations = dict
            .get_u64(KEY_ARGON2_ITERATIONS)
            .ok_or_else(|| missing_param(KEY_ARGON2_ITERATIONS))?;
        let parallelism = dict
            .get_u32(KEY_ARGON2_PARALLELISM)
            .ok_or_else(|| missing_param(KEY_ARGON2_PARALLELISM))?;
        let version = dict.get_u32(KEY_ARGON2_VERSION).unwrap_or(ARGON2_VERSION_13);
        // argon2 counts memory in KiB; anything finer could not be written back
        if memory % 1024 != 0 {
            return Err(Error::InvalidHeaderField {
                field: "KdfParameters",
                reason: format!("Argon2 memory {} is not a whole number of KiB", memory),
            });
        }

        Ok(Self::Argon2 {
            variant,
            salt,
            memory_kib: memory / 1024,
            iterations,
            parallelism,
            version,
            secret: dict.get_bytes(KEY_ARGON2_SECRET).map(<[u8]>::to_vec),
            associated_data: dict.get_bytes(KEY_ARGON2_ASSOC).map(<[u8]>::to_vec),
        })
    }

    pub fn to_variant_dictionary(&self) -> VariantDictionary {
        let mut dict = VariantDictionary::new();
        dict.set(KEY_UUID, VariantValue::Bytes(self.uuid().as_bytes().to_vec()));
        match self {
            Self::AesKdf { seed, rounds } => {
                dict.set(KEY_AES_ROUNDS, VariantValue::UInt64(*rounds));
                dict.set(KEY_AES_SEED, VariantValue::Bytes(seed.clone()));
            }
            Self::Argon2 {
                salt,
                memory_kib,
                iterations,
                parallelism,
                version,
                secret,
                associated_data,
                ..
            } => {
                dict.set(KEY_ARGON2_SALT, VariantValue::Bytes(salt.clone()));
                dict.set(KEY_ARGON2_PARALLELISM, VariantValue::UInt32(*parallelism));
                dict.set(KEY_ARGON2_MEMORY, VariantValue::UInt64(memory_kib * 1024));
                dict.set(KEY_ARGON2_ITERATIONS, VariantValue::UInt64(*iterations));
                dict.set(KEY_ARGON2_VERSION, VariantValue::UInt32(*version));
                if let Some(secret) = secret {
                    dict.set(KEY_ARGON2_SECRET, VariantValue::Bytes(secret.clone()));
                }
                if let Some(ad) = associated_data {
                    dict.set(KEY_ARGON2_ASSOC, VariantValue::Bytes(ad.clone()));
                }
            }
        }
        dict
    }

    /// Run the KDF over the composite key
    pub fn transform_key(
        &self,
        composite_key: &[u8; 32],
        cancel: &CancellationToken,
    ) -> Result<Zeroizing<[u8; 32]>> {
        cancel.check()?;
        let transformed = match self {
            Self::AesKdf { seed, rounds } => aes_transform(composite_key, seed, *rounds, cancel)?,
            Self::Argon2 {
                variant,
                salt,
                memory_kib,
                iterations,
                parallelism,
                version,
                secret,
                associated_data,
            } => {
                tracing::debug!(
                    ?variant,
                    memory_kib,
                    iterations,
                    parallelism,
                    version,
                    "Running Argon2"
                );
                let params = Argon2Params {
                    memory_kib: *memory_kib,
                    iterations: *iterations,
                    parallelism: *parallelism,
                    version: *version,
                    secret: secret.as_deref(),
                    associated_data: associated_data.as_deref(),
                };
                argon2_transform(composite_key, *variant, salt, &params)?
            }
        };
        // Argon2 has no hook inside its passes; discard its result if the
        // caller gave up while it ran.
        cancel.check()?;
        Ok(transformed)
    }
}

fn missing_param(key: &str) -> Error {
    Error::InvalidHeaderField {
        field: "KdfParameters",
        reason: format!("missing {:?}", key),
    }
}

fn aes_transform(
    composite_key: &[u8; 32],
    seed: &[u8],
    rounds: u64,
    cancel: &CancellationToken,
) -> Result<Zeroizing<[u8; 32]>> {
    if seed.len() != SEED_LEN {
        return Err(Error::InvalidHeaderField {
            field: "TransformSeed",
            reason: format!("expected {} bytes, got {}", SEED_LEN, seed.len()),
        });
    }
    tracing::debug!(rounds, "Running AES-KDF");

    let cipher = Aes256::new(GenericArray::from_slice(seed));
    let mut block = Zeroizing::new(*composite_key);
    for round in 0..rounds {
        if round % AES_CANCEL_INTERVAL == 0 {
            cancel.check()?;
        }
        let (left, right) = block.split_at_mut(16);
        cipher.encrypt_block(GenericArray::from_mut_slice(left));
        cipher.encrypt_block(GenericArray::from_mut_slice(right));
    }

    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&Sha256::digest(&block[..]));
    Ok(out)
}

struct Argon2Params<'a> {
    memory_kib: u64,
    iterations: u64,
    parallelism: u32,
    version: u32,
    secret: Option<&'a [u8]>,
    associated_data: Option<&'a [u8]>,
}

fn argon2_transform(
    composite_key: &[u8; 32],
    variant: Argon2Variant,
    salt: &[u8],
    params: &Argon2Params<'_>,
) -> Result<Zeroizing<[u8; 32]>> {
    let version = match params.version {
        ARGON2_VERSION_10 => Version::V0x10,
        ARGON2_VERSION_13 => Version::V0x13,
        other => {
            return Err(Error::KeyDerivation(format!(
                "unsupported Argon2 version {:#x}",
                other
            )))
        }
    };
    let memory = u32::try_from(params.memory_kib)
        .map_err(|_| Error::KeyDerivation("Argon2 memory cost too large".to_string()))?;
    let iterations = u32::try_from(params.iterations)
        .map_err(|_| Error::KeyDerivation("Argon2 iteration count too large".to_string()))?;

    let mut builder = ParamsBuilder::new();
    builder
        .m_cost(memory)
        .t_cost(iterations)
        .p_cost(params.parallelism)
        .output_len(32);
    if let Some(ad) = params.associated_data {
        let ad = AssociatedData::new(ad).map_err(|e| Error::KeyDerivation(e.to_string()))?;
        builder.data(ad);
    }
    let argon_params = builder
        .build()
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;

    let argon = match params.secret {
        Some(secret) => Argon2::new_with_secret(secret, variant.algorithm(), version, argon_params)
            .map_err(|e| Error::KeyDerivation(e.to_string()))?,
        None => Argon2::new(variant.algorithm(), version, argon_params),
    };

    let mut out = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(composite_key, salt, &mut out[..])
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_argon2(variant: Argon2Variant) -> KdfParameters {
        KdfParameters::Argon2 {
            variant,
            salt: vec![7u8; 32],
            memory_kib: 64,
            iterations: 2,
            parallelism: 2,
            version: ARGON2_VERSION_13,
            secret: None,
            associated_data: None,
        }
    }

    #[test]
    fn test_aes_kdf_deterministic() {
        let params = KdfParameters::AesKdf {
            seed: vec![1u8; 32],
            rounds: 100,
        };
        let token = CancellationToken::new();
        let a = params.transform_key(&[5u8; 32], &token).unwrap();
        let b = params.transform_key(&[5u8; 32], &token).unwrap();
        assert_eq!(*a, *b);

        let other = params.transform_key(&[6u8; 32], &token).unwrap();
        assert_ne!(*a, *other);
    }

    #[test]
    fn test_aes_kdf_zero_rounds_is_plain_hash() {
        let params = KdfParameters::AesKdf {
            seed: vec![1u8; 32],
            rounds: 0,
        };
        let out = params
            .transform_key(&[5u8; 32], &CancellationToken::new())
            .unwrap();
        assert_eq!(out.as_slice(), Sha256::digest([5u8; 32]).as_slice());
    }

    #[test]
    fn test_argon2_deterministic_per_variant() {
        let token = CancellationToken::new();
        let d = small_argon2(Argon2Variant::Argon2d);
        let id = small_argon2(Argon2Variant::Argon2id);

        let d1 = d.transform_key(&[9u8; 32], &token).unwrap();
        let d2 = d.transform_key(&[9u8; 32], &token).unwrap();
        let id1 = id.transform_key(&[9u8; 32], &token).unwrap();
        assert_eq!(*d1, *d2);
        assert_ne!(*d1, *id1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let params = KdfParameters::aes(1_000_000_000);
        assert_eq!(
            params.transform_key(&[0u8; 32], &token),
            Err(Error::CancellationRequested)
        );
    }

    #[test]
    fn test_cancelled_mid_loop() {
        let token = CancellationToken::new();
        let worker = token.clone();
        let handle = std::thread::spawn(move || {
            KdfParameters::aes(u64::MAX).transform_key(&[0u8; 32], &worker)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        token.cancel();
        assert!(matches!(
            handle.join().unwrap(),
            Err(Error::CancellationRequested)
        ));
    }

    #[test]
    fn test_variant_dictionary_mapping() {
        let aes = KdfParameters::aes(60_000);
        let back = KdfParameters::from_variant_dictionary(&aes.to_variant_dictionary()).unwrap();
        assert_eq!(back, aes);

        let mut argon = KdfParameters::argon2(Argon2Variant::Argon2id, 1024, 3, 4);
        if let KdfParameters::Argon2 { secret, .. } = &mut argon {
            *secret = Some(vec![1, 2, 3]);
        }
        let dict = argon.to_variant_dictionary();
        assert_eq!(dict.get_u64("M"), Some(1024 * 1024));
        let back = KdfParameters::from_variant_dictionary(&dict).unwrap();
        assert_eq!(back, argon);
    }

    #[test]
    fn test_argon2_memory_must_be_whole_kib() {
        let mut dict = KdfParameters::argon2(Argon2Variant::Argon2d, 1024, 2, 2).to_variant_dictionary();
        dict.set("M", VariantValue::UInt64(1024 * 1024 + 512));
        assert!(matches!(
            KdfParameters::from_variant_dictionary(&dict),
            Err(Error::InvalidHeaderField { field: "KdfParameters", .. })
        ));
    }

    #[test]
    fn test_unknown_kdf_uuid() {
        let mut dict = VariantDictionary::new();
        dict.set("$UUID", VariantValue::Bytes(vec![0xAA; 16]));
        let err = KdfParameters::from_variant_dictionary(&dict).unwrap_err();
        assert_eq!(err, Error::UnknownKdf(Uuid::from_bytes([0xAA; 16])));
    }

    #[test]
    fn test_reseed_changes_salt_only() {
        let mut params = KdfParameters::argon2(Argon2Variant::Argon2d, 1024, 2, 2);
        let before = params.clone();
        params.reseed();
        assert_ne!(params, before);
        assert_eq!(params.uuid(), before.uuid());
    }
}
