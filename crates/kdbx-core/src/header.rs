//! Outer and inner header codec
//!
//! The outer header is hashed into the integrity chain, so `serialize` must
//! reproduce the exact bytes `parse` consumed for canonically ordered input.

use crate::cipher::CipherSuite;
use crate::error::{Error, Result};
use crate::inner_stream::InnerStreamAlgorithm;
use crate::kdf::KdfParameters;
use crate::meta::Binary;
use crate::variant_dictionary::VariantDictionary;
use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SIGNATURE_1: u32 = 0x9AA2_D903;
pub const SIGNATURE_2: u32 = 0xB54B_FB67;
const SIGNATURE_2_KEEPASS1: u32 = 0xB54B_FB65;
const SIGNATURE_2_PRERELEASE: u32 = 0xB54B_FB66;

pub const VERSION_3_1: u32 = 0x0003_0001;
pub const VERSION_4: u32 = 0x0004_0000;
const VERSION_MAJOR_MASK: u32 = 0xFFFF_0000;

// Outer header field ids
const HEADER_END: u8 = 0;
const HEADER_COMMENT: u8 = 1;
const HEADER_CIPHER_ID: u8 = 2;
const HEADER_COMPRESSION_FLAGS: u8 = 3;
const HEADER_MASTER_SEED: u8 = 4;
const HEADER_TRANSFORM_SEED: u8 = 5;
const HEADER_TRANSFORM_ROUNDS: u8 = 6;
const HEADER_ENCRYPTION_IV: u8 = 7;
const HEADER_PROTECTED_STREAM_KEY: u8 = 8;
const HEADER_STREAM_START_BYTES: u8 = 9;
const HEADER_INNER_RANDOM_STREAM_ID: u8 = 10;
const HEADER_KDF_PARAMETERS: u8 = 11;
const HEADER_PUBLIC_CUSTOM_DATA: u8 = 12;

const HEADER_END_DATA: [u8; 4] = [0x0D, 0x0A, 0x0D, 0x0A];

// Inner header field types
const INNER_HEADER_END: u8 = 0;
const INNER_HEADER_STREAM_ID: u8 = 1;
const INNER_HEADER_STREAM_KEY: u8 = 2;
const INNER_HEADER_BINARY: u8 = 3;

const BINARY_FLAG_PROTECTED: u8 = 0x01;

pub const MASTER_SEED_LEN: usize = 32;
pub const STREAM_START_BYTES_LEN: usize = 32;

/// Major format generation; decides field widths and the integrity scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KdbxVersion {
    V3,
    V4,
}

impl KdbxVersion {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw & VERSION_MAJOR_MASK {
            0x0003_0000 => Ok(Self::V3),
            0x0004_0000 => Ok(Self::V4),
            _ => Err(Error::UnsupportedVersion(raw)),
        }
    }

    /// The raw version this crate writes for the generation
    pub fn raw(&self) -> u32 {
        match self {
            Self::V3 => VERSION_3_1,
            Self::V4 => VERSION_4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    fn from_flags(flags: u32) -> Result<Self> {
        match flags {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            other => Err(Error::InvalidHeaderField {
                field: "CompressionFlags",
                reason: format!("unknown algorithm {}", other),
            }),
        }
    }

    fn flags(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
        }
    }
}

/// Inner stream selection and key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct InnerStreamParams {
    #[zeroize(skip)]
    pub algorithm: InnerStreamAlgorithm,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for InnerStreamParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InnerStreamParams({:?}, ***)", self.algorithm)
    }
}

/// Everything the outer header declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFields {
    pub version: u32,
    pub cipher: CipherSuite,
    pub compression: Compression,
    pub master_seed: Vec<u8>,
    pub encryption_iv: Vec<u8>,
    pub kdf: KdfParameters,
    pub comment: Option<Vec<u8>>,
    pub public_custom_data: Option<VariantDictionary>,
    /// 3.x only
    pub stream_start_bytes: Option<Vec<u8>>,
    /// 3.x only; 4.x keeps it in the inner header
    pub inner_stream: Option<InnerStreamParams>,
    /// Fields with ids this crate does not interpret, in file order
    pub unknown_fields: Vec<(u8, Vec<u8>)>,
}

impl HeaderFields {
    pub fn kdbx_version(&self) -> Result<KdbxVersion> {
        KdbxVersion::from_raw(self.version)
    }

    /// Parse the outer header; returns the fields and the header length
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 12 {
            return Err(Error::TruncatedHeader("file shorter than the signature".to_string()));
        }
        let sig1 = LittleEndian::read_u32(&data[0..4]);
        let sig2 = LittleEndian::read_u32(&data[4..8]);
        let version = LittleEndian::read_u32(&data[8..12]);

        if sig1 != SIGNATURE_1 {
            return Err(Error::MalformedSignature);
        }
        match sig2 {
            SIGNATURE_2 => {}
            SIGNATURE_2_KEEPASS1 | SIGNATURE_2_PRERELEASE => {
                return Err(Error::UnsupportedVersion(version))
            }
            _ => return Err(Error::MalformedSignature),
        }
        let kdbx_version = KdbxVersion::from_raw(version)?;

        let mut pos = 12;
        let mut raw = RawFields::default();
        loop {
            let (id, field) = read_field(data, &mut pos, kdbx_version)?;
            match id {
                HEADER_END => break,
                HEADER_COMMENT => raw.comment = Some(field.to_vec()),
                HEADER_CIPHER_ID => {
                    let uuid = Uuid::from_slice(field).map_err(|_| Error::InvalidHeaderField {
                        field: "CipherID",
                        reason: format!("{} bytes", field.len()),
                    })?;
                    raw.cipher = Some(CipherSuite::from_uuid(&uuid)?);
                }
                HEADER_COMPRESSION_FLAGS => {
                    raw.compression = Some(Compression::from_flags(read_u32(field, "CompressionFlags")?)?)
                }
                HEADER_MASTER_SEED => {
                    if field.len() != MASTER_SEED_LEN {
                        return Err(Error::InvalidHeaderField {
                            field: "MasterSeed",
                            reason: format!("{} bytes", field.len()),
                        });
                    }
                    raw.master_seed = Some(field.to_vec());
                }
                HEADER_TRANSFORM_SEED => raw.transform_seed = Some(field.to_vec()),
                HEADER_TRANSFORM_ROUNDS => {
                    raw.transform_rounds = Some(read_u64(field, "TransformRounds")?)
                }
                HEADER_ENCRYPTION_IV => raw.encryption_iv = Some(field.to_vec()),
                HEADER_PROTECTED_STREAM_KEY => raw.stream_key = Some(field.to_vec()),
                HEADER_STREAM_START_BYTES => raw.stream_start_bytes = Some(field.to_vec()),
                HEADER_INNER_RANDOM_STREAM_ID => {
                    raw.stream_id = Some(read_u32(field, "InnerRandomStreamID")?)
                }
                HEADER_KDF_PARAMETERS => {
                    let dict = VariantDictionary::parse(field)?;
                    raw.kdf = Some(KdfParameters::from_variant_dictionary(&dict)?);
                }
                HEADER_PUBLIC_CUSTOM_DATA => {
                    raw.public_custom_data = Some(VariantDictionary::parse(field)?)
                }
                other => {
                    tracing::warn!(field_id = other, "Keeping unknown header field");
                    raw.unknown_fields.push((other, field.to_vec()));
                }
            }
        }

        let fields = raw.finish(version, kdbx_version)?;
        Ok((fields, pos))
    }

    /// Serialize in the canonical field order for the version
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let kdbx_version = self.kdbx_version()?;
        let mut out = Vec::new();
        out.extend_from_slice(&SIGNATURE_1.to_le_bytes());
        out.extend_from_slice(&SIGNATURE_2.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());

        if let Some(comment) = &self.comment {
            write_field(&mut out, kdbx_version, HEADER_COMMENT, comment)?;
        }
        write_field(&mut out, kdbx_version, HEADER_CIPHER_ID, self.cipher.uuid().as_bytes())?;
        write_field(
            &mut out,
            kdbx_version,
            HEADER_COMPRESSION_FLAGS,
            &self.compression.flags().to_le_bytes(),
        )?;
        write_field(&mut out, kdbx_version, HEADER_MASTER_SEED, &self.master_seed)?;

        match (kdbx_version, &self.kdf) {
            (KdbxVersion::V3, KdfParameters::AesKdf { seed, rounds }) => {
                write_field(&mut out, kdbx_version, HEADER_TRANSFORM_SEED, seed)?;
                write_field(
                    &mut out,
                    kdbx_version,
                    HEADER_TRANSFORM_ROUNDS,
                    &rounds.to_le_bytes(),
                )?;
            }
            (KdbxVersion::V3, _) => {
                return Err(Error::InvalidHeaderField {
                    field: "KdfParameters",
                    reason: "KDBX 3.x only supports AES-KDF".to_string(),
                })
            }
            (KdbxVersion::V4, kdf) => {
                let dict = kdf.to_variant_dictionary().serialize();
                write_field(&mut out, kdbx_version, HEADER_KDF_PARAMETERS, &dict)?;
            }
        }

        write_field(&mut out, kdbx_version, HEADER_ENCRYPTION_IV, &self.encryption_iv)?;

        if kdbx_version == KdbxVersion::V3 {
            let stream = self
                .inner_stream
                .as_ref()
                .ok_or(Error::MissingHeaderField("ProtectedStreamKey"))?;
            let start = self
                .stream_start_bytes
                .as_ref()
                .ok_or(Error::MissingHeaderField("StreamStartBytes"))?;
            write_field(&mut out, kdbx_version, HEADER_PROTECTED_STREAM_KEY, &stream.key)?;
            write_field(&mut out, kdbx_version, HEADER_STREAM_START_BYTES, start)?;
            write_field(
                &mut out,
                kdbx_version,
                HEADER_INNER_RANDOM_STREAM_ID,
                &stream.algorithm.id().to_le_bytes(),
            )?;
        } else if let Some(custom) = &self.public_custom_data {
            write_field(&mut out, kdbx_version, HEADER_PUBLIC_CUSTOM_DATA, &custom.serialize())?;
        }
        for (id, data) in &self.unknown_fields {
            write_field(&mut out, kdbx_version, *id, data)?;
        }

        write_field(&mut out, kdbx_version, HEADER_END, &HEADER_END_DATA)?;
        Ok(out)
    }
}

#[derive(Default)]
struct RawFields {
    comment: Option<Vec<u8>>,
    cipher: Option<CipherSuite>,
    compression: Option<Compression>,
    master_seed: Option<Vec<u8>>,
    transform_seed: Option<Vec<u8>>,
    transform_rounds: Option<u64>,
    encryption_iv: Option<Vec<u8>>,
    stream_key: Option<Vec<u8>>,
    stream_start_bytes: Option<Vec<u8>>,
    stream_id: Option<u32>,
    kdf: Option<KdfParameters>,
    public_custom_data: Option<VariantDictionary>,
    unknown_fields: Vec<(u8, Vec<u8>)>,
}

impl RawFields {
    fn finish(self, version: u32, kdbx_version: KdbxVersion) -> Result<HeaderFields> {
        let cipher = self.cipher.ok_or(Error::MissingHeaderField("CipherID"))?;
        let compression = self
            .compression
            .ok_or(Error::MissingHeaderField("CompressionFlags"))?;
        let master_seed = self.master_seed.ok_or(Error::MissingHeaderField("MasterSeed"))?;
        let encryption_iv = self
            .encryption_iv
            .ok_or(Error::MissingHeaderField("EncryptionIV"))?;
        if encryption_iv.len() != cipher.iv_len() {
            return Err(Error::InvalidHeaderField {
                field: "EncryptionIV",
                reason: format!(
                    "{:?} needs {} bytes, got {}",
                    cipher,
                    cipher.iv_len(),
                    encryption_iv.len()
                ),
            });
        }

        let (kdf, stream_start_bytes, inner_stream) = match kdbx_version {
            KdbxVersion::V3 => {
                let seed = self
                    .transform_seed
                    .ok_or(Error::MissingHeaderField("TransformSeed"))?;
                let rounds = self
                    .transform_rounds
                    .ok_or(Error::MissingHeaderField("TransformRounds"))?;
                let start = self
                    .stream_start_bytes
                    .ok_or(Error::MissingHeaderField("StreamStartBytes"))?;
                let key = self
                    .stream_key
                    .ok_or(Error::MissingHeaderField("ProtectedStreamKey"))?;
                let id = self
                    .stream_id
                    .ok_or(Error::MissingHeaderField("InnerRandomStreamID"))?;
                let stream = InnerStreamParams {
                    algorithm: InnerStreamAlgorithm::from_id(id)?,
                    key,
                };
                (KdfParameters::AesKdf { seed, rounds }, Some(start), Some(stream))
            }
            KdbxVersion::V4 => {
                let kdf = self.kdf.ok_or(Error::MissingHeaderField("KdfParameters"))?;
                (kdf, None, None)
            }
        };

        Ok(HeaderFields {
            version,
            cipher,
            compression,
            master_seed,
            encryption_iv,
            kdf,
            comment: self.comment,
            public_custom_data: self.public_custom_data,
            stream_start_bytes,
            inner_stream,
            unknown_fields: self.unknown_fields,
        })
    }
}

fn read_field<'a>(data: &'a [u8], pos: &mut usize, version: KdbxVersion) -> Result<(u8, &'a [u8])> {
    let size_width = match version {
        KdbxVersion::V3 => 2,
        KdbxVersion::V4 => 4,
    };
    if *pos + 1 + size_width > data.len() {
        return Err(Error::TruncatedHeader(format!("field header at offset {}", pos)));
    }
    let id = data[*pos];
    let len = match version {
        KdbxVersion::V3 => LittleEndian::read_u16(&data[*pos + 1..*pos + 3]) as usize,
        KdbxVersion::V4 => LittleEndian::read_u32(&data[*pos + 1..*pos + 5]) as usize,
    };
    *pos += 1 + size_width;
    if *pos + len > data.len() {
        return Err(Error::TruncatedHeader(format!(
            "field {} needs {} bytes at offset {}",
            id, len, pos
        )));
    }
    let field = &data[*pos..*pos + len];
    *pos += len;
    Ok((id, field))
}

fn write_field(out: &mut Vec<u8>, version: KdbxVersion, id: u8, data: &[u8]) -> Result<()> {
    out.push(id);
    match version {
        KdbxVersion::V3 => {
            let len = u16::try_from(data.len()).map_err(|_| Error::InvalidHeaderField {
                field: "header",
                reason: format!("field {} too large for KDBX 3.x", id),
            })?;
            out.extend_from_slice(&len.to_le_bytes());
        }
        KdbxVersion::V4 => out.extend_from_slice(&(data.len() as u32).to_le_bytes()),
    }
    out.extend_from_slice(data);
    Ok(())
}

fn read_u32(field: &[u8], name: &'static str) -> Result<u32> {
    if field.len() != 4 {
        return Err(Error::InvalidHeaderField {
            field: name,
            reason: format!("expected 4 bytes, got {}", field.len()),
        });
    }
    Ok(LittleEndian::read_u32(field))
}

fn read_u64(field: &[u8], name: &'static str) -> Result<u64> {
    if field.len() != 8 {
        return Err(Error::InvalidHeaderField {
            field: name,
            reason: format!("expected 8 bytes, got {}", field.len()),
        });
    }
    Ok(LittleEndian::read_u64(field))
}

/// Decrypted prefix of a 4.x payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerHeader {
    pub inner_stream: InnerStreamParams,
    pub binaries: Vec<Binary>,
}

impl InnerHeader {
    /// Parse the inner header; returns it and the offset of the XML
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0;
        let mut stream_id = None;
        let mut stream_key = None;
        let mut binaries = Vec::new();

        loop {
            if pos + 5 > data.len() {
                return Err(Error::TruncatedHeader("inner header".to_string()));
            }
            let field_id = data[pos];
            let field_len = LittleEndian::read_u32(&data[pos + 1..pos + 5]) as usize;
            pos += 5;
            if pos + field_len > data.len() {
                return Err(Error::TruncatedHeader("inner header field".to_string()));
            }
            let field = &data[pos..pos + field_len];
            pos += field_len;

            match field_id {
                INNER_HEADER_END => break,
                INNER_HEADER_STREAM_ID => {
                    stream_id = Some(read_u32(field, "InnerRandomStreamID")?);
                }
                INNER_HEADER_STREAM_KEY => stream_key = Some(field.to_vec()),
                INNER_HEADER_BINARY => {
                    let Some((&flags, content)) = field.split_first() else {
                        return Err(Error::InvalidHeaderField {
                            field: "Binary",
                            reason: "missing flags byte".to_string(),
                        });
                    };
                    binaries.push(Binary {
                        data: content.to_vec(),
                        protected: flags & BINARY_FLAG_PROTECTED != 0,
                    });
                }
                other => tracing::warn!(field_id = other, "Skipping unknown inner header field"),
            }
        }

        let id = stream_id.ok_or(Error::MissingHeaderField("InnerRandomStreamID"))?;
        let key = stream_key.ok_or(Error::MissingHeaderField("InnerRandomStreamKey"))?;
        Ok((
            Self {
                inner_stream: InnerStreamParams {
                    algorithm: InnerStreamAlgorithm::from_id(id)?,
                    key,
                },
                binaries,
            },
            pos,
        ))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_inner(
            &mut out,
            INNER_HEADER_STREAM_ID,
            &self.inner_stream.algorithm.id().to_le_bytes(),
        );
        push_inner(&mut out, INNER_HEADER_STREAM_KEY, &self.inner_stream.key);
        for binary in &self.binaries {
            let mut content = Vec::with_capacity(binary.data.len() + 1);
            content.push(if binary.protected { BINARY_FLAG_PROTECTED } else { 0 });
            content.extend_from_slice(&binary.data);
            push_inner(&mut out, INNER_HEADER_BINARY, &content);
        }
        push_inner(&mut out, INNER_HEADER_END, &[]);
        out
    }
}

fn push_inner(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    out.push(id);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::Argon2Variant;

    fn v3_header() -> HeaderFields {
        HeaderFields {
            version: VERSION_3_1,
            cipher: CipherSuite::Aes256Cbc,
            compression: Compression::Gzip,
            master_seed: vec![1u8; 32],
            encryption_iv: vec![2u8; 16],
            kdf: KdfParameters::AesKdf {
                seed: vec![3u8; 32],
                rounds: 6000,
            },
            comment: None,
            public_custom_data: None,
            stream_start_bytes: Some(vec![4u8; 32]),
            inner_stream: Some(InnerStreamParams {
                algorithm: InnerStreamAlgorithm::Salsa20,
                key: vec![5u8; 32],
            }),
            unknown_fields: Vec::new(),
        }
    }

    fn v4_header() -> HeaderFields {
        HeaderFields {
            version: VERSION_4,
            cipher: CipherSuite::ChaCha20,
            compression: Compression::None,
            master_seed: vec![1u8; 32],
            encryption_iv: vec![2u8; 12],
            kdf: KdfParameters::argon2(Argon2Variant::Argon2d, 1024, 2, 2),
            comment: None,
            public_custom_data: None,
            stream_start_bytes: None,
            inner_stream: None,
            unknown_fields: Vec::new(),
        }
    }

    #[test]
    fn test_v3_bytes_reproduce() {
        let header = v3_header();
        let bytes = header.serialize().unwrap();
        let (parsed, len) = HeaderFields::parse(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed, header);
        assert_eq!(parsed.serialize().unwrap(), bytes);
        // u16 field sizes: id + 2 byte length
        assert_eq!(&bytes[12..15], &[HEADER_CIPHER_ID, 16, 0]);
    }

    #[test]
    fn test_v4_bytes_reproduce() {
        let mut header = v4_header();
        let mut custom = VariantDictionary::new();
        custom.set("plugin", crate::variant_dictionary::VariantValue::Bool(true));
        header.public_custom_data = Some(custom);

        let bytes = header.serialize().unwrap();
        let (parsed, len) = HeaderFields::parse(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed, header);
        assert_eq!(parsed.serialize().unwrap(), bytes);
    }

    #[test]
    fn test_unknown_fields_are_kept() {
        for mut header in [v3_header(), v4_header()] {
            header.unknown_fields = vec![(42, vec![1, 2, 3]), (17, Vec::new())];
            let bytes = header.serialize().unwrap();
            let (parsed, _) = HeaderFields::parse(&bytes).unwrap();
            assert_eq!(parsed.unknown_fields, header.unknown_fields);
            assert_eq!(parsed.serialize().unwrap(), bytes);
        }
    }

    #[test]
    fn test_header_followed_by_body() {
        let mut bytes = v3_header().serialize().unwrap();
        let header_len = bytes.len();
        bytes.extend_from_slice(b"ciphertext");
        let (_, len) = HeaderFields::parse(&bytes).unwrap();
        assert_eq!(len, header_len);
    }

    #[test]
    fn test_bad_signature() {
        let mut bytes = v3_header().serialize().unwrap();
        bytes[0] ^= 0xFF;
        assert_eq!(HeaderFields::parse(&bytes), Err(Error::MalformedSignature));
    }

    #[test]
    fn test_old_and_future_versions() {
        let mut bytes = v3_header().serialize().unwrap();
        bytes[4..8].copy_from_slice(&SIGNATURE_2_KEEPASS1.to_le_bytes());
        assert!(matches!(HeaderFields::parse(&bytes), Err(Error::UnsupportedVersion(_))));

        let mut bytes = v4_header().serialize().unwrap();
        bytes[8..12].copy_from_slice(&0x0005_0000u32.to_le_bytes());
        assert_eq!(
            HeaderFields::parse(&bytes),
            Err(Error::UnsupportedVersion(0x0005_0000))
        );
    }

    #[test]
    fn test_truncated() {
        let bytes = v4_header().serialize().unwrap();
        for cut in [5, 12, 20, bytes.len() - 1] {
            assert!(
                matches!(HeaderFields::parse(&bytes[..cut]), Err(Error::TruncatedHeader(_))),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_unknown_cipher() {
        let mut bytes = v3_header().serialize().unwrap();
        // cipher uuid starts after signature(8) + version(4) + id(1) + len(2)
        bytes[15] ^= 0xFF;
        assert!(matches!(HeaderFields::parse(&bytes), Err(Error::UnknownCipher(_))));
    }

    #[test]
    fn test_missing_field() {
        let mut header = v3_header();
        header.stream_start_bytes = None;
        assert_eq!(
            header.serialize(),
            Err(Error::MissingHeaderField("StreamStartBytes"))
        );
    }

    #[test]
    fn test_iv_must_match_cipher() {
        let mut header = v4_header();
        header.encryption_iv = vec![0u8; 16];
        let bytes = header.serialize().unwrap();
        assert!(matches!(
            HeaderFields::parse(&bytes),
            Err(Error::InvalidHeaderField { field: "EncryptionIV", .. })
        ));
    }

    #[test]
    fn test_v3_rejects_argon2() {
        let mut header = v3_header();
        header.kdf = KdfParameters::argon2(Argon2Variant::Argon2id, 1024, 2, 2);
        assert!(header.serialize().is_err());
    }

    #[test]
    fn test_inner_header() {
        let inner = InnerHeader {
            inner_stream: InnerStreamParams {
                algorithm: InnerStreamAlgorithm::ChaCha20,
                key: vec![8u8; 64],
            },
            binaries: vec![
                Binary {
                    data: b"attachment".to_vec(),
                    protected: true,
                },
                Binary {
                    data: Vec::new(),
                    protected: false,
                },
            ],
        };
        let mut bytes = inner.serialize();
        let xml_start = bytes.len();
        bytes.extend_from_slice(b"<KeePassFile/>");

        let (parsed, pos) = InnerHeader::parse(&bytes).unwrap();
        assert_eq!(pos, xml_start);
        assert_eq!(parsed, inner);
    }
}
