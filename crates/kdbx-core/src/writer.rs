//! Serialize a document into an encrypted KDBX file

use crate::blocks::{gzip_compress, header_hmac, write_hashed_blocks, write_hmac_blocks};
use crate::cancel::CancellationToken;
use crate::cipher::CipherSuite;
use crate::database::KdbxDocument;
use crate::error::Result;
use crate::header::{
    Compression, HeaderFields, InnerHeader, InnerStreamParams, KdbxVersion, MASTER_SEED_LEN,
    STREAM_START_BYTES_LEN,
};
use crate::inner_stream::{InnerRandomStream, InnerStreamAlgorithm};
use crate::kdf::{
    Argon2Variant, KdfParameters, DEFAULT_ARGON2_ITERATIONS, DEFAULT_ARGON2_MEMORY_KIB,
    DEFAULT_ARGON2_PARALLELISM,
};
use crate::key::{CompositeKey, DerivedKey};
use crate::random_bytes;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Algorithms and costs for a save; seeds and IVs are drawn fresh on every write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSettings {
    pub cipher: CipherSuite,
    pub compression: Compression,
    pub inner_stream: InnerStreamAlgorithm,
    pub kdf: KdfParameters,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            cipher: CipherSuite::Aes256Cbc,
            compression: Compression::Gzip,
            inner_stream: InnerStreamAlgorithm::ChaCha20,
            kdf: KdfParameters::argon2(
                Argon2Variant::Argon2d,
                DEFAULT_ARGON2_MEMORY_KIB,
                DEFAULT_ARGON2_ITERATIONS,
                DEFAULT_ARGON2_PARALLELISM,
            ),
        }
    }
}

impl WriterSettings {
    /// Reuse the algorithms of a file that was read.
    ///
    /// 4.x headers do not name the inner stream, so `inner_stream` supplies it
    /// when the header has none.
    pub fn from_header(header: &HeaderFields, inner_stream: InnerStreamAlgorithm) -> Self {
        Self {
            cipher: header.cipher,
            compression: header.compression,
            inner_stream: header
                .inner_stream
                .as_ref()
                .map(|s| s.algorithm)
                .unwrap_or(inner_stream),
            kdf: header.kdf.clone(),
        }
    }

    /// 3.1 can only express AES, AES-KDF and the older inner streams
    pub fn version(&self) -> KdbxVersion {
        if self.cipher == CipherSuite::ChaCha20
            || self.inner_stream == InnerStreamAlgorithm::ChaCha20
            || !self.kdf.is_aes()
        {
            KdbxVersion::V4
        } else {
            KdbxVersion::V3
        }
    }
}

/// Progress of one save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Start,
    DocumentSerialized,
    Compressed,
    BlocksHashed,
    BodyEncrypted,
    HeaderWritten,
}

pub struct KdbxWriter {
    settings: WriterSettings,
    state: WriterState,
}

impl KdbxWriter {
    pub fn new(settings: WriterSettings) -> Self {
        Self {
            settings,
            state: WriterState::Start,
        }
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    fn advance(&mut self, state: WriterState) {
        tracing::debug!(from = ?self.state, to = ?state, "Writer state");
        self.state = state;
    }

    /// Produce the complete file bytes for `document`
    pub fn write(
        &mut self,
        document: &KdbxDocument,
        key: &CompositeKey,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.state = WriterState::Start;
        let version = self.settings.version();
        let cipher = self.settings.cipher;

        let mut kdf = self.settings.kdf.clone();
        kdf.reseed();
        let master_seed = random_bytes(MASTER_SEED_LEN);
        let stream_params = InnerStreamParams {
            algorithm: self.settings.inner_stream,
            key: random_bytes(self.settings.inner_stream.key_len()),
        };
        let stream_start_bytes = random_bytes(STREAM_START_BYTES_LEN);

        let header = HeaderFields {
            version: version.raw(),
            cipher,
            compression: self.settings.compression,
            master_seed,
            encryption_iv: random_bytes(cipher.iv_len()),
            kdf,
            comment: None,
            public_custom_data: None,
            stream_start_bytes: (version == KdbxVersion::V3).then(|| stream_start_bytes.clone()),
            inner_stream: (version == KdbxVersion::V3).then(|| stream_params.clone()),
            unknown_fields: Vec::new(),
        };
        let header_bytes = header.serialize()?;

        tracing::info!(
            ?version,
            ?cipher,
            kdf = %header.kdf.uuid(),
            compression = ?header.compression,
            inner_stream = ?stream_params.algorithm,
            "Writing database"
        );

        let transformed = header.kdf.transform_key(&key.raw_key(), cancel)?;
        let derived = DerivedKey::derive(&header.master_seed, &transformed);

        let mut stream = InnerRandomStream::new(stream_params.algorithm, &stream_params.key)?;
        let mut payload = Zeroizing::new(Vec::new());
        match version {
            KdbxVersion::V3 => {
                let header_hash = Sha256::digest(&header_bytes);
                payload.extend(document.to_xml(version, &mut stream, Some(header_hash.as_slice()))?);
            }
            KdbxVersion::V4 => {
                let inner = InnerHeader {
                    inner_stream: stream_params.clone(),
                    binaries: document.binaries.clone(),
                };
                payload.extend(inner.serialize());
                payload.extend(document.to_xml(version, &mut stream, None)?);
            }
        }
        self.advance(WriterState::DocumentSerialized);

        cancel.check()?;
        let payload = match header.compression {
            Compression::Gzip => Zeroizing::new(gzip_compress(&payload)?),
            Compression::None => payload,
        };
        self.advance(WriterState::Compressed);

        let mut out = header_bytes.clone();
        match version {
            KdbxVersion::V3 => {
                let mut plain = Zeroizing::new(stream_start_bytes);
                plain.extend(write_hashed_blocks(&payload, cancel)?);
                self.advance(WriterState::BlocksHashed);

                let ciphertext =
                    cipher.encrypt(derived.cipher_key(), &header.encryption_iv, &plain)?;
                self.advance(WriterState::BodyEncrypted);
                out.extend_from_slice(&ciphertext);
            }
            KdbxVersion::V4 => {
                let ciphertext =
                    cipher.encrypt(derived.cipher_key(), &header.encryption_iv, &payload)?;
                self.advance(WriterState::BodyEncrypted);

                out.extend_from_slice(&Sha256::digest(&header_bytes));
                out.extend_from_slice(&header_hmac(&header_bytes, derived.hmac_key())?);
                out.extend(write_hmac_blocks(&ciphertext, derived.hmac_key(), cancel)?);
                self.advance(WriterState::BlocksHashed);
            }
        }
        self.advance(WriterState::HeaderWritten);

        tracing::info!(bytes = out.len(), "Database written");
        Ok(out)
    }
}

/// Write `document` with `settings` in one call
pub fn save(document: &KdbxDocument, key: &CompositeKey, settings: WriterSettings) -> Result<Vec<u8>> {
    KdbxWriter::new(settings).write(document, key, &CancellationToken::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_version_selection() {
        let mut settings = WriterSettings {
            cipher: CipherSuite::Aes256Cbc,
            compression: Compression::Gzip,
            inner_stream: InnerStreamAlgorithm::Salsa20,
            kdf: KdfParameters::aes(100),
        };
        assert_eq!(settings.version(), KdbxVersion::V3);

        settings.cipher = CipherSuite::ChaCha20;
        assert_eq!(settings.version(), KdbxVersion::V4);

        settings.cipher = CipherSuite::Aes256Cbc;
        settings.inner_stream = InnerStreamAlgorithm::ChaCha20;
        assert_eq!(settings.version(), KdbxVersion::V4);

        settings.inner_stream = InnerStreamAlgorithm::Salsa20;
        settings.kdf = KdfParameters::argon2(Argon2Variant::Argon2id, 64, 1, 1);
        assert_eq!(settings.version(), KdbxVersion::V4);
    }

    #[test]
    fn test_write_reaches_final_state_with_fresh_seeds() {
        let document = KdbxDocument::new("Root");
        let key = CompositeKey::from_password("pw");
        let settings = WriterSettings {
            cipher: CipherSuite::Aes256Cbc,
            compression: Compression::None,
            inner_stream: InnerStreamAlgorithm::Salsa20,
            kdf: KdfParameters::aes(10),
        };
        let mut writer = KdbxWriter::new(settings);
        let first = writer.write(&document, &key, &CancellationToken::new()).unwrap();
        assert_eq!(writer.state(), WriterState::HeaderWritten);
        let second = writer.write(&document, &key, &CancellationToken::new()).unwrap();
        assert_ne!(first, second);

        let (header, _) = HeaderFields::parse(&first).unwrap();
        assert_eq!(header.kdbx_version().unwrap(), KdbxVersion::V3);
        assert_eq!(header.compression, Compression::None);
    }

    #[test]
    fn test_write_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let mut writer = KdbxWriter::new(WriterSettings {
            kdf: KdfParameters::aes(10),
            ..WriterSettings::default()
        });
        let result = writer.write(&KdbxDocument::new("Root"), &CompositeKey::from_password("pw"), &token);
        assert_eq!(result, Err(Error::CancellationRequested));
        assert_eq!(writer.state(), WriterState::Start);
    }
}
