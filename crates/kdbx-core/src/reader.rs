//! Decode an encrypted KDBX file into a document

use crate::blocks::{
    first_hmac_block_verifies, gzip_decompress, read_hashed_blocks, read_hmac_blocks,
    verify_header_hmac,
};
use crate::cancel::CancellationToken;
use crate::database::KdbxDocument;
use crate::error::{Error, Result};
use crate::header::{
    Compression, HeaderFields, InnerHeader, InnerStreamParams, KdbxVersion, STREAM_START_BYTES_LEN,
};
use crate::inner_stream::{InnerRandomStream, InnerStreamAlgorithm};
use crate::key::{CompositeKey, DerivedKey};
use crate::meta::Binary;
use crate::writer::WriterSettings;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const HEADER_SHA_LEN: usize = 32;
const HEADER_HMAC_LEN: usize = 32;

/// Progress of one read. A reader only moves forward; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Start,
    HeaderParsed,
    KeyDerived,
    BodyDecrypted,
    Decompressed,
    DocumentParsed,
    Failed,
}

/// Single-use reader: construct a new one for every attempt.
pub struct KdbxReader {
    state: ReaderState,
    header: Option<HeaderFields>,
    header_len: usize,
    inner_stream: Option<InnerStreamAlgorithm>,
}

impl Default for KdbxReader {
    fn default() -> Self {
        Self::new()
    }
}

impl KdbxReader {
    pub fn new() -> Self {
        Self {
            state: ReaderState::Start,
            header: None,
            header_len: 0,
            inner_stream: None,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// The parsed outer header, once available
    pub fn header(&self) -> Option<&HeaderFields> {
        self.header.as_ref()
    }

    /// Settings that re-save with the algorithms of the file that was read
    pub fn writer_settings(&self) -> Option<WriterSettings> {
        let header = self.header.as_ref()?;
        let inner_stream = self.inner_stream.unwrap_or(InnerStreamAlgorithm::ChaCha20);
        Some(WriterSettings::from_header(header, inner_stream))
    }

    fn advance(&mut self, state: ReaderState) {
        tracing::debug!(from = ?self.state, to = ?state, "Reader state");
        self.state = state;
    }

    fn fail<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            tracing::warn!(state = ?self.state, error = %err, "Read failed");
            self.state = ReaderState::Failed;
        }
        result
    }

    /// Parse and keep the outer header without touching credentials
    pub fn read_header(&mut self, data: &[u8]) -> Result<&HeaderFields> {
        if self.state != ReaderState::Start {
            return Err(Error::ReaderFailed);
        }
        let parsed = HeaderFields::parse(data);
        let (header, header_len) = self.fail(parsed)?;
        tracing::info!(
            version = format_args!("{:#010x}", header.version),
            cipher = ?header.cipher,
            kdf = %header.kdf.uuid(),
            compression = ?header.compression,
            header_len,
            "Parsed header"
        );
        self.header_len = header_len;
        self.advance(ReaderState::HeaderParsed);
        Ok(self.header.insert(header))
    }

    /// Run the whole pipeline over `data`, reading the header first if needed
    pub fn decrypt_document(
        &mut self,
        data: &[u8],
        key: &CompositeKey,
        cancel: &CancellationToken,
    ) -> Result<KdbxDocument> {
        if self.state == ReaderState::Start {
            self.read_header(data)?;
        }
        if self.state != ReaderState::HeaderParsed {
            return Err(Error::ReaderFailed);
        }
        let result = self.decrypt_body(data, key, cancel);
        self.fail(result)
    }

    fn decrypt_body(
        &mut self,
        data: &[u8],
        key: &CompositeKey,
        cancel: &CancellationToken,
    ) -> Result<KdbxDocument> {
        let header = self.header.clone().ok_or(Error::ReaderFailed)?;
        let version = header.kdbx_version()?;
        let header_len = self.header_len;
        if data.len() < header_len {
            return Err(Error::TruncatedHeader("shorter than the parsed header".to_string()));
        }
        let header_bytes = &data[..header_len];

        let transformed = header.kdf.transform_key(&key.raw_key(), cancel)?;
        let derived = DerivedKey::derive(&header.master_seed, &transformed);
        self.advance(ReaderState::KeyDerived);

        let payload = match version {
            KdbxVersion::V3 => self.decrypt_v3(&header, &derived, &data[header_len..], cancel)?,
            KdbxVersion::V4 => {
                self.decrypt_v4(&header, header_bytes, &derived, &data[header_len..], cancel)?
            }
        };

        cancel.check()?;
        let payload = match header.compression {
            Compression::Gzip => gzip_decompress(&payload)?,
            Compression::None => payload,
        };
        self.advance(ReaderState::Decompressed);

        let (stream_params, xml, binaries) = match version {
            KdbxVersion::V3 => {
                let params = header
                    .inner_stream
                    .clone()
                    .ok_or(Error::MissingHeaderField("InnerRandomStreamID"))?;
                (params, &payload[..], Vec::new())
            }
            KdbxVersion::V4 => {
                let (inner, offset) = InnerHeader::parse(&payload)?;
                let InnerHeader {
                    inner_stream,
                    binaries,
                } = inner;
                (inner_stream, &payload[offset..], binaries)
            }
        };
        let document = parse_document(version, &stream_params, xml, binaries, header_bytes)?;
        self.inner_stream = Some(stream_params.algorithm);
        self.advance(ReaderState::DocumentParsed);

        tracing::info!(
            groups = document.groups().count(),
            entries = document.entries().count(),
            "Database opened"
        );
        Ok(document)
    }

    /// Decrypt, check the stream start bytes, then verify the hashed blocks
    fn decrypt_v3(
        &mut self,
        header: &HeaderFields,
        derived: &DerivedKey,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let expected = header
            .stream_start_bytes
            .as_ref()
            .ok_or(Error::MissingHeaderField("StreamStartBytes"))?;

        let plain = Zeroizing::new(header.cipher.decrypt_raw(
            derived.cipher_key(),
            &header.encryption_iv,
            body,
        )?);
        if plain.len() < STREAM_START_BYTES_LEN || plain[..STREAM_START_BYTES_LEN] != expected[..] {
            return Err(Error::LikelyWrongCredentials);
        }
        // The key is right, so bad padding can only mean a damaged body
        let blocks = header
            .cipher
            .unpad(&plain)
            .and_then(|body| body.get(STREAM_START_BYTES_LEN..))
            .ok_or_else(|| Error::IntegrityCheckFailed("invalid padding".to_string()))?;
        self.advance(ReaderState::BodyDecrypted);

        read_hashed_blocks(blocks, cancel)
    }

    /// Check header hash and HMAC, verify the HMAC blocks, then decrypt
    fn decrypt_v4(
        &mut self,
        header: &HeaderFields,
        header_bytes: &[u8],
        derived: &DerivedKey,
        rest: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if rest.len() < HEADER_SHA_LEN + HEADER_HMAC_LEN {
            return Err(Error::TruncatedHeader("header hash and HMAC".to_string()));
        }
        let (stored_sha, rest) = rest.split_at(HEADER_SHA_LEN);
        let (stored_hmac, blocks) = rest.split_at(HEADER_HMAC_LEN);

        if Sha256::digest(header_bytes).as_slice() != stored_sha {
            return Err(Error::IntegrityCheckFailed("header SHA-256 mismatch".to_string()));
        }
        if !verify_header_hmac(header_bytes, stored_hmac, derived.hmac_key())? {
            // with the right key the first block still authenticates
            if first_hmac_block_verifies(blocks, derived.hmac_key())? {
                return Err(Error::IntegrityCheckFailed("header HMAC mismatch".to_string()));
            }
            return Err(Error::LikelyWrongCredentials);
        }

        let ciphertext = read_hmac_blocks(blocks, derived.hmac_key(), cancel)?;
        let plain = header
            .cipher
            .decrypt(derived.cipher_key(), &header.encryption_iv, &ciphertext)?;
        self.advance(ReaderState::BodyDecrypted);
        Ok(plain)
    }
}

fn parse_document(
    version: KdbxVersion,
    stream_params: &InnerStreamParams,
    xml: &[u8],
    binaries: Vec<Binary>,
    header_bytes: &[u8],
) -> Result<KdbxDocument> {
    let mut stream = InnerRandomStream::new(stream_params.algorithm, &stream_params.key)?;
    let (document, header_hash) = KdbxDocument::from_xml(xml, version, &mut stream, binaries)?;

    if let Some(stored) = header_hash {
        if version < KdbxVersion::V4 && Sha256::digest(header_bytes).as_slice() != stored.as_slice() {
            return Err(Error::BadHeaderHash);
        }
    }
    Ok(document)
}

/// Open `data` with `key` in one call
pub fn open(data: &[u8], key: &CompositeKey) -> Result<KdbxDocument> {
    KdbxReader::new().decrypt_document(data, key, &CancellationToken::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherSuite;
    use crate::entry::{EntryBuilder, PASSWORD};
    use crate::group::GroupBuilder;
    use crate::kdf::{Argon2Variant, KdfParameters};
    use crate::writer::{save, KdbxWriter};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kdbx_core=debug")),
            )
            .with_test_writer()
            .try_init();
    }

    fn v3_settings() -> WriterSettings {
        WriterSettings {
            cipher: CipherSuite::Aes256Cbc,
            compression: Compression::Gzip,
            inner_stream: InnerStreamAlgorithm::Salsa20,
            kdf: KdfParameters::aes(100),
        }
    }

    fn v4_settings() -> WriterSettings {
        WriterSettings {
            cipher: CipherSuite::ChaCha20,
            compression: Compression::Gzip,
            inner_stream: InnerStreamAlgorithm::ChaCha20,
            kdf: KdfParameters::argon2(Argon2Variant::Argon2id, 256, 1, 1),
        }
    }

    fn sample() -> KdbxDocument {
        let mut db = KdbxDocument::new("Root");
        let root = db.root();
        let work = db.add_group(root, GroupBuilder::new("Work").build()).unwrap();
        db.add_entry(
            root,
            EntryBuilder::new("Example")
                .username("alice")
                .password("hunter2")
                .url("https://example.com")
                .build(),
        )
        .unwrap();
        let reference = db.add_binary(b"certificate bytes".to_vec(), false);
        db.add_entry(
            work,
            EntryBuilder::new("Server")
                .password("s3rv3r")
                .field("API key", "abc123", true)
                .attachment("cert.pem", reference)
                .build(),
        )
        .unwrap();
        db
    }

    #[test]
    fn test_round_trip_v3() {
        init_tracing();
        let db = sample();
        let key = CompositeKey::from_password("correct horse");
        let bytes = save(&db, &key, v3_settings()).unwrap();

        let mut reader = KdbxReader::new();
        let header = reader.read_header(&bytes).unwrap();
        assert_eq!(header.kdbx_version().unwrap(), KdbxVersion::V3);
        assert_eq!(reader.state(), ReaderState::HeaderParsed);

        let parsed = reader
            .decrypt_document(&bytes, &key, &CancellationToken::new())
            .unwrap();
        assert_eq!(reader.state(), ReaderState::DocumentParsed);
        assert_eq!(parsed, db);
        assert_eq!(reader.writer_settings().unwrap().version(), KdbxVersion::V3);
    }

    #[test]
    fn test_round_trip_v4() {
        init_tracing();
        let db = sample();
        let key = CompositeKey::from_password("correct horse");
        let bytes = save(&db, &key, v4_settings()).unwrap();

        let mut reader = KdbxReader::new();
        let parsed = reader
            .decrypt_document(&bytes, &key, &CancellationToken::new())
            .unwrap();
        assert_eq!(parsed, db);
        let settings = reader.writer_settings().unwrap();
        assert_eq!(settings.cipher, CipherSuite::ChaCha20);
        assert_eq!(settings.inner_stream, InnerStreamAlgorithm::ChaCha20);
    }

    #[test]
    fn test_round_trip_uncompressed_arcfour() {
        let db = sample();
        let key = CompositeKey::from_password("pw");
        let settings = WriterSettings {
            compression: Compression::None,
            inner_stream: InnerStreamAlgorithm::ArcFourVariant,
            ..v3_settings()
        };
        let bytes = save(&db, &key, settings).unwrap();
        assert_eq!(open(&bytes, &key).unwrap(), db);
    }

    #[test]
    fn test_wrong_password() {
        init_tracing();
        for settings in [v3_settings(), v4_settings()] {
            let bytes = save(&sample(), &CompositeKey::from_password("right"), settings).unwrap();
            let mut reader = KdbxReader::new();
            let result = reader.decrypt_document(
                &bytes,
                &CompositeKey::from_password("wrong"),
                &CancellationToken::new(),
            );
            assert_eq!(result, Err(Error::LikelyWrongCredentials));
            assert_eq!(reader.state(), ReaderState::Failed);
            assert!(result.unwrap_err().is_credential_error());
        }
    }

    #[test]
    fn test_failed_reader_is_not_reusable() {
        let key = CompositeKey::from_password("right");
        let bytes = save(&sample(), &key, v3_settings()).unwrap();
        let mut reader = KdbxReader::new();
        assert!(reader
            .decrypt_document(&bytes, &CompositeKey::from_password("wrong"), &CancellationToken::new())
            .is_err());
        assert_eq!(
            reader.decrypt_document(&bytes, &key, &CancellationToken::new()),
            Err(Error::ReaderFailed)
        );
        // A fresh reader succeeds
        assert!(KdbxReader::new()
            .decrypt_document(&bytes, &key, &CancellationToken::new())
            .is_ok());
    }

    #[test]
    fn test_tampered_body() {
        init_tracing();
        let key = CompositeKey::from_password("pw");
        for settings in [v3_settings(), v4_settings()] {
            let bytes = save(&sample(), &key, settings).unwrap();
            let (_, header_len) = HeaderFields::parse(&bytes).unwrap();
            let body_len = bytes.len() - header_len;
            // Skip the v4 header hash and HMAC and the first v3 cipher blocks
            for offset in [header_len + 100, header_len + body_len / 2, bytes.len() - 1] {
                let mut tampered = bytes.clone();
                tampered[offset] ^= 0x01;
                let result = open(&tampered, &key);
                assert!(
                    matches!(result, Err(Error::IntegrityCheckFailed(_))),
                    "offset {}: {:?}",
                    offset,
                    result.map(|_| ())
                );
            }
        }
    }

    #[test]
    fn test_tampered_v4_header() {
        let key = CompositeKey::from_password("pw");
        let bytes = save(&sample(), &key, v4_settings()).unwrap();
        let mut tampered = bytes.clone();
        // signature, version, cipher and compression fields end at 42;
        // the master seed value starts at 47
        tampered[60] ^= 0x01;
        assert!(matches!(
            open(&tampered, &key),
            Err(Error::IntegrityCheckFailed(_))
        ));
    }

    #[test]
    fn test_tampered_v4_header_hash_and_hmac() {
        let key = CompositeKey::from_password("pw");
        let bytes = save(&sample(), &key, v4_settings()).unwrap();
        let (_, header_len) = HeaderFields::parse(&bytes).unwrap();
        let hmac_start = header_len + HEADER_SHA_LEN;
        for offset in [header_len, header_len + 17, hmac_start, hmac_start + 5, hmac_start + 31] {
            let mut tampered = bytes.clone();
            tampered[offset] ^= 0x01;
            let result = open(&tampered, &key);
            assert!(
                matches!(result, Err(Error::IntegrityCheckFailed(_))),
                "offset {}: {:?}",
                offset,
                result.map(|_| ())
            );
        }

        let mut tampered = bytes.clone();
        tampered[hmac_start + 5] ^= 0x01;
        assert_eq!(
            open(&tampered, &CompositeKey::from_password("wrong")),
            Err(Error::LikelyWrongCredentials)
        );
    }

    #[test]
    fn test_bad_signature() {
        let mut reader = KdbxReader::new();
        assert_eq!(
            reader.read_header(b"not a database at all").map(|_| ()),
            Err(Error::MalformedSignature)
        );
        assert_eq!(reader.state(), ReaderState::Failed);
    }

    #[test]
    fn test_hunter2_example() {
        init_tracing();
        let mut db = KdbxDocument::new("Root");
        let entry = EntryBuilder::new("Example").password("hunter2").build();
        let uuid = db.add_entry(db.root(), entry).unwrap();

        let settings = WriterSettings {
            cipher: CipherSuite::Aes256Cbc,
            compression: Compression::Gzip,
            inner_stream: InnerStreamAlgorithm::ChaCha20,
            kdf: KdfParameters::argon2(Argon2Variant::Argon2d, 64 * 1024, 2, 2),
        };
        let key = CompositeKey::from_password("example");
        let first = save(&db, &key, settings.clone()).unwrap();

        let parsed = open(&first, &key).unwrap();
        let password = parsed.entry(&uuid).unwrap().field(PASSWORD).unwrap();
        assert!(password.is_protected());
        assert_eq!(password.clear_value().as_str(), "hunter2");

        let second = save(&parsed, &key, settings).unwrap();
        assert_ne!(first, second);
        let reparsed = open(&second, &key).unwrap();
        assert_eq!(reparsed, parsed);
        assert_eq!(
            reparsed.entry(&uuid).unwrap().password().unwrap().as_str(),
            "hunter2"
        );
    }

    #[test]
    fn test_key_file_and_password() {
        let key_file = b"<?xml version=\"1.0\"?><KeyFile><Meta><Version>1.00</Version></Meta>\
<Key><Data>AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA=</Data></Key></KeyFile>";
        let key = CompositeKey::from_password("pw")
            .with_key_file(key_file)
            .unwrap();
        let bytes = save(&sample(), &key, v4_settings()).unwrap();
        assert!(open(&bytes, &key).is_ok());

        let password_only = CompositeKey::from_password("pw");
        assert_eq!(
            open(&bytes, &password_only),
            Err(Error::LikelyWrongCredentials)
        );
    }

    #[test]
    fn test_cancelled_read() {
        let key = CompositeKey::from_password("pw");
        let bytes = save(&sample(), &key, v3_settings()).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut reader = KdbxReader::new();
        assert_eq!(
            reader.decrypt_document(&bytes, &key, &token),
            Err(Error::CancellationRequested)
        );
        assert_eq!(reader.state(), ReaderState::Failed);
    }

    #[test]
    fn test_history_survives_save() {
        let mut db = sample();
        db.meta.history_max_items = 2;
        let uuid = db.find_entries(|e| e.title() == "Example")[0].uuid;
        for password in ["one", "two", "three"] {
            let mut template = db.entry(&uuid).unwrap().clone();
            template.set_field_value(PASSWORD, password);
            db.update_entry(&uuid, &template, true).unwrap();
        }
        let key = CompositeKey::from_password("pw");
        let mut writer = KdbxWriter::new(v3_settings());
        let bytes = writer.write(&db, &key, &CancellationToken::new()).unwrap();
        let parsed = open(&bytes, &key).unwrap();

        let history = &parsed.entry(&uuid).unwrap().history;
        let passwords: Vec<String> = history
            .iter()
            .map(|h| h.password().unwrap().as_str().to_string())
            .collect();
        assert_eq!(passwords, ["one", "two"]);
    }
}
