//! Error types for kdbx-core

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for kdbx-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while reading, writing or editing a KDBX database.
///
/// Corruption and credential failures are ordinary values: callers may retry
/// with different credentials or report the problem, the codec never retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The file does not start with the KDBX signature
    #[error("Not a KDBX file: bad signature")]
    MalformedSignature,

    /// Signature is known but the format version is not supported
    #[error("Unsupported KDBX version: {0:#010x}")]
    UnsupportedVersion(u32),

    /// Outer cipher UUID is not in the registry
    #[error("Unknown cipher: {0}")]
    UnknownCipher(Uuid),

    /// KDF UUID is not in the registry
    #[error("Unknown key derivation function: {0}")]
    UnknownKdf(Uuid),

    /// Inner random stream id is not one of the known algorithms
    #[error("Unknown inner random stream id: {0}")]
    UnknownInnerStream(u32),

    /// The header ended before a field was complete
    #[error("Truncated header: {0}")]
    TruncatedHeader(String),

    /// A required header field is absent
    #[error("Missing header field: {0}")]
    MissingHeaderField(&'static str),

    /// A header field is present but its content is unusable
    #[error("Invalid header field {field}: {reason}")]
    InvalidHeaderField { field: &'static str, reason: String },

    /// A variant dictionary blob could not be decoded
    #[error("Malformed variant dictionary: {0}")]
    MalformedVariantDictionary(String),

    /// Stream start bytes, header HMAC or padding did not check out
    #[error("Invalid credentials: incorrect password or key file")]
    LikelyWrongCredentials,

    /// A block hash or HMAC did not match: the file is corrupt or was tampered with
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    /// The header hash stored in the XML does not match the header bytes
    #[error("Header hash mismatch")]
    BadHeaderHash,

    /// Gzip inflate or deflate failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    /// The XML payload is not a well-formed KeePass document
    #[error("Malformed XML: {0}")]
    MalformedXml(String),

    /// A key file could not be interpreted
    #[error("Invalid key file: {0}")]
    InvalidKeyFile(String),

    /// The KDF rejected its parameters
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// The caller cancelled a long-running operation
    #[error("Operation cancelled")]
    CancellationRequested,

    /// A reader that already finished or failed was asked to continue
    #[error("Reader cannot be reused; construct a new reader to retry")]
    ReaderFailed,

    /// Entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Group not found
    #[error("Group not found: {0}")]
    GroupNotFound(Uuid),

    /// Moving a node would create a cycle or detach the root
    #[error("Cannot move {node} under {target}")]
    InvalidAdoption { node: Uuid, target: Uuid },

    /// The root group cannot be removed
    #[error("The root group cannot be removed")]
    RootGroupImmutable,

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Whether retrying with other credentials could succeed
    pub fn is_credential_error(&self) -> bool {
        matches!(self, Error::LikelyWrongCredentials)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<xml::reader::Error> for Error {
    fn from(err: xml::reader::Error) -> Self {
        Error::MalformedXml(err.to_string())
    }
}

impl From<xml::writer::Error> for Error {
    fn from(err: xml::writer::Error) -> Self {
        Error::MalformedXml(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
