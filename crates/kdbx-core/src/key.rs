//! Credentials: security tokens, the composite key and the derived session keys

use crate::error::{Error, Result};
use crate::dom::XmlElement;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Password,
    KeyFile,
}

/// One credential, reduced to its 32 bytes of key material at construction.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecurityToken {
    #[zeroize(skip)]
    kind: TokenKind,
    key: [u8; 32],
}

impl SecurityToken {
    /// SHA-256 of the UTF-8 password
    pub fn password(password: &str) -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(password.as_bytes()));
        Self {
            kind: TokenKind::Password,
            key,
        }
    }

    /// Interpret key file contents: XML key file, 32 raw bytes, 64 hex
    /// characters, or anything else hashed whole.
    pub fn key_file(contents: &[u8]) -> Result<Self> {
        let key = match parse_xml_key_file(contents)? {
            Some(data) => data,
            None => parse_binary_key_file(contents),
        };
        Ok(Self {
            kind: TokenKind::KeyFile,
            key: *key,
        })
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurityToken({:?}, ***)", self.kind)
    }
}

fn parse_binary_key_file(contents: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    if contents.len() == 32 {
        key.copy_from_slice(contents);
        return key;
    }
    if contents.len() == 64 {
        if let Ok(decoded) = hex::decode(contents) {
            let decoded = Zeroizing::new(decoded);
            key.copy_from_slice(&decoded);
            return key;
        }
    }
    key.copy_from_slice(&Sha256::digest(contents));
    key
}

/// `Ok(None)` when the contents are not an XML key file at all
fn parse_xml_key_file(contents: &[u8]) -> Result<Option<Zeroizing<[u8; 32]>>> {
    let Ok(root) = XmlElement::parse(contents) else {
        return Ok(None);
    };
    if root.name != "KeyFile" {
        return Ok(None);
    }

    let version = root
        .child("Meta")
        .and_then(|meta| meta.child("Version"))
        .map(|v| v.text.trim().to_string())
        .unwrap_or_else(|| "1.0".to_string());
    let data = root
        .child("Key")
        .and_then(|key| key.child("Data"))
        .ok_or_else(|| Error::InvalidKeyFile("missing Key/Data".to_string()))?;

    let bytes = if version.starts_with("2.") {
        let hex_text: String = data.text.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = Zeroizing::new(
            hex::decode(hex_text).map_err(|e| Error::InvalidKeyFile(format!("bad hex data: {}", e)))?,
        );
        if let Some(expected) = data.attr("Hash") {
            let digest = Sha256::digest(&bytes[..]);
            let actual = hex::encode(&digest[..4]);
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(Error::InvalidKeyFile("data hash mismatch".to_string()));
            }
        }
        bytes
    } else if version.starts_with("1.") {
        Zeroizing::new(
            BASE64
                .decode(data.text.trim())
                .map_err(|e| Error::InvalidKeyFile(format!("bad base64 data: {}", e)))?,
        )
    } else {
        return Err(Error::InvalidKeyFile(format!("unsupported version {}", version)));
    };

    let mut key = Zeroizing::new([0u8; 32]);
    if bytes.len() == 32 {
        key.copy_from_slice(&bytes);
    } else {
        key.copy_from_slice(&Sha256::digest(&bytes[..]));
    }
    Ok(Some(key))
}

/// Ordered tokens whose hashes are combined into the KDF input
#[derive(Debug, Clone, Default)]
pub struct CompositeKey {
    tokens: Vec<SecurityToken>,
}

impl CompositeKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_password(password: &str) -> Self {
        Self::new().with_token(SecurityToken::password(password))
    }

    pub fn with_password(self, password: &str) -> Self {
        self.with_token(SecurityToken::password(password))
    }

    pub fn with_key_file(self, contents: &[u8]) -> Result<Self> {
        Ok(self.with_token(SecurityToken::key_file(contents)?))
    }

    pub fn with_token(mut self, token: SecurityToken) -> Self {
        self.tokens.push(token);
        self
    }

    pub fn tokens(&self) -> &[SecurityToken] {
        &self.tokens
    }

    /// SHA-256 over the concatenated token keys
    pub fn raw_key(&self) -> Zeroizing<[u8; 32]> {
        let mut hasher = Sha256::new();
        for token in &self.tokens {
            hasher.update(token.key_bytes());
        }
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

const HMAC_KEY_SUFFIX: u8 = 0x01;

/// Per-file keys, wiped when dropped
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    cipher_key: [u8; 32],
    hmac_key: [u8; 64],
}

impl DerivedKey {
    /// Combine the master seed with a KDF result
    pub fn derive(master_seed: &[u8], transformed_key: &[u8; 32]) -> Self {
        let mut cipher_key = [0u8; 32];
        let mut hasher = Sha256::new();
        hasher.update(master_seed);
        hasher.update(transformed_key);
        cipher_key.copy_from_slice(&hasher.finalize());

        let mut hmac_key = [0u8; 64];
        let mut hasher = Sha512::new();
        hasher.update(master_seed);
        hasher.update(transformed_key);
        hasher.update([HMAC_KEY_SUFFIX]);
        hmac_key.copy_from_slice(&hasher.finalize());

        Self {
            cipher_key,
            hmac_key,
        }
    }

    pub fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    pub fn hmac_key(&self) -> &[u8; 64] {
        &self.hmac_key
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DerivedKey(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_only_is_double_sha256() {
        let key = CompositeKey::from_password("hunter2");
        let expected = Sha256::digest(Sha256::digest(b"hunter2"));
        assert_eq!(key.raw_key().as_slice(), expected.as_slice());
    }

    #[test]
    fn test_token_order_matters() {
        let kf = [0x11u8; 32];
        let a = CompositeKey::from_password("pw").with_key_file(&kf).unwrap();
        let b = CompositeKey::new().with_key_file(&kf).unwrap().with_password("pw");
        assert_ne!(*a.raw_key(), *b.raw_key());
    }

    #[test]
    fn test_key_file_raw_32_bytes() {
        let token = SecurityToken::key_file(&[0x42; 32]).unwrap();
        assert_eq!(token.kind(), TokenKind::KeyFile);
        assert_eq!(token.key_bytes(), &[0x42; 32]);
    }

    #[test]
    fn test_key_file_hex() {
        let hex_text = "ab".repeat(32);
        let token = SecurityToken::key_file(hex_text.as_bytes()).unwrap();
        assert_eq!(token.key_bytes(), &[0xAB; 32]);
    }

    #[test]
    fn test_key_file_arbitrary_is_hashed() {
        let contents = b"just some file with random words in it";
        let token = SecurityToken::key_file(contents).unwrap();
        assert_eq!(token.key_bytes().as_slice(), Sha256::digest(contents).as_slice());
    }

    #[test]
    fn test_key_file_xml_v1() {
        let data = BASE64.encode([0x5A; 32]);
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<KeyFile><Meta><Version>1.00</Version></Meta><Key><Data>{}</Data></Key></KeyFile>",
            data
        );
        let token = SecurityToken::key_file(xml.as_bytes()).unwrap();
        assert_eq!(token.key_bytes(), &[0x5A; 32]);
    }

    #[test]
    fn test_key_file_xml_v2_hash_checked() {
        let key = [0x01u8; 32];
        let hash = hex::encode(&Sha256::digest(key)[..4]).to_uppercase();
        let body = hex::encode_upper(key);
        let xml = format!(
            "<KeyFile><Meta><Version>2.0</Version></Meta><Key><Data Hash=\"{}\">\n{} {}\n</Data></Key></KeyFile>",
            hash,
            &body[..32],
            &body[32..]
        );
        let token = SecurityToken::key_file(xml.as_bytes()).unwrap();
        assert_eq!(token.key_bytes(), &key);

        let tampered = xml.replace(&hash, "00000000");
        assert!(matches!(
            SecurityToken::key_file(tampered.as_bytes()),
            Err(Error::InvalidKeyFile(_))
        ));
    }

    #[test]
    fn test_derived_key_depends_on_seed() {
        let a = DerivedKey::derive(&[1u8; 32], &[2u8; 32]);
        let b = DerivedKey::derive(&[3u8; 32], &[2u8; 32]);
        assert_ne!(a.cipher_key(), b.cipher_key());
        assert_ne!(a.hmac_key()[..], b.hmac_key()[..]);
        assert_eq!(format!("{:?}", a), "DerivedKey(***)");
    }
}
