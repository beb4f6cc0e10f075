//! Typed key/value blob used for KDF parameters and public custom data

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

const VERSION: u16 = 0x0100;
const VERSION_CRITICAL_MASK: u16 = 0xFF00;

const TYPE_END: u8 = 0x00;
const TYPE_UINT32: u8 = 0x04;
const TYPE_UINT64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_INT32: u8 = 0x0C;
const TYPE_INT64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantValue {
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl VariantValue {
    fn type_tag(&self) -> u8 {
        match self {
            Self::UInt32(_) => TYPE_UINT32,
            Self::UInt64(_) => TYPE_UINT64,
            Self::Bool(_) => TYPE_BOOL,
            Self::Int32(_) => TYPE_INT32,
            Self::Int64(_) => TYPE_INT64,
            Self::String(_) => TYPE_STRING,
            Self::Bytes(_) => TYPE_BYTES,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Self::UInt32(v) => v.to_le_bytes().to_vec(),
            Self::UInt64(v) => v.to_le_bytes().to_vec(),
            Self::Bool(v) => vec![u8::from(*v)],
            Self::Int32(v) => v.to_le_bytes().to_vec(),
            Self::Int64(v) => v.to_le_bytes().to_vec(),
            Self::String(v) => v.as_bytes().to_vec(),
            Self::Bytes(v) => v.clone(),
        }
    }

    fn decode(tag: u8, key: &str, data: &[u8]) -> Result<Self> {
        let expect_len = |n: usize| {
            if data.len() == n {
                Ok(())
            } else {
                Err(Error::MalformedVariantDictionary(format!(
                    "value for {:?} has {} bytes, expected {}",
                    key,
                    data.len(),
                    n
                )))
            }
        };

        match tag {
            TYPE_UINT32 => {
                expect_len(4)?;
                Ok(Self::UInt32(LittleEndian::read_u32(data)))
            }
            TYPE_UINT64 => {
                expect_len(8)?;
                Ok(Self::UInt64(LittleEndian::read_u64(data)))
            }
            TYPE_BOOL => {
                expect_len(1)?;
                Ok(Self::Bool(data[0] != 0))
            }
            TYPE_INT32 => {
                expect_len(4)?;
                Ok(Self::Int32(LittleEndian::read_i32(data)))
            }
            TYPE_INT64 => {
                expect_len(8)?;
                Ok(Self::Int64(LittleEndian::read_i64(data)))
            }
            TYPE_STRING => String::from_utf8(data.to_vec())
                .map(Self::String)
                .map_err(|_| Error::MalformedVariantDictionary(format!("{:?} is not UTF-8", key))),
            TYPE_BYTES => Ok(Self::Bytes(data.to_vec())),
            other => Err(Error::MalformedVariantDictionary(format!(
                "unknown value type {:#04x} for {:?}",
                other, key
            ))),
        }
    }
}

/// Ordered dictionary; serialization keeps insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDictionary {
    items: Vec<(String, VariantValue)>,
}

impl VariantDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&VariantValue> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or replace; a replaced key keeps its position
    pub fn set(&mut self, key: impl Into<String>, value: VariantValue) {
        let key = key.into();
        match self.items.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.items.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariantValue)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.get(key)? {
            VariantValue::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            VariantValue::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key)? {
            VariantValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::MalformedVariantDictionary("missing version".to_string()));
        }
        let version = LittleEndian::read_u16(&data[0..2]);
        if version & VERSION_CRITICAL_MASK > VERSION & VERSION_CRITICAL_MASK {
            return Err(Error::MalformedVariantDictionary(format!(
                "unsupported version {:#06x}",
                version
            )));
        }

        let mut dict = Self::new();
        let mut pos = 2;
        loop {
            let Some(&tag) = data.get(pos) else {
                return Err(Error::MalformedVariantDictionary("missing terminator".to_string()));
            };
            pos += 1;
            if tag == TYPE_END {
                break;
            }

            let key_bytes = take_prefixed(data, &mut pos)?;
            let key = std::str::from_utf8(key_bytes)
                .map_err(|_| Error::MalformedVariantDictionary("key is not UTF-8".to_string()))?
                .to_string();
            let value_bytes = take_prefixed(data, &mut pos)?;
            let value = VariantValue::decode(tag, &key, value_bytes)?;
            dict.set(key, value);
        }

        Ok(dict)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&VERSION.to_le_bytes());
        for (key, value) in &self.items {
            let encoded = value.encode();
            out.push(value.type_tag());
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            out.extend_from_slice(&encoded);
        }
        out.push(TYPE_END);
        out
    }
}

fn take_prefixed<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    if *pos + 4 > data.len() {
        return Err(Error::MalformedVariantDictionary("truncated length".to_string()));
    }
    let len = LittleEndian::read_u32(&data[*pos..*pos + 4]) as usize;
    *pos += 4;
    if *pos + len > data.len() {
        return Err(Error::MalformedVariantDictionary("truncated item".to_string()));
    }
    let slice = &data[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_types_keep_order() {
        let mut dict = VariantDictionary::new();
        dict.set("$UUID", VariantValue::Bytes(vec![1, 2, 3]));
        dict.set("R", VariantValue::UInt64(6000));
        dict.set("flag", VariantValue::Bool(true));
        dict.set("name", VariantValue::String("kdbx".to_string()));
        dict.set("neg", VariantValue::Int32(-5));

        let parsed = VariantDictionary::parse(&dict.serialize()).unwrap();
        assert_eq!(parsed, dict);
        let keys: Vec<&str> = parsed.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["$UUID", "R", "flag", "name", "neg"]);
        assert_eq!(parsed.get_u64("R"), Some(6000));
        assert_eq!(parsed.get_u32("R"), None);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut dict = VariantDictionary::new();
        dict.set("a", VariantValue::UInt32(1));
        dict.set("b", VariantValue::UInt32(2));
        dict.set("a", VariantValue::UInt32(3));
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.iter().next(), Some(("a", &VariantValue::UInt32(3))));
    }

    #[test]
    fn test_rejects_newer_major_version() {
        let data = [0x00, 0x02, 0x00];
        assert!(matches!(
            VariantDictionary::parse(&data),
            Err(Error::MalformedVariantDictionary(_))
        ));
    }

    #[test]
    fn test_rejects_truncation() {
        let mut bytes = VariantDictionary::new().serialize();
        bytes.pop();
        assert!(VariantDictionary::parse(&bytes).is_err());

        let mut dict = VariantDictionary::new();
        dict.set("S", VariantValue::Bytes(vec![0; 32]));
        let bytes = dict.serialize();
        assert!(VariantDictionary::parse(&bytes[..bytes.len() - 10]).is_err());
    }

    #[test]
    fn test_rejects_wrong_width() {
        // u32 tag with an 8-byte payload
        let mut bytes = vec![0x00, 0x01, TYPE_UINT32, 1, 0, 0, 0, b'P', 8, 0, 0, 0];
        bytes.extend_from_slice(&[0; 8]);
        bytes.push(TYPE_END);
        assert!(VariantDictionary::parse(&bytes).is_err());
    }
}
