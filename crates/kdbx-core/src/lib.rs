//! kdbx-core - Reader and writer for KeePass KDBX 3.1 and 4.x databases
//!
//! A file is opened with [`KdbxReader`] (or [`open`]) into an in-memory
//! [`KdbxDocument`], edited through the document's tree operations, and written
//! back with [`KdbxWriter`] (or [`save`]). Writers pick the oldest format that
//! can express their [`WriterSettings`] and draw fresh seeds on every save.
//!
//! ```no_run
//! use kdbx_core::{open, save, CompositeKey, EntryBuilder, WriterSettings};
//!
//! # fn main() -> kdbx_core::Result<()> {
//! let key = CompositeKey::from_password("hunter2");
//! let bytes = std::fs::read("passwords.kdbx")?;
//! let mut document = open(&bytes, &key)?;
//!
//! let root = document.root();
//! document.add_entry(root, EntryBuilder::new("Email").username("me").build())?;
//! std::fs::write("passwords.kdbx", save(&document, &key, WriterSettings::default())?)?;
//! # Ok(())
//! # }
//! ```

mod blocks;
mod cancel;
mod cipher;
mod config;
mod database;
mod dom;
mod entry;
mod error;
mod group;
mod header;
mod inner_stream;
mod kdf;
mod key;
mod meta;
mod protected;
mod reader;
mod times;
mod variant_dictionary;
mod writer;

pub use cancel::CancellationToken;
pub use cipher::CipherSuite;
pub use config::{CipherName, CodecConfig, CompressionName, InnerStreamName, KdfConfig, KdfName};
pub use database::KdbxDocument;
pub use dom::{Color, XmlElement};
pub use entry::{AutoType, AutoTypeAssociation, Entry, EntryBinary, EntryBuilder};
pub use error::{Error, Result};
pub use group::{Group, GroupBuilder, Node};
pub use header::{Compression, HeaderFields, InnerStreamParams, KdbxVersion};
pub use inner_stream::InnerStreamAlgorithm;
pub use kdf::{Argon2Variant, KdfParameters};
pub use key::{CompositeKey, SecurityToken, TokenKind};
pub use meta::{
    Binary, CustomData, CustomDataItem, CustomIcon, DeletedObject, MemoryProtection, Metadata,
};
pub use protected::ProtectedString;
pub use reader::{open, KdbxReader, ReaderState};
pub use times::Times;
pub use writer::{save, KdbxWriter, WriterSettings, WriterState};

// Re-export types that users might need
pub use uuid::Uuid;

/// Fresh bytes from the thread-local CSPRNG
pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;

    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}
