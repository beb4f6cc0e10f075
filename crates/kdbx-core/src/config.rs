//! Writer defaults for new databases, loaded from TOML

use crate::cipher::CipherSuite;
use crate::error::{Error, Result};
use crate::header::Compression;
use crate::inner_stream::InnerStreamAlgorithm;
use crate::kdf::{
    Argon2Variant, KdfParameters, DEFAULT_AES_ROUNDS, DEFAULT_ARGON2_ITERATIONS,
    DEFAULT_ARGON2_MEMORY_KIB, DEFAULT_ARGON2_PARALLELISM,
};
use crate::writer::WriterSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Codec configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_cipher")]
    pub cipher: CipherName,
    #[serde(default = "default_compression")]
    pub compression: CompressionName,
    #[serde(default = "default_inner_stream")]
    pub inner_stream: InnerStreamName,
    #[serde(default)]
    pub kdf: KdfConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherName {
    Aes256,
    Chacha20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionName {
    Gzip,
    None,
}

/// Only the streams a writer should still produce; ArcFour is read-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InnerStreamName {
    Salsa20,
    Chacha20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfName {
    AesKdf,
    Argon2d,
    Argon2id,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfConfig {
    #[serde(default = "default_kdf")]
    pub algorithm: KdfName,
    /// AES-KDF only
    #[serde(default = "default_rounds")]
    pub rounds: u64,
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u64,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

fn default_cipher() -> CipherName {
    CipherName::Aes256
}

fn default_compression() -> CompressionName {
    CompressionName::Gzip
}

fn default_inner_stream() -> InnerStreamName {
    InnerStreamName::Chacha20
}

fn default_kdf() -> KdfName {
    KdfName::Argon2d
}

fn default_rounds() -> u64 {
    DEFAULT_AES_ROUNDS
}

fn default_memory_kib() -> u64 {
    DEFAULT_ARGON2_MEMORY_KIB
}

fn default_iterations() -> u64 {
    DEFAULT_ARGON2_ITERATIONS
}

fn default_parallelism() -> u32 {
    DEFAULT_ARGON2_PARALLELISM
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            algorithm: default_kdf(),
            rounds: default_rounds(),
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            cipher: default_cipher(),
            compression: default_compression(),
            inner_stream: default_inner_stream(),
            kdf: KdfConfig::default(),
        }
    }
}

impl KdfConfig {
    fn parameters(&self) -> Result<KdfParameters> {
        match self.algorithm {
            KdfName::AesKdf => {
                if self.rounds == 0 {
                    return Err(Error::Config("kdf.rounds must be at least 1".to_string()));
                }
                Ok(KdfParameters::aes(self.rounds))
            }
            KdfName::Argon2d | KdfName::Argon2id => {
                if self.iterations == 0 || self.parallelism == 0 {
                    return Err(Error::Config(
                        "kdf.iterations and kdf.parallelism must be at least 1".to_string(),
                    ));
                }
                // argon2 needs 8 KiB per lane
                if self.memory_kib < 8 * u64::from(self.parallelism) {
                    return Err(Error::Config(format!(
                        "kdf.memory_kib {} is too small for parallelism {}",
                        self.memory_kib, self.parallelism
                    )));
                }
                let variant = if self.algorithm == KdfName::Argon2d {
                    Argon2Variant::Argon2d
                } else {
                    Argon2Variant::Argon2id
                };
                Ok(KdfParameters::argon2(
                    variant,
                    self.memory_kib,
                    self.iterations,
                    self.parallelism,
                ))
            }
        }
    }
}

impl CodecConfig {
    /// Load configuration from file or use defaults
    pub fn load() -> Result<Self> {
        let config_paths: Vec<PathBuf> = vec![Some(PathBuf::from("kdbx.toml")), user_config_path()]
            .into_iter()
            .flatten()
            .collect();

        for path in config_paths {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        tracing::info!("Using default codec configuration");
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded codec config from {:?}", path);
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CodecConfig = toml::from_str(content)?;
        // surface bad KDF costs at load time rather than at first save
        config.kdf.parameters()?;
        Ok(config)
    }

    /// Settings for a writer; seeds are drawn when it writes
    pub fn writer_settings(&self) -> Result<WriterSettings> {
        Ok(WriterSettings {
            cipher: match self.cipher {
                CipherName::Aes256 => CipherSuite::Aes256Cbc,
                CipherName::Chacha20 => CipherSuite::ChaCha20,
            },
            compression: match self.compression {
                CompressionName::Gzip => Compression::Gzip,
                CompressionName::None => Compression::None,
            },
            inner_stream: match self.inner_stream {
                InnerStreamName::Salsa20 => InnerStreamAlgorithm::Salsa20,
                InnerStreamName::Chacha20 => InnerStreamAlgorithm::ChaCha20,
            },
            kdf: self.kdf.parameters()?,
        })
    }
}

/// `$XDG_CONFIG_HOME/kdbx-core/config.toml`, falling back to `~/.config`;
/// `%APPDATA%` on Windows
fn user_config_path() -> Option<PathBuf> {
    let base = if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_CONFIG_HOME")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
    };
    base.map(|dir| dir.join("kdbx-core").join("config.toml"))
}
