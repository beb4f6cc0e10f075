//! Inner random streams that mask protected values inside the XML

use crate::error::{Error, Result};
use chacha20::ChaCha20;
use cipher::generic_array::GenericArray;
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use salsa20::Salsa20;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];
const ARCFOUR_DISCARD: usize = 512;

/// Algorithm ids as stored in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InnerStreamAlgorithm {
    ArcFourVariant,
    Salsa20,
    ChaCha20,
}

impl InnerStreamAlgorithm {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            1 => Ok(Self::ArcFourVariant),
            2 => Ok(Self::Salsa20),
            3 => Ok(Self::ChaCha20),
            other => Err(Error::UnknownInnerStream(other)),
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Self::ArcFourVariant => 1,
            Self::Salsa20 => 2,
            Self::ChaCha20 => 3,
        }
    }

    /// Key length the writer generates for this algorithm
    pub fn key_len(&self) -> usize {
        match self {
            Self::ChaCha20 => 64,
            _ => 32,
        }
    }
}

/// Keystream cursor threaded through one XML walk.
///
/// Each protected value consumes exactly as many keystream bytes as it is
/// long, so reader and writer must visit values in the same order. Cloning
/// gives an independent cursor at the same position.
pub struct InnerRandomStream {
    algorithm: InnerStreamAlgorithm,
    state: StreamState,
}

enum StreamState {
    ArcFour(ArcFourState),
    Salsa20(SeekableStream<Salsa20>),
    ChaCha20(SeekableStream<ChaCha20>),
}

impl InnerRandomStream {
    pub fn new(algorithm: InnerStreamAlgorithm, key: &[u8]) -> Result<Self> {
        let state = match algorithm {
            InnerStreamAlgorithm::ArcFourVariant => {
                if key.is_empty() {
                    return Err(Error::InvalidHeaderField {
                        field: "ProtectedStreamKey",
                        reason: "empty key".to_string(),
                    });
                }
                StreamState::ArcFour(ArcFourState::new(key))
            }
            InnerStreamAlgorithm::Salsa20 => {
                let mut seed = [0u8; 40];
                seed[..32].copy_from_slice(&Sha256::digest(key));
                seed[32..].copy_from_slice(&SALSA20_NONCE);
                StreamState::Salsa20(SeekableStream::new(seed.to_vec(), 32))
            }
            InnerStreamAlgorithm::ChaCha20 => {
                let hash = Sha512::digest(key);
                StreamState::ChaCha20(SeekableStream::new(hash[..44].to_vec(), 32))
            }
        };
        Ok(Self { algorithm, state })
    }

    pub fn algorithm(&self) -> InnerStreamAlgorithm {
        self.algorithm
    }

    /// The next `count` keystream bytes
    pub fn next_bytes(&mut self, count: usize) -> Vec<u8> {
        let mut out = vec![0u8; count];
        self.apply(&mut out);
        out
    }

    /// XOR the next keystream bytes into `data`
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.state {
            StreamState::ArcFour(state) => state.apply(data),
            StreamState::Salsa20(stream) => stream.apply(data),
            StreamState::ChaCha20(stream) => stream.apply(data),
        }
    }
}

impl Clone for InnerRandomStream {
    fn clone(&self) -> Self {
        let state = match &self.state {
            StreamState::ArcFour(state) => StreamState::ArcFour(state.clone()),
            StreamState::Salsa20(stream) => StreamState::Salsa20(stream.fork()),
            StreamState::ChaCha20(stream) => StreamState::ChaCha20(stream.fork()),
        };
        Self {
            algorithm: self.algorithm,
            state,
        }
    }
}

impl std::fmt::Debug for InnerRandomStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerRandomStream")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// A stream cipher that remembers its seed and position so it can be forked
struct SeekableStream<C> {
    seed: SeedBytes,
    key_len: usize,
    position: u64,
    cipher: C,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SeedBytes(Vec<u8>);

impl<C> SeekableStream<C>
where
    C: KeyIvInit + StreamCipher + StreamCipherSeek,
{
    /// `seed` is key followed by nonce
    fn new(seed: Vec<u8>, key_len: usize) -> Self {
        let cipher = C::new(
            GenericArray::from_slice(&seed[..key_len]),
            GenericArray::from_slice(&seed[key_len..]),
        );
        Self {
            seed: SeedBytes(seed),
            key_len,
            position: 0,
            cipher,
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
        self.position += data.len() as u64;
    }

    fn fork(&self) -> Self {
        let mut forked = Self::new(self.seed.0.clone(), self.key_len);
        forked.cipher.seek(self.position);
        forked.position = self.position;
        forked
    }
}

/// RC4 keyed with the stream key, first 512 bytes dropped
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ArcFourState {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl ArcFourState {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (idx, slot) in s.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }

        let mut state = Self { s, i: 0, j: 0 };
        let mut discard = [0u8; ARCFOUR_DISCARD];
        state.apply(&mut discard);
        state
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *byte ^= self.s[idx as usize];
        }
    }
}
