//! Checksum and hashing utilities

use crate::error::{Result, TransferError};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

// Block size for whole-file hashing
const HASH_BLOCK: usize = 4096;

/// Available digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Blake3,
    Md5, // For compatibility
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
            Self::Md5 => "md5",
        }
    }

    /// Length of the hex digest this algorithm produces
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => 64,
            Self::Md5 => 32,
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            "md5" => Ok(Self::Md5),
            other => Err(TransferError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum State {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
    Md5(md5::Context),
}

/// Incremental digest over a byte stream.
///
/// Feed bytes with [`Digester::update`] in any split; the result only
/// depends on the concatenated input.
pub struct Digester {
    state: State,
}

impl Digester {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let state = match algorithm {
            DigestAlgorithm::Sha256 => State::Sha256(Sha256::new()),
            DigestAlgorithm::Blake3 => State::Blake3(Box::new(blake3::Hasher::new())),
            DigestAlgorithm::Md5 => State::Md5(md5::Context::new()),
        };
        Self { state }
    }

    /// Start a digest from an algorithm name
    pub fn with_name(name: &str) -> Result<Self> {
        Ok(Self::new(name.parse()?))
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            State::Sha256(h) => h.update(data),
            State::Blake3(h) => {
                h.update(data);
            }
            State::Md5(h) => h.consume(data),
        }
    }

    /// Consume the digester and return the lowercase hex digest
    pub fn finalize(self) -> String {
        match self.state {
            State::Sha256(h) => to_hex(&h.finalize()),
            State::Blake3(h) => to_hex(h.finalize().as_bytes()),
            State::Md5(h) => to_hex(&h.compute().0),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

/// Hash a whole file. Returns the number of bytes hashed and the hex digest.
pub fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut digester = Digester::new(algorithm);
    let mut buf = [0u8; HASH_BLOCK];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, digester.finalize()))
}

/// Compute a digest for an in-memory buffer
pub fn digest_bytes(data: &[u8], algorithm: DigestAlgorithm) -> String {
    let mut digester = Digester::new(algorithm);
    digester.update(data);
    digester.finalize()
}
