use std::path::Path;

use data_encoding::HEXLOWER;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::proto;

pub const SHA256_LEN: usize = 32;

/// Identifies a blob by the sha256 hash of its contents and its size.
///
/// Two blobs with equal digests are byte-identical. This is the validated
/// counterpart of [proto::Digest], which carries the hash as a hex string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hash: [u8; SHA256_LEN],
    size: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid digest hash length: {0}")]
    InvalidHashLen(usize),

    #[error("digest hash is not lowercase hex: {0}")]
    InvalidHashEncoding(String),

    #[error("invalid digest size: {0}")]
    InvalidSize(i64),
}

impl Digest {
    pub fn new(hash: [u8; SHA256_LEN], size: u64) -> Self {
        Self { hash, size }
    }

    /// Hashes the passed data.
    pub fn of(data: &[u8]) -> Self {
        Self {
            hash: Sha256::digest(data).into(),
            size: data.len() as u64,
        }
    }

    /// Hashes the contents of the file at the given path, without reading it
    /// into memory all at once.
    pub async fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0; 64 * 1024];
        let mut size = 0u64;

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        Ok(Self {
            hash: hasher.finalize().into(),
            size,
        })
    }

    pub fn hash(&self) -> &[u8; SHA256_LEN] {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash)
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl TryFrom<&proto::Digest> for Digest {
    type Error = Error;

    fn try_from(value: &proto::Digest) -> Result<Self, Self::Error> {
        if value.hash.len() != SHA256_LEN * 2 {
            return Err(Error::InvalidHashLen(value.hash.len()));
        }
        let hash: [u8; SHA256_LEN] = HEXLOWER
            .decode(value.hash.as_bytes())
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| Error::InvalidHashEncoding(value.hash.clone()))?;
        let size = u64::try_from(value.size_bytes).map_err(|_| Error::InvalidSize(value.size_bytes))?;

        Ok(Self { hash, size })
    }
}

impl TryFrom<proto::Digest> for Digest {
    type Error = Error;

    fn try_from(value: proto::Digest) -> Result<Self, Self::Error> {
        (&value).try_into()
    }
}

impl From<&Digest> for proto::Digest {
    fn from(value: &Digest) -> Self {
        proto::Digest {
            hash: value.hash_hex(),
            size_bytes: value.size as i64,
        }
    }
}

impl From<Digest> for proto::Digest {
    fn from(value: Digest) -> Self {
        (&value).into()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash_hex(), self.size)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash_hex(), self.size)
    }
}
