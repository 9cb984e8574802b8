//! 32-byte identity for URLs and content blobs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

pub const KEY_LEN: usize = 32;

#[derive(Error, Debug, PartialEq)]
pub enum KeyError {
    #[error("Invalid key length: {0} hex characters (expected 64)")]
    Length(usize),

    #[error("Invalid hex in key: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// SHA-256 of a canonical string. Ordered by raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn new(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Fragments never reach the server, so they are not part of a URL's identity.
    pub fn from_url(url: &Url) -> Self {
        if url.fragment().is_some() {
            let mut canonical = url.clone();
            canonical.set_fragment(None);
            Self::new(canonical.as_str())
        } else {
            Self::new(url.as_str())
        }
    }

    pub const fn from_raw(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != KEY_LEN * 2 {
            return Err(KeyError::Length(s.len()));
        }
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}
