use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{OciError, Result};

const SHA256_PREFIX: &str = "sha256:";
const SHA256_HEX_LEN: usize = 64;

/// A validated content digest of the form `sha256:<64 lowercase hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash {
    encoded: String,
}

impl ContentHash {
    /// Parse a digest string such as `"sha256:abcdef…"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let encoded = raw
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| OciError::InvalidDigest(format!("unsupported algorithm in {raw:?}")))?;

        if encoded.len() != SHA256_HEX_LEN {
            return Err(OciError::InvalidDigest(format!(
                "{raw:?}: expected {SHA256_HEX_LEN} hex characters, got {}",
                encoded.len()
            )));
        }
        if !encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(OciError::InvalidDigest(format!(
                "{raw:?}: not lowercase hex"
            )));
        }

        Ok(Self {
            encoded: encoded.to_string(),
        })
    }

    /// Digest of an in-memory byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Finish a running SHA-256 and wrap the result.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self {
            encoded: hex_encode(&hasher.finalize()),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        "sha256"
    }

    /// The hex portion without the `sha256:` prefix.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// The 64-character hex split into two 32-character halves.
    ///
    /// GPT partition names and GUIDs are 36 UTF-16 units and 16 bytes wide,
    /// so a whole digest never fits into either field on its own.
    pub fn halves(&self) -> (&str, &str) {
        self.encoded.split_at(SHA256_HEX_LEN / 2)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHA256_PREFIX}{}", self.encoded)
    }
}

impl FromStr for ContentHash {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = OciError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_string()
    }
}

/// Lowercase hex encoding of `bytes`.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
