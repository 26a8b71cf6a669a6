use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{CartonError, CartonResult, IoContext};

/// Digest (algorithm:value) asserting the integrity of an archive or section.
///
/// Only sha256 is produced; parsing accepts any algorithm tag so mismatches
/// are reported rather than rejected as syntax errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest {
    raw: String,
    split: usize,
}

impl ContentDigest {
    pub fn parse(raw: impl Into<String>) -> CartonResult<Self> {
        let raw = raw.into();
        let (algorithm, value) = raw.split_once(':').ok_or_else(|| {
            CartonError::validation(format!("invalid digest `{raw}`; expected algo:value"))
        })?;
        if algorithm.is_empty() || value.is_empty() {
            return Err(CartonError::validation(format!(
                "invalid digest format `{raw}`"
            )));
        }
        let split = algorithm.len();
        Ok(Self {
            raw: format!("{}:{}", algorithm.to_ascii_lowercase(), value.to_ascii_lowercase()),
            split,
        })
    }

    pub fn sha256_from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_hasher(hasher)
    }

    pub(crate) fn from_hasher(hasher: Sha256) -> Self {
        Self {
            raw: format!("sha256:{}", hex::encode(hasher.finalize())),
            split: "sha256".len(),
        }
    }

    /// Stream a file through sha256 without loading it into memory.
    pub fn sha256_of_file(path: &Path) -> CartonResult<Self> {
        const BUF_SIZE: usize = 64 * 1024;
        let file = File::open(path)
            .io_context(|| format!("failed to open {} for hashing", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let read = reader
                .read(&mut buf)
                .io_context(|| format!("failed to read {} for hashing", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self::from_hasher(hasher))
    }

    pub fn algorithm(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn value(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Short, filesystem-friendly label.
    pub fn short(&self) -> &str {
        let value = self.value();
        &value[..value.len().min(12)]
    }

    /// Check `bytes` against this digest, reporting `subject` on mismatch.
    pub fn verify(&self, subject: &str, bytes: &[u8]) -> CartonResult<()> {
        let actual = Self::sha256_from_bytes(bytes);
        self.expect_eq(subject, &actual)
    }

    pub fn expect_eq(&self, subject: &str, actual: &ContentDigest) -> CartonResult<()> {
        if self == actual {
            return Ok(());
        }
        Err(CartonError::IntegrityMismatch {
            subject: subject.to_string(),
            expected: self.raw.clone(),
            actual: actual.raw.clone(),
        })
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}
