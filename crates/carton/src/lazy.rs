//! On-demand handles for payload data (tensors and files).
//!
//! A [`LazyValue`] only carries an address and the digest the payload must
//! hash to. Nothing is read until [`LazyValue::get`] is awaited, and every
//! call re-reads and re-verifies, so a failed fetch never poisons the
//! metadata that produced the handle.

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::digest::ContentDigest;
use crate::error::{CartonError, CartonResult, IoContext};
use crate::format;
use crate::tensor::Tensor;

/// Types that can live behind a [`LazyValue`].
pub trait Payload: Sized + Send + 'static {
    fn decode(bytes: Bytes) -> CartonResult<Self>;
    fn encode(&self) -> CartonResult<Bytes>;
}

impl Payload for Bytes {
    fn decode(bytes: Bytes) -> CartonResult<Self> {
        Ok(bytes)
    }

    fn encode(&self) -> CartonResult<Bytes> {
        Ok(self.clone())
    }
}

impl Payload for Tensor {
    fn decode(bytes: Bytes) -> CartonResult<Self> {
        let tensor: Tensor = serde_cbor::from_slice(&bytes).map_err(CartonError::serialization)?;
        // Re-run construction checks on untrusted input.
        Tensor::with_strides(
            tensor.dtype(),
            tensor.shape().to_vec(),
            tensor.strides().to_vec(),
            tensor.data().clone(),
        )
    }

    fn encode(&self) -> CartonResult<Bytes> {
        serde_cbor::to_vec(self)
            .map(Bytes::from)
            .map_err(CartonError::serialization)
    }
}

/// Where the bytes of a lazy value live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    /// An entry inside a packed archive.
    Archive { archive: Arc<PathBuf>, entry: String },
    /// A plain file on disk (unpacked sources, caller-provided misc files).
    File(PathBuf),
    /// Already-encoded bytes held in memory.
    Inline(Bytes),
}

impl PayloadSource {
    fn describe(&self) -> String {
        match self {
            Self::Archive { archive, entry } => format!("{}!{}", archive.display(), entry),
            Self::File(path) => path.display().to_string(),
            Self::Inline(_) => "<inline>".to_string(),
        }
    }
}

/// An addressable payload plus an explicit, idempotent fetch.
pub struct LazyValue<T> {
    source: PayloadSource,
    digest: Option<ContentDigest>,
    _marker: PhantomData<fn() -> T>,
}

pub type LazyTensor = LazyValue<Tensor>;
pub type LazyFile = LazyValue<Bytes>;

impl<T> Clone for LazyValue<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            digest: self.digest.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for LazyValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyValue")
            .field("source", &self.source.describe())
            .field("digest", &self.digest.as_ref().map(ContentDigest::as_str))
            .finish()
    }
}

/// Two handles are equal when they promise the same content. Handles without
/// a digest (caller-built, not yet packed) compare by address.
impl<T> PartialEq for LazyValue<T> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.digest, &other.digest) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.source == other.source,
            _ => false,
        }
    }
}

impl<T: Payload> LazyValue<T> {
    /// Wrap an in-memory value; it is encoded once and digested up front.
    pub fn from_value(value: &T) -> CartonResult<Self> {
        let bytes = value.encode()?;
        let digest = ContentDigest::sha256_from_bytes(&bytes);
        Ok(Self::from_parts(PayloadSource::Inline(bytes), Some(digest)))
    }

    /// Fetch, verify, and decode the payload.
    pub async fn get(&self) -> CartonResult<T> {
        let bytes = self.read_bytes().await?;
        T::decode(bytes)
    }

    /// Fetch and verify the raw encoded bytes.
    pub async fn read_bytes(&self) -> CartonResult<Bytes> {
        if let PayloadSource::Inline(bytes) = &self.source {
            return self.checked(bytes.clone());
        }
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.read_bytes_blocking())
            .await
            .map_err(|err| CartonError::io("lazy fetch task failed", std::io::Error::other(err)))?
    }
}

impl<T> LazyValue<T> {
    pub(crate) fn from_parts(source: PayloadSource, digest: Option<ContentDigest>) -> Self {
        Self {
            source,
            digest,
            _marker: PhantomData,
        }
    }

    pub(crate) fn archive_entry(archive: &Arc<PathBuf>, entry: &str, digest: ContentDigest) -> Self {
        Self::from_parts(
            PayloadSource::Archive {
                archive: Arc::clone(archive),
                entry: entry.to_string(),
            },
            Some(digest),
        )
    }

    pub fn source(&self) -> &PayloadSource {
        &self.source
    }

    pub fn digest(&self) -> Option<&ContentDigest> {
        self.digest.as_ref()
    }

    pub(crate) fn read_bytes_blocking(&self) -> CartonResult<Bytes> {
        let bytes = match &self.source {
            PayloadSource::Inline(bytes) => bytes.clone(),
            PayloadSource::File(path) => read_file(path)?,
            PayloadSource::Archive { archive, entry } => {
                tracing::trace!(archive = %archive.display(), %entry, "fetching lazy payload");
                format::read_entry(archive, entry)?
            }
        };
        self.checked(bytes)
    }

    fn checked(&self, bytes: Bytes) -> CartonResult<Bytes> {
        if let Some(digest) = &self.digest {
            digest.verify(&self.source.describe(), &bytes)?;
        }
        Ok(bytes)
    }
}

impl LazyFile {
    /// Reference a file on disk without reading it.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::from_parts(PayloadSource::File(path.into()), None)
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let digest = ContentDigest::sha256_from_bytes(&bytes);
        Self::from_parts(PayloadSource::Inline(bytes), Some(digest))
    }
}

fn read_file(path: &Path) -> CartonResult<Bytes> {
    std::fs::read(path)
        .map(Bytes::from)
        .io_context(|| format!("failed to read {}", path.display()))
}
