//! Archive store: turns a pack reference into a verified local file.
//!
//! Local paths are returned as-is after an existence check. URLs are cached
//! under `<cache_dir>/<sha256(url)>/`, verified on every hit, and downloaded at
//! most once at a time per URL.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use url::Url;

use crate::digest::ContentDigest;
use crate::env::CartonConfig;
use crate::error::{CartonError, CartonResult};
use crate::format;

mod cache;
mod fetch;

pub use cache::CacheRecord;

use cache::ArchiveCache;
use fetch::HttpFetcher;

/// Where a pack comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackReference {
    Local(PathBuf),
    Remote(Url),
}

impl PackReference {
    /// `http://` and `https://` are remote; `file://` URLs and anything else
    /// are local paths.
    pub fn parse(value: &str) -> CartonResult<Self> {
        if value.starts_with("http://") || value.starts_with("https://") {
            let url = Url::parse(value).map_err(|err| CartonError::ReferenceNotFound {
                reference: value.to_string(),
                reason: format!("not a valid URL: {err}"),
            })?;
            return Ok(Self::Remote(url));
        }
        if value.starts_with("file://") {
            let path = Url::parse(value)
                .ok()
                .and_then(|url| url.to_file_path().ok())
                .ok_or_else(|| CartonError::ReferenceNotFound {
                    reference: value.to_string(),
                    reason: "not a valid file:// URL".to_string(),
                })?;
            return Ok(Self::Local(path));
        }
        if value.trim().is_empty() {
            return Err(CartonError::ReferenceNotFound {
                reference: value.to_string(),
                reason: "empty reference".to_string(),
            });
        }
        Ok(Self::Local(PathBuf::from(value)))
    }

    /// Key of the cache entry backing a remote reference.
    pub fn cache_key(&self) -> Option<String> {
        match self {
            Self::Local(_) => None,
            Self::Remote(url) => Some(cache_key(url)),
        }
    }
}

impl FromStr for PackReference {
    type Err = CartonError;

    fn from_str(value: &str) -> CartonResult<Self> {
        Self::parse(value)
    }
}

impl From<PathBuf> for PackReference {
    fn from(path: PathBuf) -> Self {
        Self::Local(path)
    }
}

impl From<&Path> for PackReference {
    fn from(path: &Path) -> Self {
        Self::Local(path.to_path_buf())
    }
}

impl From<Url> for PackReference {
    fn from(url: Url) -> Self {
        Self::Remote(url)
    }
}

impl fmt::Display for PackReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => f.write_str(url.as_str()),
        }
    }
}

fn cache_key(url: &Url) -> String {
    ContentDigest::sha256_from_bytes(url.as_str().as_bytes())
        .value()
        .to_string()
}

type SharedResolve = Shared<BoxFuture<'static, CartonResult<PathBuf>>>;

/// Content-verified cache of packed archives.
///
/// Cheap to clone; clones share the cache index and the in-flight map.
#[derive(Clone)]
pub struct ArchiveStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    cache: ArchiveCache,
    fetcher: HttpFetcher,
    max_bytes: Option<u64>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
}

struct InFlight {
    id: u64,
    resolve: SharedResolve,
}

impl ArchiveStore {
    pub fn new(cfg: &CartonConfig) -> CartonResult<Self> {
        Ok(Self {
            inner: Arc::new(StoreInner {
                cache: ArchiveCache::new(cfg.cache_dir.clone()),
                fetcher: HttpFetcher::new(cfg.download_timeout)?,
                max_bytes: cfg.cache_max_bytes,
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        self.inner.cache.root()
    }

    /// Resolve `reference` to a local archive path.
    ///
    /// Concurrent calls for the same URL share one download and observe the
    /// same outcome.
    pub async fn resolve(&self, reference: &PackReference) -> CartonResult<PathBuf> {
        match reference {
            PackReference::Local(path) => resolve_local(path).await,
            PackReference::Remote(url) => self.resolve_remote(url).await,
        }
    }

    async fn resolve_remote(&self, url: &Url) -> CartonResult<PathBuf> {
        let key = cache_key(url);
        let pending = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&key) {
                Some(existing) => {
                    tracing::debug!(reference = %url, "joining in-flight resolve");
                    existing.resolve.clone()
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let resolve = spawn_resolve(Arc::clone(&self.inner), url.clone(), key.clone(), id);
                    in_flight.insert(
                        key,
                        InFlight {
                            id,
                            resolve: resolve.clone(),
                        },
                    );
                    resolve
                }
            }
        };
        pending.await
    }

    /// Drop the cached archive for `reference`. Returns whether one existed.
    pub async fn evict(&self, reference: &PackReference) -> CartonResult<bool> {
        match reference.cache_key() {
            Some(key) => self.inner.cache.remove(&key).await,
            None => Ok(false),
        }
    }

    /// Remove oldest entries until the cache holds at most `max_bytes`.
    /// Returns the number of bytes freed.
    pub async fn prune(&self, max_bytes: u64) -> CartonResult<u64> {
        self.inner.cache.prune(max_bytes, None).await
    }

    /// Records of every cached archive, oldest first.
    pub async fn entries(&self) -> CartonResult<Vec<CacheRecord>> {
        self.inner.cache.records().await
    }
}

impl fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveStore")
            .field("cache_dir", &self.inner.cache.root())
            .field("max_bytes", &self.inner.max_bytes)
            .finish()
    }
}

impl StoreInner {
    async fn fetch_or_reuse(&self, url: &Url, key: &str) -> CartonResult<PathBuf> {
        if let Some(path) = self.cache.lookup(key).await? {
            tracing::debug!(reference = %url, path = %path.display(), "archive cache hit");
            return Ok(path);
        }

        let download = self.fetcher.download(url, self.cache.root()).await?;
        let staged = download.path().to_path_buf();
        let manifest = tokio::task::spawn_blocking(move || format::verify_archive(&staged))
            .await
            .map_err(|err| CartonError::io("archive verification task failed", io::Error::other(err)))??;

        let record = CacheRecord::new(url, &download, &manifest);
        let path = self.cache.insert(key, &record, download).await?;
        tracing::info!(
            reference = %url,
            path = %path.display(),
            digest = %record.manifest_sha256,
            size = record.size,
            "cached archive"
        );

        if let Some(max_bytes) = self.max_bytes {
            self.cache.prune(max_bytes, Some(key)).await?;
        }
        Ok(path)
    }
}

/// Run one fetch on its own task so an abandoned caller never strands a
/// half-finished download. The task clears its in-flight slot when done.
fn spawn_resolve(inner: Arc<StoreInner>, url: Url, key: String, id: u64) -> SharedResolve {
    let task = tokio::spawn(async move {
        let result = inner.fetch_or_reuse(&url, &key).await;
        let mut in_flight = inner.in_flight.lock();
        if in_flight.get(&key).is_some_and(|current| current.id == id) {
            in_flight.remove(&key);
        }
        result
    });
    async move {
        match task.await {
            Ok(result) => result,
            Err(err) => Err(CartonError::io("archive resolve task failed", io::Error::other(err))),
        }
    }
    .boxed()
    .shared()
}

async fn resolve_local(path: &Path) -> CartonResult<PathBuf> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|err| CartonError::ReferenceNotFound {
            reference: path.display().to_string(),
            reason: err.to_string(),
        })?;
    if !metadata.is_file() {
        return Err(CartonError::ReferenceNotFound {
            reference: path.display().to_string(),
            reason: "not a regular file".to_string(),
        });
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_kinds() {
        assert!(matches!(
            PackReference::parse("https://example.com/model.carton").unwrap(),
            PackReference::Remote(_)
        ));
        assert_eq!(
            PackReference::parse("file:///tmp/model.carton").unwrap(),
            PackReference::Local(PathBuf::from("/tmp/model.carton"))
        );
        assert_eq!(
            PackReference::parse("./model.carton").unwrap(),
            PackReference::Local(PathBuf::from("./model.carton"))
        );
        assert!(PackReference::parse("").is_err());
    }

    #[test]
    fn cache_key_depends_on_full_url() {
        let a = PackReference::parse("https://example.com/a.carton").unwrap();
        let b = PackReference::parse("https://example.com/a.carton?v=2").unwrap();
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key().map(|key| key.len()), Some(64));
        assert_eq!(PackReference::Local("x".into()).cache_key(), None);
    }

    #[tokio::test]
    async fn local_directories_are_not_archives() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_local(dir.path()).await.unwrap_err();
        assert!(matches!(err, CartonError::ReferenceNotFound { .. }));
    }
}
