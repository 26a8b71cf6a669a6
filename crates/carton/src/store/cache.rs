use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use super::fetch::Download;
use crate::digest::ContentDigest;
use crate::error::{CartonError, CartonResult, IoContext};
use crate::format::Manifest;

const ARCHIVE_FILE: &str = "archive.carton";
const RECORD_FILE: &str = "entry.json";

/// Index record written next to each cached archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub url: String,
    /// Whole-file digest, re-checked on every cache hit.
    pub sha256: ContentDigest,
    pub size: u64,
    pub manifest_sha256: ContentDigest,
    /// Milliseconds since the Unix epoch.
    pub stored_at: u64,
}

impl CacheRecord {
    pub(crate) fn new(url: &Url, download: &Download, manifest: &Manifest) -> Self {
        Self {
            url: url.to_string(),
            sha256: download.sha256.clone(),
            size: download.size,
            manifest_sha256: manifest.content_hash.clone(),
            stored_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|dur| dur.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

pub(crate) struct ArchiveCache {
    root: PathBuf,
    index: Mutex<()>,
}

impl ArchiveCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            index: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Return the cached archive for `key` after re-hashing it.
    ///
    /// A tampered entry is removed and reported; the caller does not retry.
    /// Holds the index lock so a concurrent prune cannot remove the entry
    /// mid-hash.
    pub async fn lookup(&self, key: &str) -> CartonResult<Option<PathBuf>> {
        let _index = self.index.lock().await;
        let dir = self.dir_for(key);
        let Some(record) = read_record(&dir).await? else {
            return Ok(None);
        };
        let archive = dir.join(ARCHIVE_FILE);
        if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            tracing::warn!(path = %dir.display(), "cache entry has no archive, discarding");
            remove_dir(&dir).await?;
            return Ok(None);
        }

        let hashed = archive.clone();
        let actual = tokio::task::spawn_blocking(move || ContentDigest::sha256_of_file(&hashed))
            .await
            .map_err(|err| CartonError::io("cache hashing task failed", io::Error::other(err)))??;
        if let Err(err) = record.sha256.expect_eq(&archive.display().to_string(), &actual) {
            tracing::warn!(path = %archive.display(), error = %err, "cached archive failed verification, discarding");
            remove_dir(&dir).await?;
            return Err(err);
        }
        Ok(Some(archive))
    }

    /// Place a verified download under `key`: the record is written first,
    /// then the archive is renamed into place.
    pub async fn insert(
        &self,
        key: &str,
        record: &CacheRecord,
        download: Download,
    ) -> CartonResult<PathBuf> {
        let _index = self.index.lock().await;
        let dir = self.dir_for(key);
        tokio::fs::create_dir_all(&dir)
            .await
            .io_context(|| format!("failed to create cache dir {}", dir.display()))?;

        let record_bytes = serde_json::to_vec_pretty(record).map_err(CartonError::serialization)?;
        let record_tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        let record_path = dir.join(RECORD_FILE);
        tokio::fs::write(&record_tmp, record_bytes)
            .await
            .io_context(|| format!("failed to write {}", record_tmp.display()))?;
        tokio::fs::rename(&record_tmp, &record_path)
            .await
            .io_context(|| format!("failed to place {}", record_path.display()))?;

        let dest = dir.join(ARCHIVE_FILE);
        download.file.persist(&dest).map_err(|err| {
            CartonError::io(format!("failed to place cached archive at {}", dest.display()), err.error)
        })?;
        Ok(dest)
    }

    pub async fn remove(&self, key: &str) -> CartonResult<bool> {
        let _index = self.index.lock().await;
        remove_dir(&self.dir_for(key)).await
    }

    /// Every readable record with its key, oldest first.
    async fn keyed_records(&self) -> CartonResult<Vec<(String, CacheRecord)>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(CartonError::io(
                    format!("failed to list cache dir {}", self.root.display()),
                    err,
                ));
            }
        };
        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .io_context(|| format!("failed to list cache dir {}", self.root.display()))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().into_owned();
            if let Some(record) = read_record(&path).await? {
                records.push((key, record));
            }
        }
        records.sort_by(|(a_key, a), (b_key, b)| {
            a.stored_at.cmp(&b.stored_at).then_with(|| a_key.cmp(b_key))
        });
        Ok(records)
    }

    pub async fn records(&self) -> CartonResult<Vec<CacheRecord>> {
        let _index = self.index.lock().await;
        Ok(self
            .keyed_records()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Evict oldest entries (never `keep`) until at most `max_bytes` remain.
    pub async fn prune(&self, max_bytes: u64, keep: Option<&str>) -> CartonResult<u64> {
        let _index = self.index.lock().await;
        let records = self.keyed_records().await?;
        let mut total: u64 = records.iter().map(|(_, record)| record.size).sum();
        let mut freed = 0;
        for (key, record) in records {
            if total <= max_bytes {
                break;
            }
            if keep == Some(key.as_str()) {
                continue;
            }
            remove_dir(&self.dir_for(&key)).await?;
            tracing::debug!(reference = %record.url, size = record.size, "pruned cached archive");
            total -= record.size;
            freed += record.size;
        }
        Ok(freed)
    }
}

async fn read_record(dir: &Path) -> CartonResult<Option<CacheRecord>> {
    let path = dir.join(RECORD_FILE);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(CartonError::io(format!("failed to read {}", path.display()), err));
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable cache record");
            Ok(None)
        }
    }
}

async fn remove_dir(dir: &Path) -> CartonResult<bool> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CartonError::io(format!("failed to remove {}", dir.display()), err)),
    }
}
