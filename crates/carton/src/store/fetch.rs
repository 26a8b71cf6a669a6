use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::digest::ContentDigest;
use crate::error::{CartonError, CartonResult, IoContext};

pub(crate) struct HttpFetcher {
    client: Client,
}

/// A fully downloaded archive in a staging file. Dropping it deletes the file.
pub(crate) struct Download {
    pub file: NamedTempFile,
    pub sha256: ContentDigest,
    pub size: u64,
}

impl Download {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl HttpFetcher {
    pub fn new(timeout: Option<Duration>) -> CartonResult<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| CartonError::validation(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }

    /// Stream `url` into a staging file under `staging_dir`, hashing as it goes.
    pub async fn download(&self, url: &Url, staging_dir: &Path) -> CartonResult<Download> {
        let failed = |reason: String| CartonError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| failed(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("server responded with {status}")));
        }

        tokio::fs::create_dir_all(staging_dir)
            .await
            .io_context(|| format!("failed to create cache dir {}", staging_dir.display()))?;
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".partial")
            .tempfile_in(staging_dir)
            .io_context(|| format!("failed to allocate staging file in {}", staging_dir.display()))?;
        let handle = staging
            .reopen()
            .io_context(|| format!("failed to open {}", staging.path().display()))?;
        let mut writer = tokio::fs::File::from_std(handle);

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| failed(err.to_string()))?
        {
            hasher.update(&chunk);
            size += chunk.len() as u64;
            writer
                .write_all(&chunk)
                .await
                .io_context(|| format!("failed to write {}", staging.path().display()))?;
        }
        writer
            .flush()
            .await
            .io_context(|| format!("failed to flush {}", staging.path().display()))?;
        writer
            .sync_all()
            .await
            .io_context(|| format!("failed to sync {}", staging.path().display()))?;

        tracing::debug!(reference = %url, size, "downloaded archive");
        Ok(Download {
            file: staging,
            sha256: ContentDigest::from_hasher(hasher),
            size,
        })
    }
}
