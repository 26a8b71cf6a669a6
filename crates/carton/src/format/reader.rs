use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use zip::ZipArchive;

use super::{
    INFO_ENTRY, InfoRecord, MANIFEST_ENTRY, MODEL_PREFIX, Manifest, RUNNER_ENTRY, archive_source,
    open_zip, read_zip_entry,
};
use crate::digest::ContentDigest;
use crate::error::{CartonError, CartonResult, IoContext};
use crate::info::{ModelInfo, RunnerInfo};
use crate::lazy::{LazyFile, LazyValue};

/// Reads the metadata sections of an archive without touching payloads.
///
/// Opening reads the zip central directory; each accessor then reads exactly
/// one (small, deflated) section and checks it against the manifest.
pub struct MetadataReader<R: Read + Seek> {
    zip: ZipArchive<R>,
    label: PathBuf,
}

impl<R: Read + Seek> MetadataReader<R> {
    pub fn new(reader: R, label: &Path) -> CartonResult<Self> {
        Ok(Self {
            zip: open_zip(reader, label)?,
            label: label.to_path_buf(),
        })
    }

    pub fn manifest(&mut self) -> CartonResult<Manifest> {
        let bytes = read_zip_entry(&mut self.zip, &self.label, MANIFEST_ENTRY)?;
        Manifest::decode(&bytes, &self.label)
    }

    /// Decode `info.cbor`; lazy values point back into `archive`.
    pub fn model_info(&mut self, manifest: &Manifest, archive: &Arc<PathBuf>) -> CartonResult<ModelInfo> {
        let bytes = self.section(manifest, INFO_ENTRY)?;
        let record: InfoRecord = serde_cbor::from_slice(&bytes).map_err(|err| {
            CartonError::corrupt(&self.label, format!("{INFO_ENTRY} is invalid: {err}"))
        })?;
        record.into_model_info(manifest, &self.label, archive_source(archive))
    }

    pub fn runner_info(&mut self, manifest: &Manifest) -> CartonResult<RunnerInfo> {
        let bytes = self.section(manifest, RUNNER_ENTRY)?;
        serde_cbor::from_slice(&bytes).map_err(|err| {
            CartonError::corrupt(&self.label, format!("{RUNNER_ENTRY} is invalid: {err}"))
        })
    }

    fn section(&mut self, manifest: &Manifest, name: &str) -> CartonResult<Vec<u8>> {
        let indexed = manifest.entry(name).ok_or_else(|| {
            CartonError::corrupt(&self.label, format!("MANIFEST does not list `{name}`"))
        })?;
        let bytes = read_zip_entry(&mut self.zip, &self.label, name)?;
        let subject = format!("{}!{name}", self.label.display());
        indexed.sha256.verify(&subject, &bytes)?;
        Ok(bytes)
    }
}

/// Metadata of a packed archive, with every payload still on disk.
#[derive(Debug, Clone)]
pub struct PackMetadata {
    pub manifest: Manifest,
    pub info: ModelInfo,
    pub runner: RunnerInfo,
    pub model_files: BTreeMap<String, LazyFile>,
}

/// Read only what `get_model_info` needs: the manifest and `info.cbor`.
pub fn read_model_info(path: &Path) -> CartonResult<ModelInfo> {
    let archive = Arc::new(path.to_path_buf());
    let mut reader = open_reader(path)?;
    let manifest = reader.manifest()?;
    reader.model_info(&manifest, &archive)
}

/// Read all metadata sections of an archive.
pub fn read_pack(path: &Path) -> CartonResult<PackMetadata> {
    let archive = Arc::new(path.to_path_buf());
    let mut reader = open_reader(path)?;
    let manifest = reader.manifest()?;
    let info = reader.model_info(&manifest, &archive)?;
    let runner = reader.runner_info(&manifest)?;
    let model_files = manifest
        .model_entries()
        .map(|(relative, entry)| {
            let name = format!("{MODEL_PREFIX}{relative}");
            (
                relative.to_string(),
                LazyValue::archive_entry(&archive, &name, entry.sha256.clone()),
            )
        })
        .collect();
    Ok(PackMetadata {
        manifest,
        info,
        runner,
        model_files,
    })
}

/// Re-hash every section and compare it with the manifest.
///
/// Used before an archive is admitted to the cache; reads the whole file.
pub fn verify_archive(path: &Path) -> CartonResult<Manifest> {
    let file = File::open(path)
        .io_context(|| format!("failed to open archive {}", path.display()))?;
    let mut zip = open_zip(file, path)?;
    let manifest_bytes = read_zip_entry(&mut zip, path, MANIFEST_ENTRY)?;
    let manifest = Manifest::decode(&manifest_bytes, path)?;

    for name in zip.file_names() {
        if name != MANIFEST_ENTRY && !name.ends_with('/') && manifest.entry(name).is_none() {
            return Err(CartonError::corrupt(
                path,
                format!("entry `{name}` is not listed in MANIFEST"),
            ));
        }
    }

    for (name, indexed) in &manifest.entries {
        let mut entry = zip.by_name(name).map_err(|err| {
            CartonError::corrupt(path, format!("entry `{name}` is unreadable: {err}"))
        })?;
        let mut hasher = Sha256::new();
        let size = io::copy(&mut entry, &mut hasher).map_err(|err| {
            if err.kind() == io::ErrorKind::InvalidData {
                CartonError::corrupt(path, format!("entry `{name}` is damaged: {err}"))
            } else {
                CartonError::io(format!("failed to read `{name}` from {}", path.display()), err)
            }
        })?;
        if size != indexed.size {
            return Err(CartonError::corrupt(
                path,
                format!("entry `{name}` is {size} bytes, MANIFEST says {}", indexed.size),
            ));
        }
        let actual = ContentDigest::from_hasher(hasher);
        indexed
            .sha256
            .expect_eq(&format!("{}!{name}", path.display()), &actual)?;
    }
    tracing::debug!(
        path = %path.display(),
        digest = %manifest.content_hash,
        entries = manifest.entries.len(),
        "verified archive"
    );
    Ok(manifest)
}

fn open_reader(path: &Path) -> CartonResult<MetadataReader<File>> {
    let file = File::open(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            CartonError::ReferenceNotFound {
                reference: path.display().to_string(),
                reason: err.to_string(),
            }
        } else {
            CartonError::io(format!("failed to open archive {}", path.display()), err)
        }
    })?;
    MetadataReader::new(file, path)
}
