//! On-disk layout of a `.carton` archive.
//!
//! A pack is a zip container. `MANIFEST` indexes every other entry by sha256
//! and length; the archive's content hash is the sha256 of the manifest
//! bytes, so it transitively covers every section. Metadata entries
//! (`MANIFEST`, `info.cbor`, `runner.cbor`) are written first and deflated;
//! payload entries are stored uncompressed so each occupies one contiguous,
//! independently addressable byte range.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::digest::ContentDigest;
use crate::error::{CartonError, CartonResult, IoContext};
use crate::info::{Example, ModelInfo, SelfTest, TensorOrMisc, TensorSpec};
use crate::lazy::{LazyValue, PayloadSource};

pub mod reader;
pub(crate) mod writer;

pub use reader::{MetadataReader, PackMetadata, read_model_info, read_pack, verify_archive};

pub const FORMAT_VERSION: u32 = 1;

pub const MANIFEST_ENTRY: &str = "MANIFEST";
pub const INFO_ENTRY: &str = "info.cbor";
pub const RUNNER_ENTRY: &str = "runner.cbor";
pub const MODEL_PREFIX: &str = "model/";
pub const MISC_PREFIX: &str = "misc/";
pub const TENSOR_PREFIX: &str = "tensors/";
pub const FILE_PREFIX: &str = "files/";

/// Index entry for one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sha256: ContentDigest,
    pub size: u64,
}

/// Archive-level record: format version, content hash, and section index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub format_version: u32,
    pub content_hash: ContentDigest,
    pub entries: BTreeMap<String, ManifestEntry>,
}

#[derive(Serialize, Deserialize)]
struct ManifestRecord {
    format_version: u32,
    entries: BTreeMap<String, ManifestEntry>,
}

#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

impl Manifest {
    /// Serialize the index and derive the content hash from those bytes.
    pub(crate) fn seal(entries: BTreeMap<String, ManifestEntry>) -> CartonResult<(Self, Bytes)> {
        let record = ManifestRecord {
            format_version: FORMAT_VERSION,
            entries,
        };
        let bytes = serde_cbor::to_vec(&record).map_err(CartonError::serialization)?;
        let manifest = Self {
            format_version: record.format_version,
            content_hash: ContentDigest::sha256_from_bytes(&bytes),
            entries: record.entries,
        };
        Ok((manifest, Bytes::from(bytes)))
    }

    pub(crate) fn decode(bytes: &[u8], archive: &Path) -> CartonResult<Self> {
        let probe: VersionProbe = serde_cbor::from_slice(bytes)
            .map_err(|err| CartonError::corrupt(archive, format!("MANIFEST is unreadable: {err}")))?;
        if probe.format_version != FORMAT_VERSION {
            return Err(CartonError::UnsupportedFormat {
                archive: archive.display().to_string(),
                version: probe.format_version,
            });
        }
        let record: ManifestRecord = serde_cbor::from_slice(bytes)
            .map_err(|err| CartonError::corrupt(archive, format!("MANIFEST is invalid: {err}")))?;
        Ok(Self {
            format_version: record.format_version,
            content_hash: ContentDigest::sha256_from_bytes(bytes),
            entries: record.entries,
        })
    }

    pub fn entry(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.get(name)
    }

    /// Entries holding the original model payload, keyed by relative path.
    pub fn model_entries(&self) -> impl Iterator<Item = (&str, &ManifestEntry)> {
        self.entries.iter().filter_map(|(name, entry)| {
            name.strip_prefix(MODEL_PREFIX)
                .map(|relative| (relative, entry))
        })
    }
}

/// Serialized `ModelInfo`: lazy values are replaced by entry names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct InfoRecord {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub model_description: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub required_platforms: BTreeSet<String>,
    #[serde(default)]
    pub inputs: Vec<TensorSpec>,
    #[serde(default)]
    pub outputs: Vec<TensorSpec>,
    #[serde(default)]
    pub self_tests: Vec<SelfTestRecord>,
    #[serde(default)]
    pub examples: Vec<ExampleRecord>,
    #[serde(default)]
    pub misc_files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SelfTestRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub expected_out: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ExampleRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub inputs: BTreeMap<String, SlotRecord>,
    #[serde(default)]
    pub sample_out: BTreeMap<String, SlotRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SlotRecord {
    Tensor(String),
    Misc(String),
}

impl InfoRecord {
    /// Rebuild a `ModelInfo`, turning every entry name into a lazy handle
    /// whose digest comes from the manifest.
    pub(crate) fn into_model_info<F>(
        self,
        manifest: &Manifest,
        archive: &Path,
        locate: F,
    ) -> CartonResult<ModelInfo>
    where
        F: Fn(&str) -> PayloadSource,
    {
        let entries = EntryResolver {
            manifest,
            archive,
            locate,
        };

        let self_tests = self
            .self_tests
            .into_iter()
            .map(|test| {
                Ok(SelfTest {
                    name: test.name,
                    description: test.description,
                    inputs: entries.lazy_map(test.inputs)?,
                    expected_out: test
                        .expected_out
                        .map(|map| entries.lazy_map(map))
                        .transpose()?,
                })
            })
            .collect::<CartonResult<Vec<_>>>()?;
        let examples = self
            .examples
            .into_iter()
            .map(|example| {
                Ok(Example {
                    name: example.name,
                    description: example.description,
                    inputs: entries.slot_map(example.inputs)?,
                    sample_out: entries.slot_map(example.sample_out)?,
                })
            })
            .collect::<CartonResult<Vec<_>>>()?;

        Ok(ModelInfo {
            model_name: self.model_name,
            short_description: self.short_description,
            model_description: self.model_description,
            license: self.license,
            repository: self.repository,
            homepage: self.homepage,
            required_platforms: self.required_platforms,
            inputs: self.inputs,
            outputs: self.outputs,
            self_tests,
            examples,
            misc_files: entries.lazy_map(self.misc_files)?,
            manifest_sha256: Some(manifest.content_hash.clone()),
        })
    }
}

struct EntryResolver<'a, F> {
    manifest: &'a Manifest,
    archive: &'a Path,
    locate: F,
}

impl<F> EntryResolver<'_, F>
where
    F: Fn(&str) -> PayloadSource,
{
    fn lazy<T>(&self, entry: &str) -> CartonResult<LazyValue<T>> {
        let indexed = self.manifest.entry(entry).ok_or_else(|| {
            CartonError::corrupt(
                self.archive,
                format!("info.cbor references missing entry `{entry}`"),
            )
        })?;
        Ok(LazyValue::from_parts(
            (self.locate)(entry),
            Some(indexed.sha256.clone()),
        ))
    }

    fn lazy_map<T>(
        &self,
        map: BTreeMap<String, String>,
    ) -> CartonResult<BTreeMap<String, LazyValue<T>>> {
        map.into_iter()
            .map(|(key, entry)| Ok((key, self.lazy(&entry)?)))
            .collect()
    }

    fn slot_map(
        &self,
        map: BTreeMap<String, SlotRecord>,
    ) -> CartonResult<BTreeMap<String, TensorOrMisc>> {
        map.into_iter()
            .map(|(key, slot)| {
                let value = match slot {
                    SlotRecord::Tensor(entry) => TensorOrMisc::Tensor(self.lazy(&entry)?),
                    SlotRecord::Misc(entry) => TensorOrMisc::Misc(self.lazy(&entry)?),
                };
                Ok((key, value))
            })
            .collect()
    }
}

/// Read one entry of an archive on disk.
pub(crate) fn read_entry(archive: &Path, entry: &str) -> CartonResult<Bytes> {
    let file = File::open(archive)
        .io_context(|| format!("failed to open archive {}", archive.display()))?;
    let mut zip = open_zip(file, archive)?;
    read_zip_entry(&mut zip, archive, entry).map(Bytes::from)
}

pub(crate) fn open_zip<R: Read + Seek>(reader: R, archive: &Path) -> CartonResult<ZipArchive<R>> {
    ZipArchive::new(reader).map_err(|err| zip_error(err, archive, "archive"))
}

pub(crate) fn read_zip_entry<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    archive: &Path,
    entry: &str,
) -> CartonResult<Vec<u8>> {
    let mut file = zip
        .by_name(entry)
        .map_err(|err| zip_error(err, archive, entry))?;
    let mut buf = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::InvalidData {
            CartonError::corrupt(archive, format!("entry `{entry}` is damaged: {err}"))
        } else {
            CartonError::io(format!("failed to read `{entry}` from {}", archive.display()), err)
        }
    })?;
    Ok(buf)
}

fn zip_error(err: ZipError, archive: &Path, what: &str) -> CartonError {
    match err {
        ZipError::Io(io) => {
            CartonError::io(format!("failed to read {what} in {}", archive.display()), io)
        }
        ZipError::FileNotFound => CartonError::corrupt(archive, format!("entry `{what}` is missing")),
        other => CartonError::corrupt(archive, format!("{what}: {other}")),
    }
}

pub(crate) fn archive_source(archive: &Arc<PathBuf>) -> impl Fn(&str) -> PayloadSource + '_ {
    move |entry| PayloadSource::Archive {
        archive: Arc::clone(archive),
        entry: entry.to_string(),
    }
}
