use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{
    ExampleRecord, FILE_PREFIX, INFO_ENTRY, InfoRecord, MANIFEST_ENTRY, MISC_PREFIX,
    MODEL_PREFIX, Manifest, ManifestEntry, RUNNER_ENTRY, SelfTestRecord, SlotRecord,
    TENSOR_PREFIX,
};
use crate::digest::ContentDigest;
use crate::error::{CartonError, CartonResult, IoContext};
use crate::info::{ModelInfo, RunnerInfo, TensorOrMisc, validate_relative_path};
use crate::lazy::{LazyFile, LazyValue, PayloadSource};

/// Bytes of one section, either in memory or still on disk.
#[derive(Debug, Clone)]
pub(crate) enum EntryBody {
    Inline(Bytes),
    File(PathBuf),
}

#[derive(Debug, Clone)]
struct PlannedEntry {
    name: String,
    body: EntryBody,
    compressed: bool,
}

/// Everything needed to write an archive, computed without writing one.
///
/// `load_unpacked` stops here and addresses payloads through the plan;
/// `pack` hands the plan to [`write_archive`].
#[derive(Debug, Clone)]
pub(crate) struct PackPlan {
    pub manifest: Manifest,
    pub runner: RunnerInfo,
    record: InfoRecord,
    manifest_bytes: Bytes,
    sections: Vec<PlannedEntry>,
    bodies: BTreeMap<String, EntryBody>,
    source: PathBuf,
}

impl PackPlan {
    /// Validate the metadata, digest every payload, and seal a manifest.
    pub(crate) fn build(source: &Path, info: &ModelInfo, runner: &RunnerInfo) -> CartonResult<Self> {
        info.validate()?;
        runner.validate()?;

        let mut planner = Planner::default();
        for (relative, path) in model_files(source)? {
            planner.add_file(format!("{MODEL_PREFIX}{relative}"), path)?;
        }
        let record = planner.record(info)?;

        let info_bytes = encode(&record)?;
        let runner_bytes = encode(runner)?;
        let mut sections = vec![
            PlannedEntry {
                name: INFO_ENTRY.to_string(),
                body: EntryBody::Inline(info_bytes.clone()),
                compressed: true,
            },
            PlannedEntry {
                name: RUNNER_ENTRY.to_string(),
                body: EntryBody::Inline(runner_bytes.clone()),
                compressed: true,
            },
        ];

        let mut entries = planner.entries;
        entries.insert(INFO_ENTRY.to_string(), inline_entry(&info_bytes));
        entries.insert(RUNNER_ENTRY.to_string(), inline_entry(&runner_bytes));
        sections.extend(planner.payloads);

        let (manifest, manifest_bytes) = Manifest::seal(entries)?;
        let bodies = sections
            .iter()
            .map(|section| (section.name.clone(), section.body.clone()))
            .collect();
        tracing::debug!(
            source = %source.display(),
            digest = %manifest.content_hash,
            sections = sections.len(),
            "planned pack"
        );
        Ok(Self {
            manifest,
            runner: runner.clone(),
            record,
            manifest_bytes,
            sections,
            bodies,
            source: source.to_path_buf(),
        })
    }

    /// `ModelInfo` whose lazy values read straight from the pack sources.
    pub(crate) fn model_info(&self) -> CartonResult<ModelInfo> {
        self.record
            .clone()
            .into_model_info(&self.manifest, &self.source, |entry| self.source_of(entry))
    }

    /// Model payload files addressed in place.
    pub(crate) fn model_files(&self) -> BTreeMap<String, LazyFile> {
        self.manifest
            .model_entries()
            .map(|(relative, entry)| {
                let name = format!("{MODEL_PREFIX}{relative}");
                (
                    relative.to_string(),
                    LazyValue::from_parts(self.source_of(&name), Some(entry.sha256.clone())),
                )
            })
            .collect()
    }

    fn source_of(&self, entry: &str) -> PayloadSource {
        match self.bodies.get(entry) {
            Some(EntryBody::File(path)) => PayloadSource::File(path.clone()),
            Some(EntryBody::Inline(bytes)) => PayloadSource::Inline(bytes.clone()),
            // Sealed manifests only name planned sections.
            None => PayloadSource::Inline(Bytes::new()),
        }
    }
}

/// Write a planned pack to `dest` atomically: a staging file next to the
/// destination is renamed into place once complete.
pub(crate) fn write_archive(plan: &PackPlan, dest: &Path) -> CartonResult<()> {
    let parent = dest
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .io_context(|| format!("failed to create {}", parent.display()))?;
    let mut staging = tempfile::Builder::new()
        .prefix(".carton-")
        .suffix(".partial")
        .tempfile_in(parent)
        .io_context(|| format!("failed to stage archive in {}", parent.display()))?;

    {
        let mut zip = ZipWriter::new(staging.as_file_mut());
        let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file(MANIFEST_ENTRY, deflated)
            .map_err(|err| write_error(dest, err))?;
        zip.write_all(&plan.manifest_bytes)
            .io_context(|| format!("failed to write MANIFEST to {}", dest.display()))?;

        for section in &plan.sections {
            let size = plan
                .manifest
                .entry(&section.name)
                .map(|entry| entry.size)
                .unwrap_or_default();
            let options = if section.compressed {
                deflated
            } else {
                FileOptions::default()
                    .compression_method(CompressionMethod::Stored)
                    .large_file(size >= u64::from(u32::MAX))
            };
            zip.start_file(section.name.as_str(), options)
                .map_err(|err| write_error(dest, err))?;
            match &section.body {
                EntryBody::Inline(bytes) => zip
                    .write_all(bytes)
                    .io_context(|| format!("failed to write {}", section.name))?,
                EntryBody::File(path) => {
                    let mut file = File::open(path)
                        .io_context(|| format!("failed to open {}", path.display()))?;
                    io::copy(&mut file, &mut zip)
                        .io_context(|| format!("failed to copy {} into archive", path.display()))?;
                }
            }
        }
        zip.finish().map_err(|err| write_error(dest, err))?;
    }

    staging
        .as_file()
        .sync_all()
        .io_context(|| format!("failed to flush archive for {}", dest.display()))?;
    staging
        .persist(dest)
        .map_err(|err| CartonError::io(format!("failed to place archive at {}", dest.display()), err.error))?;
    tracing::info!(path = %dest.display(), digest = %plan.manifest.content_hash, "wrote archive");
    Ok(())
}

#[derive(Default)]
struct Planner {
    entries: BTreeMap<String, ManifestEntry>,
    payloads: Vec<PlannedEntry>,
    by_digest: HashMap<(&'static str, ContentDigest), String>,
    next_tensor: usize,
    next_file: usize,
}

impl Planner {
    fn record(&mut self, info: &ModelInfo) -> CartonResult<InfoRecord> {
        let mut self_tests = Vec::with_capacity(info.self_tests.len());
        for test in &info.self_tests {
            self_tests.push(SelfTestRecord {
                name: test.name.clone(),
                description: test.description.clone(),
                inputs: self.tensor_map(&test.inputs)?,
                expected_out: test
                    .expected_out
                    .as_ref()
                    .map(|map| self.tensor_map(map))
                    .transpose()?,
            });
        }

        let mut examples = Vec::with_capacity(info.examples.len());
        for example in &info.examples {
            examples.push(ExampleRecord {
                name: example.name.clone(),
                description: example.description.clone(),
                inputs: self.slot_map(&example.inputs)?,
                sample_out: self.slot_map(&example.sample_out)?,
            });
        }

        let mut misc_files = BTreeMap::new();
        for (path, lazy) in &info.misc_files {
            let name = format!("{MISC_PREFIX}{}", validate_relative_path(path)?);
            let (body, entry) = materialize(lazy)?;
            self.insert(name.clone(), body, entry);
            misc_files.insert(path.clone(), name);
        }

        Ok(InfoRecord {
            model_name: info.model_name.clone(),
            short_description: info.short_description.clone(),
            model_description: info.model_description.clone(),
            license: info.license.clone(),
            repository: info.repository.clone(),
            homepage: info.homepage.clone(),
            required_platforms: info.required_platforms.clone(),
            inputs: info.inputs.clone(),
            outputs: info.outputs.clone(),
            self_tests,
            examples,
            misc_files,
        })
    }

    fn tensor_map<T>(
        &mut self,
        map: &BTreeMap<String, LazyValue<T>>,
    ) -> CartonResult<BTreeMap<String, String>> {
        map.iter()
            .map(|(key, lazy)| Ok((key.clone(), self.add_lazy(TENSOR_PREFIX, lazy)?)))
            .collect()
    }

    fn slot_map(
        &mut self,
        map: &BTreeMap<String, TensorOrMisc>,
    ) -> CartonResult<BTreeMap<String, SlotRecord>> {
        map.iter()
            .map(|(key, slot)| {
                let record = match slot {
                    TensorOrMisc::Tensor(lazy) => SlotRecord::Tensor(self.add_lazy(TENSOR_PREFIX, lazy)?),
                    TensorOrMisc::Misc(lazy) => SlotRecord::Misc(self.add_lazy(FILE_PREFIX, lazy)?),
                };
                Ok((key.clone(), record))
            })
            .collect()
    }

    /// Store a lazy payload once per distinct content and prefix.
    fn add_lazy<T>(&mut self, prefix: &'static str, lazy: &LazyValue<T>) -> CartonResult<String> {
        let (body, entry) = materialize(lazy)?;
        let key = (prefix, entry.sha256.clone());
        if let Some(existing) = self.by_digest.get(&key) {
            return Ok(existing.clone());
        }
        let counter = if prefix == TENSOR_PREFIX {
            &mut self.next_tensor
        } else {
            &mut self.next_file
        };
        let name = format!("{prefix}{counter}");
        *counter += 1;
        self.by_digest.insert(key, name.clone());
        self.insert(name.clone(), body, entry);
        Ok(name)
    }

    fn add_file(&mut self, name: String, path: PathBuf) -> CartonResult<()> {
        let entry = file_entry(&path)?;
        self.insert(name, EntryBody::File(path), entry);
        Ok(())
    }

    fn insert(&mut self, name: String, body: EntryBody, entry: ManifestEntry) {
        self.entries.insert(name.clone(), entry);
        self.payloads.push(PlannedEntry {
            name,
            body,
            compressed: false,
        });
    }
}

/// Resolve a lazy value into a section body, checking any digest it carries.
fn materialize<T>(lazy: &LazyValue<T>) -> CartonResult<(EntryBody, ManifestEntry)> {
    match lazy.source() {
        PayloadSource::File(path) => {
            let entry = file_entry(path)?;
            if let Some(expected) = lazy.digest() {
                expected.expect_eq(&path.display().to_string(), &entry.sha256)?;
            }
            Ok((EntryBody::File(path.clone()), entry))
        }
        PayloadSource::Inline(_) | PayloadSource::Archive { .. } => {
            let bytes = lazy.read_bytes_blocking()?;
            let entry = inline_entry(&bytes);
            Ok((EntryBody::Inline(bytes), entry))
        }
    }
}

fn file_entry(path: &Path) -> CartonResult<ManifestEntry> {
    let size = fs::metadata(path)
        .io_context(|| format!("failed to stat {}", path.display()))?
        .len();
    Ok(ManifestEntry {
        sha256: ContentDigest::sha256_of_file(path)?,
        size,
    })
}

fn inline_entry(bytes: &[u8]) -> ManifestEntry {
    ManifestEntry {
        sha256: ContentDigest::sha256_from_bytes(bytes),
        size: bytes.len() as u64,
    }
}

fn encode<T: serde::Serialize>(value: &T) -> CartonResult<Bytes> {
    serde_cbor::to_vec(value)
        .map(Bytes::from)
        .map_err(CartonError::serialization)
}

/// Every regular file under `source` (or `source` itself), keyed by a
/// `/`-separated relative path, in sorted order.
fn model_files(source: &Path) -> CartonResult<Vec<(String, PathBuf)>> {
    let metadata = fs::metadata(source).map_err(|err| CartonError::ReferenceNotFound {
        reference: source.display().to_string(),
        reason: err.to_string(),
    })?;
    if metadata.is_file() {
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        return Ok(vec![(name, source.to_path_buf())]);
    }

    let mut files = Vec::new();
    let mut pending = vec![source.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .io_context(|| format!("failed to list {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .io_context(|| format!("failed to list {}", dir.display()))?
                .path();
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                let relative = path.strip_prefix(source).unwrap_or(path.as_path());
                files.push((normalize_relative(relative), path));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn normalize_relative(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn write_error(dest: &Path, err: zip::result::ZipError) -> CartonError {
    match err {
        zip::result::ZipError::Io(io) => {
            CartonError::io(format!("failed to write archive {}", dest.display()), io)
        }
        other => CartonError::corrupt(dest, other.to_string()),
    }
}
