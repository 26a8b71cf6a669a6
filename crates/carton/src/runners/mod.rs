//! Installed runner catalog and the pure matching function that picks one
//! for a pack.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_yaml_bw as serde_yaml;

use crate::device::Device;
use crate::error::{CartonError, CartonResult, IoContext};
use crate::info::{ModelInfo, RunnerInfo, RunnerOpt};
use crate::lazy::LazyFile;
use crate::load::LoadOpts;
use crate::tensor::Tensor;

mod version;

pub use version::{VersionRange, parse_loose_version};

/// Descriptor of one installed runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerDescriptor {
    pub runner_name: String,
    /// Version of the ML framework this runner executes.
    #[serde(with = "version::loose_version")]
    pub framework_version: Version,
    /// Distinguishes incompatible implementations sharing a name.
    #[serde(with = "version::loose_version")]
    pub runner_compat_version: Version,
}

impl RunnerDescriptor {
    pub fn new(
        runner_name: impl Into<String>,
        framework_version: &str,
        runner_compat_version: &str,
    ) -> CartonResult<Self> {
        Ok(Self {
            runner_name: runner_name.into(),
            framework_version: parse_loose_version(framework_version)?,
            runner_compat_version: parse_loose_version(runner_compat_version)?,
        })
    }
}

impl fmt::Display for RunnerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (framework {}, compat {})",
            self.runner_name, self.framework_version, self.runner_compat_version
        )
    }
}

/// What a backend sees when asked to run a model.
pub struct InferenceContext<'a> {
    pub runner: &'a ResolvedRunner,
    pub device: &'a Device,
    pub info: &'a ModelInfo,
    /// Model payload files keyed by their path relative to the packed source.
    pub model_files: &'a BTreeMap<String, LazyFile>,
}

/// Execution seam for an installed runner.
#[async_trait]
pub trait RunnerBackend: Send + Sync {
    async fn infer(
        &self,
        ctx: &InferenceContext<'_>,
        inputs: BTreeMap<String, Tensor>,
    ) -> CartonResult<BTreeMap<String, Tensor>>;
}

#[derive(Clone)]
struct InstalledRunner {
    descriptor: RunnerDescriptor,
    backend: Option<Arc<dyn RunnerBackend>>,
}

/// The runner chosen for a load, with its effective options.
#[derive(Clone)]
pub struct ResolvedRunner {
    pub descriptor: RunnerDescriptor,
    pub required_framework_version: VersionRange,
    pub opts: BTreeMap<String, RunnerOpt>,
    backend: Option<Arc<dyn RunnerBackend>>,
}

impl ResolvedRunner {
    pub fn backend(&self) -> Option<&Arc<dyn RunnerBackend>> {
        self.backend.as_ref()
    }
}

impl PartialEq for ResolvedRunner {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor
            && self.required_framework_version == other.required_framework_version
            && self.opts == other.opts
    }
}

impl fmt::Debug for ResolvedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedRunner")
            .field("descriptor", &self.descriptor)
            .field("required_framework_version", &self.required_framework_version)
            .field("opts", &self.opts)
            .field("has_backend", &self.backend.is_some())
            .finish()
    }
}

/// Flat table of installed runners.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: Vec<InstalledRunner>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor without an execution backend (metadata only).
    pub fn register(&mut self, descriptor: RunnerDescriptor) {
        self.runners.push(InstalledRunner {
            descriptor,
            backend: None,
        });
    }

    pub fn register_with_backend(
        &mut self,
        descriptor: RunnerDescriptor,
        backend: Arc<dyn RunnerBackend>,
    ) {
        self.runners.push(InstalledRunner {
            descriptor,
            backend: Some(backend),
        });
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &RunnerDescriptor> {
        self.runners.iter().map(|runner| &runner.descriptor)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Load every descriptor file (`*.yaml`, `*.yml`, `*.json`, or
    /// `<dir>/runner.yaml`) from an install directory, in file-name order.
    pub fn discover(dir: &Path) -> CartonResult<Self> {
        let mut files = Vec::new();
        let entries = fs::read_dir(dir)
            .io_context(|| format!("failed to list runner directory {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .io_context(|| format!("failed to read runner directory {}", dir.display()))?
                .path();
            if path.is_dir() {
                let nested = path.join("runner.yaml");
                if nested.is_file() {
                    files.push(nested);
                }
            } else if is_descriptor_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut registry = Self::new();
        for file in files {
            let raw = fs::read_to_string(&file)
                .io_context(|| format!("failed to read runner descriptor {}", file.display()))?;
            let descriptor: RunnerDescriptor = serde_yaml::from_str(&raw).map_err(|err| {
                CartonError::validation(format!(
                    "runner descriptor {} is invalid: {err}",
                    file.display()
                ))
            })?;
            tracing::debug!(runner = %descriptor, path = %file.display(), "discovered runner");
            registry.register(descriptor);
        }
        Ok(registry)
    }

    /// Pick the runner for `requirement`, honouring the caller's overrides.
    ///
    /// Filters by name, then compat tag, then framework version; the highest
    /// framework version wins, then the highest compat tag, then the earliest
    /// registration.
    pub fn select(
        &self,
        requirement: &RunnerInfo,
        overrides: &LoadOpts,
    ) -> CartonResult<ResolvedRunner> {
        let runner_name = overrides
            .override_runner_name
            .as_deref()
            .unwrap_or(requirement.runner_name.as_str());
        let range = overrides
            .override_required_framework_version
            .as_ref()
            .unwrap_or(&requirement.required_framework_version);
        let compat = requirement.runner_compat_version.as_ref();

        let chosen = self
            .runners
            .iter()
            .enumerate()
            .filter(|(_, runner)| runner.descriptor.runner_name == runner_name)
            .filter(|(_, runner)| {
                compat.is_none_or(|req| req.matches(&runner.descriptor.runner_compat_version))
            })
            .filter(|(_, runner)| range.matches(&runner.descriptor.framework_version))
            .max_by(|(a_idx, a), (b_idx, b)| prefer(a, *a_idx, b, *b_idx));

        let Some((_, runner)) = chosen else {
            return Err(CartonError::NoCompatibleRunner {
                runner_name: runner_name.to_string(),
                required_framework_version: range.to_string(),
                runner_compat_version: compat.map(ToString::to_string),
            });
        };

        let opts = merge_opts(&requirement.opts, overrides.override_runner_opts.as_ref());
        tracing::debug!(runner = %runner.descriptor, range = %range, "selected runner");
        Ok(ResolvedRunner {
            descriptor: runner.descriptor.clone(),
            required_framework_version: range.clone(),
            opts,
            backend: runner.backend.clone(),
        })
    }
}

fn prefer(a: &InstalledRunner, a_idx: usize, b: &InstalledRunner, b_idx: usize) -> Ordering {
    a.descriptor
        .framework_version
        .cmp(&b.descriptor.framework_version)
        .then_with(|| {
            a.descriptor
                .runner_compat_version
                .cmp(&b.descriptor.runner_compat_version)
        })
        // Earlier registration wins, so a smaller index must compare greater.
        .then_with(|| b_idx.cmp(&a_idx))
}

/// Flat, per-key overlay: override values win, untouched keys keep the
/// packed value.
pub fn merge_opts(
    packed: &BTreeMap<String, RunnerOpt>,
    overrides: Option<&BTreeMap<String, RunnerOpt>>,
) -> BTreeMap<String, RunnerOpt> {
    let mut merged = packed.clone();
    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn is_descriptor_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.runners.iter().map(|runner| &runner.descriptor))
            .finish()
    }
}
