//! Pack, load, and inspect models.
//!
//! [`PackManager`] ties the archive store, the pack format, the runner
//! registry, and the device resolver together. A loaded [`Model`] is bound to
//! one runner, one device, and its effective runner options.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::device::{Device, DeviceRequest, DeviceResolver, GpuInfo, StaticGpus};
use crate::env::CartonConfig;
use crate::error::{CartonError, CartonResult};
use crate::format::writer::{PackPlan, write_archive};
use crate::format::{self, PackMetadata};
use crate::info::{Dimension, ModelInfo, RunnerInfo, RunnerOpt, Shape, TensorSpec};
use crate::lazy::{LazyFile, LazyTensor};
use crate::runners::{InferenceContext, ResolvedRunner, RunnerRegistry, VersionRange};
use crate::store::{ArchiveStore, PackReference};
use crate::tensor::Tensor;

/// Caller choices applied when loading a pack.
#[derive(Debug, Clone, Default)]
pub struct LoadOpts {
    pub visible_device: Option<DeviceRequest>,
    /// Overlaid key by key over the packed runner options.
    pub override_runner_opts: Option<BTreeMap<String, RunnerOpt>>,
    pub override_required_framework_version: Option<VersionRange>,
    pub override_runner_name: Option<String>,
}

/// What to pack alongside the model payload.
#[derive(Debug, Clone)]
pub struct PackOpts {
    pub info: ModelInfo,
    pub runner: RunnerInfo,
    /// Destination archive; defaults to `<tmp>/<model_name>-<hash>.carton`.
    pub output: Option<PathBuf>,
}

impl PackOpts {
    pub fn new(info: ModelInfo, runner: RunnerInfo) -> Self {
        Self {
            info,
            runner,
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Coordinates the archive store, runner catalog, and device resolution.
#[derive(Debug, Clone)]
pub struct PackManager {
    store: ArchiveStore,
    registry: Arc<RunnerRegistry>,
    devices: DeviceResolver,
}

impl PackManager {
    /// Build a manager from configuration, discovering runners from
    /// `runner_dir` when one is configured.
    pub fn new(cfg: CartonConfig) -> CartonResult<Self> {
        let registry = match &cfg.runner_dir {
            Some(dir) => RunnerRegistry::discover(dir)?,
            None => RunnerRegistry::new(),
        };
        tracing::debug!(
            cache_dir = %cfg.cache_dir.display(),
            runners = registry.len(),
            "initialized pack manager"
        );
        Ok(Self {
            store: ArchiveStore::new(&cfg)?,
            registry: Arc::new(registry),
            devices: DeviceResolver::default(),
        })
    }

    pub fn with_registry(mut self, registry: RunnerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_device_resolver(mut self, devices: DeviceResolver) -> Self {
        self.devices = devices;
        self
    }

    /// Use a fixed GPU list instead of probing the host.
    pub fn with_gpus(self, gpus: Vec<GpuInfo>) -> Self {
        self.with_device_resolver(DeviceResolver::new(Arc::new(StaticGpus(gpus))))
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    /// Package `source` (a directory or a single file) into an archive.
    pub async fn pack(&self, source: impl AsRef<Path>, opts: PackOpts) -> CartonResult<PathBuf> {
        let source = source.as_ref().to_path_buf();
        let dest = blocking("pack", move || {
            let plan = PackPlan::build(&source, &opts.info, &opts.runner)?;
            let dest = opts
                .output
                .unwrap_or_else(|| default_output(&opts.info, &plan));
            write_archive(&plan, &dest)?;
            Ok(dest)
        })
        .await?;
        Ok(dest)
    }

    /// Resolve, read metadata, select a runner, and resolve the device.
    pub async fn load(&self, reference: &PackReference, opts: &LoadOpts) -> CartonResult<Model> {
        let path = self.store.resolve(reference).await?;
        let PackMetadata {
            info,
            runner,
            model_files,
            ..
        } = blocking("metadata read", move || format::read_pack(&path)).await?;
        let model = self.bind(info, &runner, model_files, opts)?;
        tracing::info!(
            reference = %reference,
            runner = %model.runner.descriptor,
            device = %model.device,
            digest = ?model.info.manifest_sha256.as_ref().map(|digest| digest.as_str()),
            "loaded model"
        );
        Ok(model)
    }

    /// Load straight from a source directory without writing an archive.
    ///
    /// Metadata and runner selection match what `pack` followed by `load`
    /// would produce; payloads are read from `source` and memory.
    pub async fn load_unpacked(
        &self,
        source: impl AsRef<Path>,
        pack_opts: PackOpts,
        opts: &LoadOpts,
    ) -> CartonResult<Model> {
        let source = source.as_ref().to_path_buf();
        let label = source.display().to_string();
        let (info, runner, model_files) = blocking("pack planning", move || {
            let plan = PackPlan::build(&source, &pack_opts.info, &pack_opts.runner)?;
            Ok((plan.model_info()?, plan.runner.clone(), plan.model_files()))
        })
        .await?;
        let model = self.bind(info, &runner, model_files, opts)?;
        tracing::info!(
            source = %label,
            runner = %model.runner.descriptor,
            device = %model.device,
            "loaded unpacked model"
        );
        Ok(model)
    }

    /// Read only the manifest and model metadata of a pack.
    pub async fn get_model_info(&self, reference: &PackReference) -> CartonResult<ModelInfo> {
        let path = self.store.resolve(reference).await?;
        blocking("metadata read", move || format::read_model_info(&path)).await
    }

    fn bind(
        &self,
        info: ModelInfo,
        runner: &RunnerInfo,
        model_files: BTreeMap<String, LazyFile>,
        opts: &LoadOpts,
    ) -> CartonResult<Model> {
        let runner = self.registry.select(runner, opts)?;
        let device = self.devices.resolve(opts.visible_device.as_ref())?;
        Ok(Model {
            info,
            runner,
            device,
            model_files,
        })
    }
}

fn default_output(info: &ModelInfo, plan: &PackPlan) -> PathBuf {
    let name: String = info
        .model_name
        .as_deref()
        .unwrap_or("model")
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    std::env::temp_dir().join(format!("{name}-{}.carton", plan.manifest.content_hash.short()))
}

async fn blocking<T, F>(what: &'static str, work: F) -> CartonResult<T>
where
    F: FnOnce() -> CartonResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| CartonError::io(format!("{what} task failed"), io::Error::other(err)))?
}

/// A pack bound to a runner and a device.
#[derive(Debug, Clone)]
pub struct Model {
    info: ModelInfo,
    runner: ResolvedRunner,
    device: Device,
    model_files: BTreeMap<String, LazyFile>,
}

impl Model {
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn runner(&self) -> &ResolvedRunner {
        &self.runner
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Effective runner options: packed options with overrides applied.
    pub fn opts(&self) -> &BTreeMap<String, RunnerOpt> {
        &self.runner.opts
    }

    pub fn model_files(&self) -> &BTreeMap<String, LazyFile> {
        &self.model_files
    }

    /// Check inputs against the declared signature. Every name must be
    /// declared, so a model without declared inputs accepts none.
    pub fn check_inputs(&self, inputs: &BTreeMap<String, Tensor>) -> CartonResult<()> {
        let mut bindings = SymbolBindings::default();
        for (name, tensor) in inputs {
            let Some(spec) = self.info.input(name) else {
                return Err(CartonError::UnknownInput {
                    name: name.clone(),
                    known: self.info.inputs.iter().map(|spec| spec.name.clone()).collect(),
                });
            };
            if tensor.dtype() != spec.dtype {
                return Err(CartonError::DtypeMismatch {
                    name: name.clone(),
                    expected: spec.dtype.to_string(),
                    actual: tensor.dtype().to_string(),
                });
            }
            bindings.check(spec, tensor.shape())?;
        }
        Ok(())
    }

    /// Validate `inputs` and run them through the selected runner.
    pub async fn infer(
        &self,
        inputs: BTreeMap<String, Tensor>,
    ) -> CartonResult<BTreeMap<String, Tensor>> {
        self.check_inputs(&inputs)?;
        let backend = self
            .runner
            .backend()
            .ok_or_else(|| CartonError::RunnerUnavailable {
                runner_name: self.runner.descriptor.runner_name.clone(),
            })?;
        let ctx = InferenceContext {
            runner: &self.runner,
            device: &self.device,
            info: &self.info,
            model_files: &self.model_files,
        };
        tracing::trace!(runner = %self.runner.descriptor, inputs = inputs.len(), "dispatching inference");
        backend.infer(&ctx, inputs).await
    }

    /// Run every packed self-test. A failing test never stops the others.
    pub async fn run_self_tests(&self) -> Vec<SelfTestOutcome> {
        let mut outcomes = Vec::with_capacity(self.info.self_tests.len());
        for (index, test) in self.info.self_tests.iter().enumerate() {
            let status = match self.run_one(&test.inputs, test.expected_out.as_ref()).await {
                Ok(mismatched) if mismatched.is_empty() => SelfTestStatus::Passed,
                Ok(outputs) => SelfTestStatus::Mismatched { outputs },
                Err(err) => SelfTestStatus::Failed(err),
            };
            if !matches!(status, SelfTestStatus::Passed) {
                tracing::warn!(index, name = ?test.name, ?status, "self-test did not pass");
            }
            outcomes.push(SelfTestOutcome {
                index,
                name: test.name.clone(),
                status,
            });
        }
        outcomes
    }

    async fn run_one(
        &self,
        inputs: &BTreeMap<String, LazyTensor>,
        expected: Option<&BTreeMap<String, LazyTensor>>,
    ) -> CartonResult<Vec<String>> {
        let mut materialized = BTreeMap::new();
        for (name, lazy) in inputs {
            materialized.insert(name.clone(), lazy.get().await?);
        }
        let outputs = self.infer(materialized).await?;
        let Some(expected) = expected else {
            return Ok(Vec::new());
        };
        let mut mismatched = Vec::new();
        for (name, lazy) in expected {
            let want = lazy.get().await?;
            if outputs.get(name) != Some(&want) {
                mismatched.push(name.clone());
            }
        }
        Ok(mismatched)
    }
}

/// Result of one packed self-test.
#[derive(Debug, Clone)]
pub struct SelfTestOutcome {
    pub index: usize,
    pub name: Option<String>,
    pub status: SelfTestStatus,
}

impl SelfTestOutcome {
    pub fn passed(&self) -> bool {
        matches!(self.status, SelfTestStatus::Passed)
    }
}

#[derive(Debug, Clone)]
pub enum SelfTestStatus {
    Passed,
    /// Outputs that differed from the expected tensors.
    Mismatched { outputs: Vec<String> },
    Failed(CartonError),
}

/// Symbol assignments made while checking one call's inputs.
#[derive(Default)]
struct SymbolBindings {
    dims: HashMap<String, u64>,
    shapes: HashMap<String, Vec<u64>>,
}

impl SymbolBindings {
    fn check(&mut self, spec: &TensorSpec, actual: &[u64]) -> CartonResult<()> {
        let mismatch = || CartonError::ShapeMismatch {
            name: spec.name.clone(),
            expected: spec.shape.to_string(),
            actual: actual.to_vec(),
        };
        match &spec.shape {
            Shape::Any => Ok(()),
            Shape::Symbol(symbol) => match self.shapes.get(symbol) {
                Some(bound) if bound.as_slice() != actual => Err(mismatch()),
                Some(_) => Ok(()),
                None => {
                    self.shapes.insert(symbol.clone(), actual.to_vec());
                    Ok(())
                }
            },
            Shape::Dims(dims) => {
                if dims.len() != actual.len() {
                    return Err(mismatch());
                }
                for (dim, &size) in dims.iter().zip(actual) {
                    match dim {
                        Dimension::Any => {}
                        Dimension::Value(expected) if *expected != size => return Err(mismatch()),
                        Dimension::Value(_) => {}
                        Dimension::Symbol(symbol) => match self.dims.get(symbol) {
                            Some(bound) if *bound != size => return Err(mismatch()),
                            Some(_) => {}
                            None => {
                                self.dims.insert(symbol.clone(), size);
                            }
                        },
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;

    fn spec(name: &str, shape: Shape) -> TensorSpec {
        TensorSpec::new(name, DataType::Float32, shape)
    }

    #[test]
    fn fixed_and_any_dimensions() {
        let mut bindings = SymbolBindings::default();
        let image = spec(
            "image",
            Shape::Dims(vec![Dimension::Any, Dimension::Value(3)]),
        );
        assert!(bindings.check(&image, &[8, 3]).is_ok());
        let err = bindings.check(&image, &[8, 4]).unwrap_err();
        assert!(matches!(err, CartonError::ShapeMismatch { .. }));
        assert!(bindings.check(&image, &[8]).is_err());
    }

    #[test]
    fn dimension_symbols_bind_across_inputs() {
        let mut bindings = SymbolBindings::default();
        let a = spec("a", Shape::Dims(vec![Dimension::Symbol("batch".into())]));
        let b = spec(
            "b",
            Shape::Dims(vec![Dimension::Symbol("batch".into()), Dimension::Value(2)]),
        );
        bindings.check(&a, &[4]).unwrap();
        assert!(bindings.check(&b, &[4, 2]).is_ok());
        assert!(bindings.check(&b, &[5, 2]).is_err());
    }

    #[test]
    fn shape_symbols_bind_whole_shapes() {
        let mut bindings = SymbolBindings::default();
        let x = spec("x", Shape::Symbol("s".into()));
        let y = spec("y", Shape::Symbol("s".into()));
        bindings.check(&x, &[2, 2]).unwrap();
        assert!(bindings.check(&y, &[2, 2]).is_ok());
        assert!(bindings.check(&y, &[4]).is_err());
    }

    #[test]
    fn default_output_is_named_after_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let info = ModelInfo {
            model_name: Some("my model/v1".into()),
            ..ModelInfo::default()
        };
        let runner = RunnerInfo::new("noop", VersionRange::any());
        let plan = PackPlan::build(dir.path(), &info, &runner).unwrap();
        let output = default_output(&info, &plan);
        let file = output.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file.starts_with("my_model_v1-"), "{file}");
        assert!(file.ends_with(".carton"));
    }
}
