use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use carton::{
    CartonConfig, CartonError, CartonResult, DataType, Device, DeviceRequest, Dimension, GpuInfo,
    InferenceContext, LazyTensor, LoadOpts, ModelInfo, PackManager, PackOpts, PackReference,
    RunnerBackend, RunnerDescriptor, RunnerInfo, RunnerOpt, RunnerRegistry, SelfTest,
    SelfTestStatus, Shape, Tensor, TensorSpec, VersionRange,
};
use serial_test::serial;
use tempfile::TempDir;

/// Returns input `x` as output `y` and counts dispatches.
#[derive(Default)]
struct EchoBackend {
    calls: AtomicUsize,
}

impl EchoBackend {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunnerBackend for EchoBackend {
    async fn infer(
        &self,
        ctx: &InferenceContext<'_>,
        inputs: BTreeMap<String, Tensor>,
    ) -> CartonResult<BTreeMap<String, Tensor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let x = inputs
            .get("x")
            .cloned()
            .ok_or_else(|| CartonError::Inference {
                runner_name: ctx.runner.descriptor.runner_name.clone(),
                reason: "missing input x".into(),
            })?;
        Ok(BTreeMap::from([("y".to_string(), x)]))
    }
}

struct Fixture {
    temp: TempDir,
    source: PathBuf,
    manager: PackManager,
    backend: Arc<EchoBackend>,
}

impl Fixture {
    fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("echo-model");
        fs::create_dir_all(source.join("weights"))?;
        fs::write(source.join("weights/w0.bin"), vec![5u8; 1024])?;
        fs::write(source.join("graph.txt"), b"y = x")?;

        let backend = Arc::new(EchoBackend::default());
        let mut registry = RunnerRegistry::new();
        registry.register(RunnerDescriptor::new("echo", "1.9.0", "1")?);
        registry.register_with_backend(RunnerDescriptor::new("echo", "2.1.0", "1")?, backend.clone());
        registry.register(RunnerDescriptor::new("other", "5.0.0", "1")?);

        let manager = PackManager::new(
            CartonConfig::default().with_cache_dir(temp.path().join("cache")),
        )?
        .with_registry(registry)
        .with_gpus(vec![GpuInfo {
            index: 0,
            uuid: None,
        }]);

        Ok(Self {
            temp,
            source,
            manager,
            backend,
        })
    }

    fn pack_opts(&self) -> Result<PackOpts> {
        let x = Tensor::from_f32(vec![2], &[1.0, 2.0])?;
        let wrong = Tensor::from_f32(vec![2], &[9.0, 9.0])?;
        let batch = || Shape::Dims(vec![Dimension::Symbol("n".into())]);
        let info = ModelInfo {
            model_name: Some("echo".into()),
            short_description: Some("returns its input".into()),
            license: Some("MIT".into()),
            required_platforms: ["x86_64-unknown-linux-gnu".to_string()].into(),
            inputs: vec![TensorSpec::new("x", DataType::Float32, batch())],
            outputs: vec![TensorSpec::new("y", DataType::Float32, batch())],
            self_tests: vec![
                SelfTest {
                    name: Some("identity".into()),
                    inputs: BTreeMap::from([("x".to_string(), LazyTensor::from_value(&x)?)]),
                    expected_out: Some(BTreeMap::from([(
                        "y".to_string(),
                        LazyTensor::from_value(&x)?,
                    )])),
                    ..SelfTest::default()
                },
                SelfTest {
                    name: Some("wrong-expectation".into()),
                    inputs: BTreeMap::from([("x".to_string(), LazyTensor::from_value(&x)?)]),
                    expected_out: Some(BTreeMap::from([(
                        "y".to_string(),
                        LazyTensor::from_value(&wrong)?,
                    )])),
                    ..SelfTest::default()
                },
            ],
            ..ModelInfo::default()
        };
        let runner = RunnerInfo::new("echo", VersionRange::parse(">=1.0, <3")?)
            .with_opt("threads", 2i64)
            .with_opt("mode", "fast");
        Ok(PackOpts::new(info, runner))
    }

    async fn load_packed(&self, opts: &LoadOpts) -> Result<carton::Model> {
        let archive = self
            .manager
            .pack(
                &self.source,
                self.pack_opts()?.with_output(self.temp.path().join("echo.carton")),
            )
            .await?;
        Ok(self
            .manager
            .load(&PackReference::from(archive.as_path()), opts)
            .await?)
    }

    async fn load_unpacked(&self, opts: &LoadOpts) -> Result<carton::Model> {
        Ok(self
            .manager
            .load_unpacked(&self.source, self.pack_opts()?, opts)
            .await?)
    }
}

fn inputs(x: Tensor) -> BTreeMap<String, Tensor> {
    BTreeMap::from([("x".to_string(), x)])
}

#[tokio::test]
async fn packed_and_unpacked_loads_agree() -> Result<()> {
    let fixture = Fixture::new()?;
    let packed = fixture.load_packed(&LoadOpts::default()).await?;
    let unpacked = fixture.load_unpacked(&LoadOpts::default()).await?;

    assert_eq!(packed.info(), unpacked.info());
    assert_eq!(packed.runner(), unpacked.runner());
    assert_eq!(packed.model_files(), unpacked.model_files());
    assert_eq!(packed.runner().descriptor.framework_version.to_string(), "2.1.0");
    assert!(packed.model_files().contains_key("weights/w0.bin"));
    assert!(packed.info().manifest_sha256.is_some());

    let archive = fixture.temp.path().join("echo.carton");
    let info = fixture
        .manager
        .get_model_info(&PackReference::from(archive.as_path()))
        .await?;
    assert_eq!(&info, packed.info());
    Ok(())
}

#[tokio::test]
async fn infer_dispatches_to_the_selected_backend() -> Result<()> {
    let fixture = Fixture::new()?;
    let model = fixture.load_packed(&LoadOpts::default()).await?;

    let x = Tensor::from_f32(vec![3], &[1.0, 2.0, 3.0])?;
    let out = model.infer(inputs(x.clone())).await?;
    assert_eq!(out.get("y"), Some(&x));
    assert_eq!(fixture.backend.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn invalid_inputs_never_reach_the_runner() -> Result<()> {
    let fixture = Fixture::new()?;
    let model = fixture.load_unpacked(&LoadOpts::default()).await?;

    let unknown = BTreeMap::from([("z".to_string(), Tensor::from_f32(vec![1], &[0.0])?)]);
    let err = model.infer(unknown).await.unwrap_err();
    assert!(matches!(err, CartonError::UnknownInput { ref name, .. } if name == "z"), "{err}");

    let err = model
        .infer(inputs(Tensor::from_i64(vec![2], &[1, 2])?))
        .await
        .unwrap_err();
    assert!(matches!(err, CartonError::DtypeMismatch { .. }), "{err}");

    let err = model
        .infer(inputs(Tensor::from_f32(vec![2, 2], &[0.0; 4])?))
        .await
        .unwrap_err();
    assert!(matches!(err, CartonError::ShapeMismatch { .. }), "{err}");

    assert_eq!(fixture.backend.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn models_without_declared_inputs_reject_named_inputs() -> Result<()> {
    let fixture = Fixture::new()?;
    let opts = PackOpts::new(
        ModelInfo::default(),
        RunnerInfo::new("echo", VersionRange::parse(">=2")?),
    );
    let model = fixture
        .manager
        .load_unpacked(&fixture.source, opts, &LoadOpts::default())
        .await?;

    let err = model
        .infer(BTreeMap::from([(
            "bogus".to_string(),
            Tensor::from_f32(vec![1], &[0.0])?,
        )]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, CartonError::UnknownInput { ref name, ref known } if name == "bogus" && known.is_empty()),
        "{err}"
    );
    assert_eq!(fixture.backend.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn self_tests_report_each_outcome() -> Result<()> {
    let fixture = Fixture::new()?;
    let model = fixture.load_packed(&LoadOpts::default()).await?;

    let outcomes = model.run_self_tests().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].passed());
    assert_eq!(outcomes[0].name.as_deref(), Some("identity"));
    match &outcomes[1].status {
        SelfTestStatus::Mismatched { outputs } => assert_eq!(outputs, &vec!["y".to_string()]),
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(fixture.backend.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn override_opts_overlay_packed_opts() -> Result<()> {
    let fixture = Fixture::new()?;
    let opts = LoadOpts {
        override_runner_opts: Some(BTreeMap::from([(
            "threads".to_string(),
            RunnerOpt::Integer(8),
        )])),
        ..LoadOpts::default()
    };
    let model = fixture.load_packed(&opts).await?;

    let expected = BTreeMap::from([
        ("mode".to_string(), RunnerOpt::from("fast")),
        ("threads".to_string(), RunnerOpt::Integer(8)),
    ]);
    assert_eq!(model.opts(), &expected);
    Ok(())
}

#[tokio::test]
async fn framework_and_name_overrides_change_selection() -> Result<()> {
    let fixture = Fixture::new()?;

    let older = LoadOpts {
        override_required_framework_version: Some(VersionRange::parse("<2")?),
        ..LoadOpts::default()
    };
    let model = fixture.load_packed(&older).await?;
    assert_eq!(model.runner().descriptor.framework_version.to_string(), "1.9.0");
    let err = model
        .infer(inputs(Tensor::from_f32(vec![1], &[1.0])?))
        .await
        .unwrap_err();
    assert!(matches!(err, CartonError::RunnerUnavailable { .. }), "{err}");

    let renamed = LoadOpts {
        override_runner_name: Some("other".into()),
        ..LoadOpts::default()
    };
    let err = fixture.load_unpacked(&renamed).await.unwrap_err();
    assert!(
        matches!(err.downcast_ref::<CartonError>(), Some(CartonError::NoCompatibleRunner { runner_name, .. }) if runner_name == "other"),
        "{err}"
    );

    let renamed_and_widened = LoadOpts {
        override_runner_name: Some("other".into()),
        override_required_framework_version: Some(VersionRange::parse(">=5")?),
        ..LoadOpts::default()
    };
    let model = fixture.load_unpacked(&renamed_and_widened).await?;
    assert_eq!(model.runner().descriptor.runner_name, "other");
    Ok(())
}

#[tokio::test]
async fn device_selection_falls_back_to_cpu() -> Result<()> {
    let fixture = Fixture::new()?;

    let model = fixture.load_unpacked(&LoadOpts::default()).await?;
    assert_eq!(model.device(), &Device::GpuIndex(0));

    for (request, expected) in [("5", Device::Cpu), ("CPU", Device::Cpu), ("0", Device::GpuIndex(0))] {
        let opts = LoadOpts {
            visible_device: Some(DeviceRequest::from(request)),
            ..LoadOpts::default()
        };
        let model = fixture.load_unpacked(&opts).await?;
        assert_eq!(model.device(), &expected, "request {request}");
    }

    let opts = LoadOpts {
        visible_device: Some(DeviceRequest::from("gpu-zero")),
        ..LoadOpts::default()
    };
    let err = fixture.load_unpacked(&opts).await.unwrap_err();
    assert!(
        matches!(err.downcast_ref::<CartonError>(), Some(CartonError::ValidationFailed { .. })),
        "{err}"
    );
    Ok(())
}

#[tokio::test]
async fn oversized_short_description_is_rejected_at_pack_time() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut opts = fixture.pack_opts()?;

    opts.info.short_description = Some("é".repeat(100));
    fixture
        .manager
        .pack(&fixture.source, opts.clone().with_output(fixture.temp.path().join("ok.carton")))
        .await?;

    opts.info.short_description = Some("é".repeat(101));
    let dest = fixture.temp.path().join("too-long.carton");
    let err = fixture
        .manager
        .pack(&fixture.source, opts.with_output(&dest))
        .await
        .unwrap_err();
    assert!(matches!(err, CartonError::ValidationFailed { .. }), "{err}");
    assert!(!dest.exists());
    Ok(())
}

#[tokio::test]
#[serial]
async fn runners_are_discovered_from_the_environment() -> Result<()> {
    let fixture = Fixture::new()?;
    let runner_dir = fixture.temp.path().join("runners");
    fs::create_dir_all(&runner_dir)?;
    fs::write(
        runner_dir.join("echo.json"),
        serde_json::to_vec(&serde_json::json!({
            "runner_name": "echo",
            "framework_version": "2.4",
            "runner_compat_version": 1
        }))?,
    )?;

    let _runners = EnvGuard::set("CARTON_RUNNER_DIR", runner_dir.to_string_lossy());
    let _cache = EnvGuard::set(
        "CARTON_CACHE_DIR",
        fixture.temp.path().join("env-cache").to_string_lossy(),
    );
    let manager = PackManager::new(CartonConfig::from_env()?)?;
    assert_eq!(manager.registry().len(), 1);

    let model = manager
        .load_unpacked(&fixture.source, fixture.pack_opts()?, &LoadOpts::default())
        .await?;
    assert_eq!(model.runner().descriptor.framework_version.to_string(), "2.4.0");
    Ok(())
}

struct EnvGuard {
    key: &'static str,
    prev: Option<String>,
}

impl EnvGuard {
    fn set(key: &'static str, value: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe {
            std::env::set_var(key, value.as_ref());
        }
        Self { key, prev }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(ref value) = self.prev {
            unsafe {
                std::env::set_var(self.key, value);
            }
        } else {
            unsafe {
                std::env::remove_var(self.key);
            }
        }
    }
}
