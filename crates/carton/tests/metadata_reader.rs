use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use carton::{
    CartonConfig, CartonError, DataType, LazyFile, LazyTensor, MetadataReader, ModelInfo,
    PackManager, PackOpts, PackReference, RunnerInfo, SelfTest, Shape, Tensor, TensorSpec,
    VersionRange,
};
use parking_lot::Mutex;

/// Records every byte range read through it.
struct RecordingReader<R> {
    inner: R,
    pos: u64,
    reads: Arc<Mutex<Vec<Range<u64>>>>,
}

impl<R: Read> Read for RecordingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            self.reads.lock().push(self.pos..self.pos + read as u64);
        }
        self.pos += read as u64;
        Ok(read)
    }
}

impl<R: Seek> Seek for RecordingReader<R> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        self.pos = self.inner.seek(from)?;
        Ok(self.pos)
    }
}

fn manager(dir: &Path) -> Result<PackManager> {
    Ok(PackManager::new(
        CartonConfig::default().with_cache_dir(dir.join("cache")),
    )?)
}

async fn packed_model(dir: &Path) -> Result<PathBuf> {
    let model = dir.join("model");
    fs::create_dir_all(model.join("layers"))?;
    fs::write(model.join("layers/0.bin"), vec![1u8; 16 * 1024])?;
    fs::write(model.join("config.json"), br#"{"hidden": 16}"#)?;

    let input = Tensor::from_f32(vec![2], &[1.0, 2.0])?;
    let info = ModelInfo {
        model_name: Some("lazy".into()),
        short_description: Some("a model with payloads".into()),
        inputs: vec![TensorSpec::new("x", DataType::Float32, Shape::Any)],
        outputs: vec![TensorSpec::new("y", DataType::Float32, Shape::Any)],
        self_tests: vec![SelfTest {
            name: Some("echo".into()),
            inputs: BTreeMap::from([("x".to_string(), LazyTensor::from_value(&input)?)]),
            expected_out: Some(BTreeMap::from([(
                "y".to_string(),
                LazyTensor::from_value(&input)?,
            )])),
            ..SelfTest::default()
        }],
        misc_files: BTreeMap::from([(
            "README.md".to_string(),
            LazyFile::from_bytes(Bytes::from_static(b"# lazy\n")),
        )]),
        ..ModelInfo::default()
    };
    let runner = RunnerInfo::new("noop", VersionRange::parse(">=1")?);
    let path = manager(dir)?
        .pack(&model, PackOpts::new(info, runner).with_output(dir.join("lazy.carton")))
        .await?;
    Ok(path)
}

/// Data ranges of every payload entry (everything except the metadata sections).
fn payload_ranges(path: &Path) -> Result<Vec<Range<u64>>> {
    let mut zip = zip::ZipArchive::new(File::open(path)?)?;
    let mut ranges = Vec::new();
    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;
        if matches!(entry.name(), "MANIFEST" | "info.cbor" | "runner.cbor") {
            continue;
        }
        let start = entry.data_start();
        ranges.push(start..start + entry.compressed_size());
    }
    Ok(ranges)
}

#[tokio::test]
async fn metadata_reads_never_touch_payload_bytes() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let path = packed_model(temp.path()).await?;
    let payloads = payload_ranges(&path)?;
    assert!(payloads.len() >= 4, "expected model, tensor, and misc payloads");

    let reads = Arc::new(Mutex::new(Vec::new()));
    let reader = RecordingReader {
        inner: File::open(&path)?,
        pos: 0,
        reads: Arc::clone(&reads),
    };
    let mut metadata = MetadataReader::new(reader, &path)?;
    let manifest = metadata.manifest()?;
    let info = metadata.model_info(&manifest, &Arc::new(path.clone()))?;
    assert_eq!(info.model_name.as_deref(), Some("lazy"));

    for read in reads.lock().iter() {
        for payload in &payloads {
            assert!(
                read.end <= payload.start || payload.end <= read.start,
                "metadata read {read:?} overlaps payload {payload:?}"
            );
        }
    }
    Ok(())
}

#[tokio::test]
async fn repeated_reads_yield_identical_info() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let path = packed_model(temp.path()).await?;
    let manager = manager(temp.path())?;
    let reference = PackReference::from(path.as_path());

    let first = manager.get_model_info(&reference).await?;
    let second = manager.get_model_info(&reference).await?;
    assert_eq!(first, second);
    assert!(first.manifest_sha256.is_some());
    Ok(())
}

#[tokio::test]
async fn lazy_values_fetch_on_demand() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let path = packed_model(temp.path()).await?;
    let info = manager(temp.path())?
        .get_model_info(&PackReference::from(path.as_path()))
        .await?;

    let readme = info.misc_files["README.md"].get().await?;
    assert_eq!(&readme[..], b"# lazy\n");

    let test = &info.self_tests[0];
    let x = test.inputs["x"].get().await?;
    assert_eq!(x, Tensor::from_f32(vec![2], &[1.0, 2.0])?);
    // Handles compare by content digest.
    assert_eq!(test.inputs["x"], test.expected_out.as_ref().unwrap()["y"]);
    Ok(())
}

#[tokio::test]
async fn damaged_payload_only_fails_its_own_fetch() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let path = packed_model(temp.path()).await?;

    let tensor_start = {
        let mut zip = zip::ZipArchive::new(File::open(&path)?)?;
        let entry = zip.by_name("tensors/0")?;
        entry.data_start()
    };
    let mut bytes = fs::read(&path)?;
    bytes[tensor_start as usize] ^= 0xff;
    fs::write(&path, &bytes)?;

    let info = manager(temp.path())?
        .get_model_info(&PackReference::from(path.as_path()))
        .await?;
    let err = info.self_tests[0].inputs["x"].get().await.unwrap_err();
    assert!(
        matches!(
            err,
            CartonError::IntegrityMismatch { .. } | CartonError::CorruptArchive { .. }
        ),
        "{err}"
    );

    // Other handles from the same metadata keep working.
    let readme = info.misc_files["README.md"].get().await?;
    assert_eq!(&readme[..], b"# lazy\n");
    Ok(())
}
