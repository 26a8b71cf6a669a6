//! Packaging and loading core for carton model archives.
//!
//! This crate provides the building blocks required to pack a model directory
//! into a self-describing `.carton` archive, resolve archives from paths or
//! URLs into a verified on-disk cache, read model metadata without touching
//! payload bytes, and bind a loaded model to a compatible installed runner
//! and execution device.

pub mod device;
pub mod digest;
pub mod env;
pub mod error;
pub mod format;
pub mod info;
pub mod lazy;
pub mod load;
pub mod runners;
pub mod store;
pub mod tensor;

pub use device::{Device, DeviceRequest, DeviceResolver, GpuInfo, GpuInventory, StaticGpus, SystemGpus};
pub use digest::ContentDigest;
pub use env::CartonConfig;
pub use error::{CartonError, CartonResult};
pub use format::{Manifest, MetadataReader, PackMetadata};
pub use info::{
    Dimension, Example, ModelInfo, RunnerInfo, RunnerOpt, SelfTest, Shape, TensorOrMisc,
    TensorSpec,
};
pub use lazy::{LazyFile, LazyTensor, LazyValue, Payload, PayloadSource};
pub use load::{LoadOpts, Model, PackManager, PackOpts, SelfTestOutcome, SelfTestStatus};
pub use runners::{
    InferenceContext, ResolvedRunner, RunnerBackend, RunnerDescriptor, RunnerRegistry,
    VersionRange, merge_opts,
};
pub use store::{ArchiveStore, CacheRecord, PackReference};
pub use tensor::{DataType, Tensor, TensorData};
