use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CartonError, CartonResult};

/// Concrete execution device handed to a runner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    GpuIndex(u32),
    /// UUID selector as the caller spelled it (`GPU-…`, `MIG-GPU-…`, bare).
    GpuUuid(String),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::GpuIndex(index) => write!(f, "gpu:{index}"),
            Self::GpuUuid(uuid) => f.write_str(uuid),
        }
    }
}

/// Caller-supplied `visible_device`: a GPU index or a selector string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest {
    Index(u32),
    Name(String),
}

impl From<u32> for DeviceRequest {
    fn from(value: u32) -> Self {
        Self::Index(value)
    }
}

impl From<&str> for DeviceRequest {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for DeviceRequest {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

/// One enumerated GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub index: u32,
    pub uuid: Option<Uuid>,
}

/// Source of the GPUs visible on this host.
pub trait GpuInventory: Send + Sync {
    fn gpus(&self) -> Vec<GpuInfo>;
}

/// Fixed GPU list, for tests and embedders that enumerate devices themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticGpus(pub Vec<GpuInfo>);

impl GpuInventory for StaticGpus {
    fn gpus(&self) -> Vec<GpuInfo> {
        self.0.clone()
    }
}

/// Enumerates NVIDIA GPUs through the driver's procfs entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGpus;

impl GpuInventory for SystemGpus {
    fn gpus(&self) -> Vec<GpuInfo> {
        detect_gpus()
    }
}

#[cfg(target_os = "linux")]
fn detect_gpus() -> Vec<GpuInfo> {
    let Ok(entries) = std::fs::read_dir("/proc/driver/nvidia/gpus") else {
        return Vec::new();
    };
    // Directories are named by PCI bus id; sorted, they follow nvidia-smi's index order.
    let mut dirs: Vec<_> = entries.flatten().map(|entry| entry.path()).collect();
    dirs.sort();
    enumerate_gpus(
        dirs.iter()
            .filter_map(|dir| std::fs::read_to_string(dir.join("information")).ok()),
    )
}

#[cfg(not(target_os = "linux"))]
fn detect_gpus() -> Vec<GpuInfo> {
    Vec::new()
}

/// Index GPUs by their position in enumeration order. Driver minor numbers
/// are not device ordinals and are ignored.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn enumerate_gpus(infos: impl IntoIterator<Item = String>) -> Vec<GpuInfo> {
    infos
        .into_iter()
        .enumerate()
        .map(|(position, info)| GpuInfo {
            index: position as u32,
            uuid: proc_uuid(&info),
        })
        .collect()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn proc_uuid(info: &str) -> Option<Uuid> {
    info.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "GPU UUID")
            .then(|| parse_uuid_selector(value.trim()))
            .flatten()
    })
}

/// Maps a `visible_device` request onto an available device.
#[derive(Clone)]
pub struct DeviceResolver {
    inventory: Arc<dyn GpuInventory>,
}

impl fmt::Debug for DeviceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceResolver")
            .field("gpus", &self.inventory.gpus())
            .finish()
    }
}

impl Default for DeviceResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemGpus))
    }
}

impl DeviceResolver {
    pub fn new(inventory: Arc<dyn GpuInventory>) -> Self {
        Self { inventory }
    }

    /// Resolve the requested device.
    ///
    /// Malformed selectors fail with `ValidationFailed`. Well-formed selectors
    /// naming a GPU that is not present fall back to the CPU with a warning.
    pub fn resolve(&self, requested: Option<&DeviceRequest>) -> CartonResult<Device> {
        let gpus = self.inventory.gpus();
        let Some(requested) = requested else {
            return Ok(gpus
                .first()
                .map_or(Device::Cpu, |gpu| Device::GpuIndex(gpu.index)));
        };

        let selector = match requested {
            DeviceRequest::Index(index) => Selector::Index(*index),
            DeviceRequest::Name(name) => Selector::parse(name)?,
        };

        match lookup(&selector, &gpus) {
            Ok(device) => Ok(device),
            Err(err @ CartonError::DeviceUnavailable { .. }) => {
                tracing::warn!(error = %err, "requested device unavailable, falling back to cpu");
                Ok(Device::Cpu)
            }
            Err(err) => Err(err),
        }
    }
}

enum Selector {
    Cpu,
    Index(u32),
    Uuid { uuid: Uuid, raw: String },
}

impl Selector {
    fn parse(raw: &str) -> CartonResult<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("cpu") {
            return Ok(Self::Cpu);
        }
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            let index = trimmed.parse::<u32>().map_err(|_| {
                CartonError::validation(format!("device index `{raw}` is out of range"))
            })?;
            return Ok(Self::Index(index));
        }
        match parse_uuid_selector(trimmed) {
            Some(uuid) => Ok(Self::Uuid {
                uuid,
                raw: trimmed.to_string(),
            }),
            None => Err(CartonError::validation(format!(
                "visible_device `{raw}` is neither `cpu`, a GPU index, nor a GPU UUID"
            ))),
        }
    }
}

/// Accepts bare UUIDs and the `GPU-`, `MIG-GPU-`, and `MIG-` prefixed forms.
/// MIG selectors may carry a `/gi/ci` suffix, which is ignored for matching.
fn parse_uuid_selector(raw: &str) -> Option<Uuid> {
    let body = raw
        .strip_prefix("MIG-GPU-")
        .or_else(|| raw.strip_prefix("GPU-"))
        .or_else(|| raw.strip_prefix("MIG-"))
        .unwrap_or(raw);
    let body = body.split('/').next().unwrap_or(body);
    Uuid::parse_str(body).ok()
}

fn lookup(selector: &Selector, gpus: &[GpuInfo]) -> CartonResult<Device> {
    match selector {
        Selector::Cpu => Ok(Device::Cpu),
        Selector::Index(index) => {
            if gpus.iter().any(|gpu| gpu.index == *index) {
                Ok(Device::GpuIndex(*index))
            } else {
                Err(CartonError::DeviceUnavailable {
                    device: format!("gpu:{index}"),
                })
            }
        }
        Selector::Uuid { uuid, raw } => {
            if gpus.iter().any(|gpu| gpu.uuid.as_ref() == Some(uuid)) {
                Ok(Device::GpuUuid(raw.clone()))
            } else {
                Err(CartonError::DeviceUnavailable { device: raw.clone() })
            }
        }
    }
}
