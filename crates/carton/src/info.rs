use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;
use crate::error::{CartonError, CartonResult};
use crate::lazy::{LazyFile, LazyTensor};
use crate::runners::VersionRange;
use crate::tensor::DataType;

/// Longest `short_description` accepted at pack time, in characters.
pub const SHORT_DESCRIPTION_MAX_CHARS: usize = 100;

/// Everything a caller needs to know about a packed model without touching
/// its weights.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelInfo {
    pub model_name: Option<String>,
    pub short_description: Option<String>,
    pub model_description: Option<String>,
    pub license: Option<String>,
    pub repository: Option<String>,
    pub homepage: Option<String>,
    pub required_platforms: BTreeSet<String>,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub self_tests: Vec<SelfTest>,
    pub examples: Vec<Example>,
    pub misc_files: BTreeMap<String, LazyFile>,
    /// sha256 of the archive manifest; `None` until the model is packed.
    pub manifest_sha256: Option<ContentDigest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DataType,
    pub shape: Shape,
    #[serde(default)]
    pub description: Option<String>,
    /// Name the runner uses internally when it differs from `name`.
    #[serde(default)]
    pub internal_name: Option<String>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: DataType, shape: Shape) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            description: None,
            internal_name: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Shape constraint on a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Any,
    /// The whole shape is named; all tensors sharing the symbol share a shape.
    Symbol(String),
    Dims(Vec<Dimension>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Value(u64),
    Symbol(String),
    Any,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any shape"),
            Self::Symbol(symbol) => write!(f, "shape `{symbol}`"),
            Self::Dims(dims) => {
                f.write_str("[")?;
                for (idx, dim) in dims.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    match dim {
                        Dimension::Value(v) => write!(f, "{v}")?,
                        Dimension::Symbol(s) => f.write_str(s)?,
                        Dimension::Any => f.write_str("*")?,
                    }
                }
                f.write_str("]")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelfTest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub inputs: BTreeMap<String, LazyTensor>,
    pub expected_out: Option<BTreeMap<String, LazyTensor>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Example {
    pub name: Option<String>,
    pub description: Option<String>,
    pub inputs: BTreeMap<String, TensorOrMisc>,
    pub sample_out: BTreeMap<String, TensorOrMisc>,
}

/// Example slots may hold tensors or arbitrary files (images, audio, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum TensorOrMisc {
    Tensor(LazyTensor),
    Misc(LazyFile),
}

/// Typed runner option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunnerOpt {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
}

impl From<bool> for RunnerOpt {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for RunnerOpt {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for RunnerOpt {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for RunnerOpt {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// The runner requirement recorded in a pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub runner_name: String,
    pub required_framework_version: VersionRange,
    #[serde(default)]
    pub runner_compat_version: Option<VersionRange>,
    #[serde(default)]
    pub opts: BTreeMap<String, RunnerOpt>,
}

impl RunnerInfo {
    pub fn new(runner_name: impl Into<String>, required_framework_version: VersionRange) -> Self {
        Self {
            runner_name: runner_name.into(),
            required_framework_version,
            runner_compat_version: None,
            opts: BTreeMap::new(),
        }
    }

    pub fn with_compat(mut self, compat: VersionRange) -> Self {
        self.runner_compat_version = Some(compat);
        self
    }

    pub fn with_opt(mut self, key: impl Into<String>, value: impl Into<RunnerOpt>) -> Self {
        self.opts.insert(key.into(), value.into());
        self
    }

    pub(crate) fn validate(&self) -> CartonResult<()> {
        if self.runner_name.trim().is_empty() {
            return Err(CartonError::validation("runner_name must not be empty"));
        }
        Ok(())
    }
}

impl ModelInfo {
    /// Schema checks applied before anything is written to an archive.
    pub fn validate(&self) -> CartonResult<()> {
        if let Some(short) = &self.short_description {
            let chars = short.chars().count();
            if chars > SHORT_DESCRIPTION_MAX_CHARS {
                return Err(CartonError::validation(format!(
                    "short_description is {chars} characters; at most {SHORT_DESCRIPTION_MAX_CHARS} are allowed"
                )));
            }
        }
        unique_names("inputs", &self.inputs)?;
        unique_names("outputs", &self.outputs)?;
        for platform in &self.required_platforms {
            if platform.trim().is_empty() {
                return Err(CartonError::validation(
                    "required_platforms contains an empty identifier",
                ));
            }
        }
        let mut normalized = HashMap::new();
        for path in self.misc_files.keys() {
            let entry = validate_relative_path(path)?;
            if let Some(other) = normalized.insert(entry, path) {
                return Err(CartonError::validation(format!(
                    "misc files `{other}` and `{path}` name the same path"
                )));
            }
        }
        Ok(())
    }

    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }
}

fn unique_names(kind: &str, specs: &[TensorSpec]) -> CartonResult<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.name.is_empty() {
            return Err(CartonError::validation(format!("{kind} contain an unnamed tensor")));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(CartonError::validation(format!(
                "{kind} declare `{}` more than once",
                spec.name
            )));
        }
    }
    Ok(())
}

/// Check that `path` stays inside the pack and return its normalized
/// `/`-joined form.
pub(crate) fn validate_relative_path(path: &str) -> CartonResult<String> {
    let escapes = || {
        CartonError::validation(format!(
            "misc file path `{path}` must be relative and stay inside the pack"
        ))
    };
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(escapes()),
        }
    }
    if parts.is_empty() {
        return Err(escapes());
    }
    Ok(parts.join("/"))
}
