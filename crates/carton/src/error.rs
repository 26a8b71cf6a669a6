use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

/// Unified error across the pack / load / runner-selection core.
///
/// The type is `Clone` so a single in-flight download can hand the same
/// failure to every waiter; I/O errors are kept behind an `Arc` for that.
#[derive(Debug, Clone, Error)]
pub enum CartonError {
    #[error("reference `{reference}` not found: {reason}")]
    ReferenceNotFound { reference: String, reason: String },

    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("integrity mismatch for {subject}: expected sha256 {expected}, found {actual}")]
    IntegrityMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("archive {archive} is corrupt: {reason}")]
    CorruptArchive { archive: String, reason: String },

    #[error("archive {archive} uses unsupported format version {version}")]
    UnsupportedFormat { archive: String, version: u32 },

    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error(
        "no installed runner matches `{runner_name}` with framework version `{required_framework_version}`{}",
        compat_suffix(.runner_compat_version)
    )]
    NoCompatibleRunner {
        runner_name: String,
        required_framework_version: String,
        runner_compat_version: Option<String>,
    },

    #[error("unknown input `{name}`; model accepts {known:?}")]
    UnknownInput { name: String, known: Vec<String> },

    #[error("input `{name}` has shape {actual:?} but the model expects {expected}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: Vec<u64>,
    },

    #[error("input `{name}` has dtype {actual} but the model expects {expected}")]
    DtypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("device `{device}` is not available")]
    DeviceUnavailable { device: String },

    #[error("runner `{runner_name}` has no execution backend registered")]
    RunnerUnavailable { runner_name: String },

    #[error("inference failed in runner `{runner_name}`: {reason}")]
    Inference { runner_name: String, reason: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },
}

/// Result alias for carton operations.
pub type CartonResult<T> = Result<T, CartonError>;

impl CartonError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn corrupt(archive: &Path, reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            archive: archive.display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }

    pub fn serialization(reason: impl ToString) -> Self {
        Self::Serialization {
            reason: reason.to_string(),
        }
    }
}

fn compat_suffix(compat: &Option<String>) -> String {
    compat
        .as_deref()
        .map(|range| format!(" and compat version `{range}`"))
        .unwrap_or_default()
}

/// Adds path context to blocking I/O results, mirroring `anyhow::Context`.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, context: F) -> CartonResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, context: F) -> CartonResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|err| CartonError::io(context(), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_compatible_runner_names_the_request() {
        let err = CartonError::NoCompatibleRunner {
            runner_name: "torchscript".into(),
            required_framework_version: ">=2.0".into(),
            runner_compat_version: Some("=1".into()),
        };
        let message = err.to_string();
        assert!(message.contains("torchscript"));
        assert!(message.contains(">=2.0"));
        assert!(message.contains("compat version `=1`"));
    }

    #[test]
    fn io_errors_are_cloneable() {
        let err = CartonError::io(
            "failed to open cache",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert!(std::error::Error::source(&cloned).is_some());
    }
}
