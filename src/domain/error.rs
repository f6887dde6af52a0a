// ============================================================
// Layer 3 — Error Taxonomy
// ============================================================
// Preprocessing errors (missing / corrupt annotation, invalid
// geometry) are per-sample: the sample is skipped and logged.
// Checkpoint and loss errors are per-run: the command aborts
// and exits non-zero.

use std::path::PathBuf;
use thiserror::Error;

pub type CrowdResult<T> = Result<T, CrowdError>;

#[derive(Debug, Error)]
pub enum CrowdError {
    /// No ground-truth file exists for the image
    #[error("no annotation for image '{image_id}' (expected one of: {searched})")]
    MissingAnnotation { image_id: String, searched: String },

    /// Annotation file exists but cannot be trusted
    #[error("corrupt annotation {path}: {reason}")]
    CorruptAnnotation { path: PathBuf, reason: String },

    /// Image dimensions are zero
    #[error("invalid geometry {width}x{height}: image dimensions must be positive")]
    InvalidGeometry { width: usize, height: usize },

    /// Checkpoint missing, unreadable or incompatible with the model definition
    #[error("cannot load checkpoint {path}: {reason}")]
    CheckpointLoad { path: PathBuf, reason: String },

    /// Training diverged; never retried
    #[error("non-finite loss ({value}) at epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize, value: f64 },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Processed sample store is inconsistent (bad metadata, shape mismatch)
    #[error("processed store error at {path}: {reason}")]
    Store { path: PathBuf, reason: String },
}

impl CrowdError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptAnnotation { path: path.into(), reason: reason.into() }
    }

    pub fn checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointLoad { path: path.into(), reason: reason.into() }
    }

    /// True for the errors that only invalidate a single sample.
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            Self::MissingAnnotation { .. }
                | Self::CorruptAnnotation { .. }
                | Self::InvalidGeometry { .. }
                | Self::Image { .. }
        )
    }
}
