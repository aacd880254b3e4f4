//! Error types for tiled inference and evaluation.
//!
//! Every fallible operation in the crate returns [`SegError`]. Per-image failures are
//! propagated to the caller instead of being skipped, since the metric running sums and
//! the overlap-normalised accumulators cannot tolerate partial entries.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while configuring, running or evaluating a segmentation run.
#[derive(Error, Debug)]
pub enum SegError {
    /// Error occurred while decoding or encoding a raster image.
    #[error("image load")]
    ImageLoad(#[from] image::ImageError),

    /// Error occurred while reading or writing a NIfTI volume.
    #[error("nifti io: {}", .path.display())]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    /// The predictor failed on a batch of crops.
    #[error("inference")]
    Inference(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Error indicating invalid input data.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Error indicating a configuration problem.
    #[error("configuration: {message}")]
    ConfigError { message: String },

    /// No checkpoint exists at the configured model path.
    #[error("no checkpoint found at '{}'", .0.display())]
    MissingCheckpoint(PathBuf),

    /// Configuration file could not be parsed.
    #[error("config parse")]
    ConfigParse(#[from] serde_json::Error),

    /// Error from tensor shape operations.
    #[error("tensor operation")]
    Tensor(#[from] ndarray::ShapeError),

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl SegError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SegError>;
