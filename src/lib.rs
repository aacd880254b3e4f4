//! Sliding-window, multi-scale inference for semantic segmentation models, and
//! streamed per-class evaluation of the resulting label maps.
//!
//! The pipeline for one image is: resize per scale, tile with overlapping crops
//! ([`scheduler`]), run the model on each crop and average overlaps ([`tiled`]), average
//! the scales and take the argmax ([`multiscale`]). [`metrics`] accumulates
//! intersection/union/target counts per class across a dataset.

pub mod config;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod multiscale;
pub mod postpro;
pub mod predictor;
pub mod prepro;
pub mod runner;
pub mod scheduler;
#[cfg(feature = "tensorflow")]
pub mod tf_model;
pub mod tiled;
pub mod utils;

pub use config::{Arch, EvalConfig, Split};
pub use error::{Result, SegError};
pub use metrics::{intersection_and_union, ClassStats, EvalSummary};
pub use multiscale::{CropMode, MultiScale};
pub use predictor::{ModelOutput, Predictor, PredictorRegistry};
pub use scheduler::{crop_windows, CropGrid, CropWindow};
pub use tiled::{RunningAccumulator, TileEngine};
