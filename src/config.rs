//! Run configuration.
//!
//! A run is described by a JSON file whose keys mirror [`EvalConfig`]. Trailing
//! `KEY VALUE` pairs from the command line are merged over the file before it is
//! deserialised, and [`EvalConfig::validate`] rejects inconsistent settings before any
//! model is built or image is read.

use crate::error::{Result, SegError};
use crate::scheduler::DEFAULT_STRIDE_RATE;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const VALUE_SCALE: f32 = 255.0;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Model family selected by the `arch` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Psp,
    Psa,
    /// PSP head on a pluggable encoder (`of*` tags).
    OfPsp,
    /// PSP from the segmentation-models zoo (`smp*` tags).
    SmpPsp,
}

impl Arch {
    /// Resolves a configuration tag such as `psp`, `psa`, `ofpsp` or `smppsp`.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "psp" => Ok(Arch::Psp),
            "psa" => Ok(Arch::Psa),
            t if t.contains("of") && t.contains("psp") => Ok(Arch::OfPsp),
            t if t.contains("smp") && t.contains("psp") => Ok(Arch::SmpPsp),
            t if t.contains("psp") => Ok(Arch::Psp),
            other => Err(SegError::config(format!(
                "architecture '{other}' not supported yet"
            ))),
        }
    }

    /// Every family except PSA shares the PSP input-size rule.
    pub fn is_psp_family(self) -> bool {
        !matches!(self, Arch::Psa)
    }
}

/// Dataset split being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

fn default_scales() -> Vec<f32> {
    vec![1.0]
}

fn default_true() -> bool {
    true
}

fn default_stride_rate() -> f64 {
    DEFAULT_STRIDE_RATE
}

fn default_mean() -> [f32; 3] {
    IMAGENET_MEAN.map(|m| m * VALUE_SCALE)
}

fn default_std() -> Option<[f32; 3]> {
    Some(IMAGENET_STD.map(|s| s * VALUE_SCALE))
}

fn default_shrink_factor() -> usize {
    2
}

fn default_zoom_factor() -> usize {
    8
}

/// Complete description of one evaluation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalConfig {
    pub arch: String,
    #[serde(default)]
    pub layers: usize,
    pub classes: usize,
    #[serde(default = "default_zoom_factor")]
    pub zoom_factor: usize,
    pub split: Split,

    pub train_h: usize,
    pub train_w: usize,
    /// Crop size used by the tile engine.
    pub test_h: usize,
    pub test_w: usize,
    pub base_size: usize,
    #[serde(default = "default_scales")]
    pub scales: Vec<f32>,
    #[serde(default = "default_stride_rate")]
    pub stride_rate: f64,
    #[serde(default = "default_true")]
    pub flip: bool,
    /// Tile each scale with `test_h x test_w` crops; otherwise run one crop per scale.
    #[serde(default = "default_true")]
    pub multi_patch: bool,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: Option<[f32; 3]>,

    pub data_root: PathBuf,
    pub test_list: PathBuf,
    #[serde(default)]
    pub index_start: usize,
    #[serde(default)]
    pub index_step: usize,
    pub save_folder: PathBuf,
    pub colors_path: PathBuf,
    pub names_path: PathBuf,
    #[serde(default)]
    pub model_path: PathBuf,
    #[serde(default)]
    pub has_prediction: bool,
    /// Keep nested directory layout (last five path segments) in output names.
    #[serde(default)]
    pub is_med: bool,
    /// `[from, to]` pairs applied to targets before comparison.
    #[serde(default)]
    pub label_mapping: Option<Vec<[u8; 2]>>,

    #[serde(default)]
    pub compact: bool,
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: usize,
    #[serde(default)]
    pub mask_h: Option<usize>,
    #[serde(default)]
    pub mask_w: Option<usize>,
}

/// Merges `KEY VALUE` pairs into a JSON object; values parse as JSON when they can.
pub fn merge_overrides(cfg: &mut serde_json::Value, opts: &[String]) -> Result<()> {
    if opts.len() % 2 != 0 {
        return Err(SegError::config(format!(
            "override list must hold KEY VALUE pairs, got {} items",
            opts.len()
        )));
    }
    let obj = cfg
        .as_object_mut()
        .ok_or_else(|| SegError::config("config root must be a JSON object"))?;
    for pair in opts.chunks_exact(2) {
        let value = serde_json::from_str(&pair[1])
            .unwrap_or_else(|_| serde_json::Value::String(pair[1].clone()));
        obj.insert(pair[0].clone(), value);
    }
    Ok(())
}

impl EvalConfig {
    /// Reads the JSON file at `path`, applies overrides and validates the result.
    pub fn load(path: &Path, opts: &[String]) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut raw: serde_json::Value = serde_json::from_str(&contents)?;
        merge_overrides(&mut raw, opts)?;
        let mut cfg: EvalConfig = serde_json::from_value(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn arch_kind(&self) -> Result<Arch> {
        Arch::from_tag(&self.arch)
    }

    /// Checks the configuration and derives PSA mask sizes when they are implied.
    pub fn validate(&mut self) -> Result<()> {
        if self.classes <= 1 {
            return Err(SegError::config(format!(
                "classes must be greater than 1, got {}",
                self.classes
            )));
        }
        // label maps are stored as 8-bit gray images
        if self.classes > 256 {
            return Err(SegError::config(format!(
                "at most 256 classes are supported, got {}",
                self.classes
            )));
        }
        if ![1, 2, 4, 8].contains(&self.zoom_factor) {
            return Err(SegError::config(format!(
                "zoom_factor must be one of 1, 2, 4, 8, got {}",
                self.zoom_factor
            )));
        }
        if self.scales.is_empty() || self.scales.iter().any(|&s| !(s > 0.0)) {
            return Err(SegError::config("scales must be a non-empty list of positive factors"));
        }
        if self.test_h == 0 || self.test_w == 0 || self.base_size == 0 {
            return Err(SegError::config("test_h, test_w and base_size must be positive"));
        }
        if !(self.stride_rate > 0.0 && self.stride_rate <= 1.0) {
            return Err(SegError::config(format!(
                "stride_rate must be in (0, 1], got {}",
                self.stride_rate
            )));
        }
        if let Some(std) = self.std {
            if let Some(i) = std.iter().position(|&s| s <= 0.0) {
                return Err(SegError::config(format!(
                    "standard deviation at index {i} must be greater than 0"
                )));
            }
        }

        if !self.arch_kind()?.is_psp_family() {
            return self.validate_psa();
        }
        if self.train_h == 0
            || self.train_w == 0
            || (self.train_h - 1) % 8 != 0
            || (self.train_w - 1) % 8 != 0
        {
            return Err(SegError::config(format!(
                "psp models need (train_h - 1) and (train_w - 1) divisible by 8, got {}x{}",
                self.train_h, self.train_w
            )));
        }
        Ok(())
    }

    fn validate_psa(&mut self) -> Result<()> {
        if self.train_h == 0 || self.train_w == 0 || self.shrink_factor == 0 {
            return Err(SegError::config("psa needs positive train size and shrink_factor"));
        }
        let step = 8 * self.shrink_factor;
        let base_h = (self.train_h - 1) / step + 1;
        let base_w = (self.train_w - 1) / step + 1;

        if self.compact {
            self.mask_h = Some(base_h);
            self.mask_w = Some(base_w);
            return Ok(());
        }

        match (self.mask_h, self.mask_w) {
            (None, None) => {
                self.mask_h = Some(2 * base_h - 1);
                self.mask_w = Some(2 * base_w - 1);
                Ok(())
            }
            (Some(mask_h), Some(mask_w)) => {
                // both bounds come from train_h
                let bound = 2 * base_h - 1;
                for (name, mask) in [("mask_h", mask_h), ("mask_w", mask_w)] {
                    if mask % 2 != 1 || mask < 3 || mask > bound {
                        return Err(SegError::config(format!(
                            "{name} must be odd and within [3, {bound}], got {mask}"
                        )));
                    }
                }
                Ok(())
            }
            _ => Err(SegError::config("mask_h and mask_w must be set together")),
        }
    }

    pub fn gray_folder(&self) -> PathBuf {
        self.save_folder.join("gray")
    }

    pub fn color_folder(&self) -> PathBuf {
        self.save_folder.join("color")
    }
}
