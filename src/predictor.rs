//! Model adapter seam.
//!
//! The engines only need "normalised NCHW batch in, per-class score batch out". Model
//! construction is dispatched through [`PredictorRegistry`], keyed by the configured
//! architecture family.

use crate::config::{Arch, EvalConfig};
use crate::error::{Result, SegError};
use crate::utils::resize_bilinear;
use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis};
use std::collections::HashMap;

/// Raw network output. Only `primary` is used; auxiliary heads are ignored.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// (N, C, H', W') class scores.
    pub primary: Array4<f32>,
    pub aux: Vec<Array4<f32>>,
}

impl From<Array4<f32>> for ModelOutput {
    fn from(primary: Array4<f32>) -> Self {
        Self {
            primary,
            aux: Vec::new(),
        }
    }
}

/// A segmentation network.
pub trait Predictor {
    /// Runs the network on an (N, 3, H, W) batch that is already mean/std normalised.
    fn infer(&self, batch: ArrayView4<'_, f32>) -> Result<ModelOutput>;
}

impl<F> Predictor for F
where
    F: Fn(ArrayView4<'_, f32>) -> Result<ModelOutput>,
{
    fn infer(&self, batch: ArrayView4<'_, f32>) -> Result<ModelOutput> {
        self(batch)
    }
}

fn softmax_inplace(ary: &mut Array3<f32>) {
    for mut lane in ary.lanes_mut(Axis(2)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
}

/// Runs one crop through a predictor and returns (H, W, C) class probabilities.
pub struct NetProcess<'a, P: Predictor + ?Sized> {
    pub predictor: &'a P,
    pub mean: [f32; 3],
    pub std: Option<[f32; 3]>,
    /// Average with the prediction on the horizontally mirrored crop.
    pub flip: bool,
}

impl<'a, P: Predictor + ?Sized> NetProcess<'a, P> {
    fn to_input(&self, crop: ArrayView3<'_, f32>) -> Result<Array4<f32>> {
        let (h, w, n_chn) = crop.dim();
        if n_chn != 3 {
            return Err(SegError::invalid_input(format!(
                "expected 3 channels, got {n_chn}"
            )));
        }
        let n = if self.flip { 2 } else { 1 };
        let mut ary_inp = Array4::<f32>::zeros((n, n_chn, h, w));
        for c in 0..n_chn {
            let mean = self.mean[c];
            let std = self.std.map_or(1.0, |s| s[c]);
            let plane = crop.slice(s![.., .., c]).mapv(|v| (v - mean) / std);
            ary_inp.slice_mut(s![0, c, .., ..]).assign(&plane);
            if self.flip {
                ary_inp
                    .slice_mut(s![1, c, .., ..])
                    .assign(&plane.slice(s![.., ..;-1]));
            }
        }
        Ok(ary_inp)
    }

    pub fn run(&self, crop: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (h, w, _) = crop.dim();
        let ary_inp = self.to_input(crop)?;
        let n = ary_inp.len_of(Axis(0));

        let ary_out = self.predictor.infer(ary_inp.view())?.primary;
        let (n_out, n_cls, _, _) = ary_out.dim();
        if n_out != n || n_cls == 0 {
            return Err(SegError::invalid_input(format!(
                "predictor returned {:?} for a batch of {n}",
                ary_out.shape()
            )));
        }

        let mut probs = Vec::with_capacity(n);
        for b in 0..n {
            // (C, H', W') -> (H', W', C), then back to crop size with corners aligned
            let hwc = ary_out.index_axis(Axis(0), b).permuted_axes([1, 2, 0]);
            let mut ary_prob = resize_bilinear(hwc, h, w, true)?;
            softmax_inplace(&mut ary_prob);
            probs.push(ary_prob);
        }

        let mut ary_prob = probs.swap_remove(0);
        if let Some(ary_flip) = probs.pop() {
            ary_prob += &ary_flip.slice(s![.., ..;-1, ..]);
            ary_prob.mapv_inplace(|v| v / 2.0);
        }
        Ok(ary_prob)
    }
}

/// Constructs a predictor for a validated configuration.
pub type PredictorBuilder = fn(&EvalConfig) -> Result<Box<dyn Predictor>>;

/// Maps architecture families to predictor constructors.
pub struct PredictorRegistry {
    builders: HashMap<Arch, PredictorBuilder>,
}

impl Default for PredictorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for arch in [Arch::Psp, Arch::Psa, Arch::OfPsp, Arch::SmpPsp] {
            registry.register(arch, load_checkpoint);
        }
        registry
    }
}

impl PredictorRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Replaces the builder for `arch`.
    pub fn register(&mut self, arch: Arch, builder: PredictorBuilder) {
        self.builders.insert(arch, builder);
    }

    pub fn build(&self, cfg: &EvalConfig) -> Result<Box<dyn Predictor>> {
        let arch = cfg.arch_kind()?;
        let builder = self.builders.get(&arch).ok_or_else(|| {
            SegError::config(format!("no predictor registered for {arch:?}"))
        })?;
        tracing::info!(arch = %cfg.arch, layers = cfg.layers, classes = cfg.classes, "=> creating model ...");
        builder(cfg)
    }
}

fn load_checkpoint(cfg: &EvalConfig) -> Result<Box<dyn Predictor>> {
    if !cfg.model_path.exists() {
        return Err(SegError::MissingCheckpoint(cfg.model_path.clone()));
    }
    tracing::info!("=> loading checkpoint '{}'", cfg.model_path.display());
    let predictor = load_saved_model(cfg)?;
    tracing::info!("=> loaded checkpoint '{}'", cfg.model_path.display());
    Ok(predictor)
}

#[cfg(feature = "tensorflow")]
fn load_saved_model(cfg: &EvalConfig) -> Result<Box<dyn Predictor>> {
    Ok(Box::new(crate::tf_model::SavedModelPredictor::load(
        &cfg.model_path,
    )?))
}

#[cfg(not(feature = "tensorflow"))]
fn load_saved_model(cfg: &EvalConfig) -> Result<Box<dyn Predictor>> {
    Err(SegError::config(format!(
        "cannot load '{}': built without the `tensorflow` feature",
        cfg.model_path.display()
    )))
}
