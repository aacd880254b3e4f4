//! Multi-scale test-time inference.
//!
//! Each scale resizes the image so its longer side is `round(scale * base_size)`, tiles
//! it, and maps the probabilities back to the original resolution. Scale results are
//! averaged before the per-pixel argmax.

use crate::config::EvalConfig;
use crate::error::{Result, SegError};
use crate::postpro::argmax;
use crate::predictor::Predictor;
use crate::prepro::{resize_image, scaled_size};
use crate::tiled::TileEngine;
use ndarray::{Array2, Array3, ArrayView3};

/// How each rescaled image is split before inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropMode {
    /// Overlapping `crop_h x crop_w` windows.
    Tiled { crop_h: usize, crop_w: usize },
    /// One window covering the whole rescaled image.
    Direct,
}

pub struct MultiScale<'a, P: Predictor + ?Sized> {
    engine: TileEngine<'a, P>,
    classes: usize,
    scales: Vec<f32>,
    base_size: usize,
    mode: CropMode,
}

impl<'a, P: Predictor + ?Sized> MultiScale<'a, P> {
    /// Fails on an empty or non-positive scale list, a zero base size, or a class count
    /// that does not fit an 8-bit label map.
    pub fn new(
        engine: TileEngine<'a, P>,
        classes: usize,
        scales: Vec<f32>,
        base_size: usize,
        mode: CropMode,
    ) -> Result<Self> {
        if scales.is_empty() {
            return Err(SegError::invalid_input("at least one scale is required"));
        }
        if let Some(bad) = scales.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(SegError::invalid_input(format!(
                "scale factors must be positive, got {bad}"
            )));
        }
        if base_size == 0 {
            return Err(SegError::invalid_input("base_size must be positive"));
        }
        if classes == 0 || classes > 256 {
            return Err(SegError::invalid_input(format!(
                "class count must be in 1..=256, got {classes}"
            )));
        }
        if let CropMode::Tiled { crop_h, crop_w } = mode {
            if crop_h == 0 || crop_w == 0 {
                return Err(SegError::invalid_input(format!(
                    "crop size must be positive, got {crop_h}x{crop_w}"
                )));
            }
        }
        Ok(Self {
            engine,
            classes,
            scales,
            base_size,
            mode,
        })
    }

    /// Builds the orchestrator described by a validated configuration.
    pub fn from_config(predictor: &'a P, cfg: &EvalConfig) -> Result<Self> {
        let engine = TileEngine::new(
            predictor,
            cfg.classes,
            cfg.mean,
            cfg.std,
            cfg.flip,
            cfg.stride_rate,
        );
        let mode = if cfg.multi_patch {
            CropMode::Tiled {
                crop_h: cfg.test_h,
                crop_w: cfg.test_w,
            }
        } else {
            CropMode::Direct
        };
        Self::new(engine, cfg.classes, cfg.scales.clone(), cfg.base_size, mode)
    }

    /// Scale-averaged class probabilities at the image's own resolution.
    pub fn infer_probs(&self, image: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (h, w, _) = image.dim();
        let mut prediction = Array3::<f32>::zeros((h, w, self.classes));

        for &scale in &self.scales {
            let long_side = (scale as f64 * self.base_size as f64).round_ties_even() as usize;
            let (new_h, new_w) = scaled_size(h, w, long_side.max(1));
            let image_scale = resize_image(image, new_h, new_w)?;
            let (crop_h, crop_w) = match self.mode {
                CropMode::Tiled { crop_h, crop_w } => (crop_h, crop_w),
                CropMode::Direct => (new_h, new_w),
            };
            tracing::debug!(scale, new_h, new_w, crop_h, crop_w, "scale pass");
            prediction += &self
                .engine
                .infer_tiled(image_scale.view(), crop_h, crop_w, h, w)?;
        }

        let n_scales = self.scales.len() as f32;
        prediction.mapv_inplace(|v| v / n_scales);
        Ok(prediction)
    }

    /// Final label map for one image.
    pub fn infer_multiscale(&self, image: ArrayView3<'_, f32>) -> Result<Array2<u8>> {
        argmax(self.infer_probs(image)?.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::{ModelOutput, NetProcess};
    use crate::scheduler::DEFAULT_STRIDE_RATE;
    use ndarray::{Array4, ArrayView4, Axis};

    // per-pixel logits taken straight from the (normalised) input channels
    fn channel_logits(batch: ArrayView4<'_, f32>) -> Result<ModelOutput> {
        Ok(batch.to_owned().into())
    }

    fn striped_image(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| ((y * 7 + x * 3 + c * 11) % 13) as f32)
    }

    #[test]
    fn single_crop_single_scale_matches_whole_image_pass() {
        let image = striped_image(12, 20);
        let engine = TileEngine::new(&channel_logits, 3, [6.0; 3], None, true, DEFAULT_STRIDE_RATE);
        let ms = MultiScale::new(
            engine,
            3,
            vec![1.0],
            20,
            CropMode::Tiled {
                crop_h: 24,
                crop_w: 24,
            },
        )
        .unwrap();
        let labels = ms.infer_multiscale(image.view()).unwrap();

        let net = NetProcess {
            predictor: &channel_logits,
            mean: [6.0; 3],
            std: None,
            flip: true,
        };
        let direct = argmax(net.run(image.view()).unwrap().view()).unwrap();
        assert_eq!(labels, direct);
    }

    #[test]
    fn direct_mode_equals_exact_fit_tiling() {
        let image = striped_image(9, 15);
        let engine = TileEngine::new(&channel_logits, 3, [6.0; 3], None, false, DEFAULT_STRIDE_RATE);
        let direct = MultiScale::new(engine, 3, vec![1.0], 15, CropMode::Direct).unwrap();
        let engine = TileEngine::new(&channel_logits, 3, [6.0; 3], None, false, DEFAULT_STRIDE_RATE);
        let tiled = MultiScale::new(
            engine,
            3,
            vec![1.0],
            15,
            CropMode::Tiled {
                crop_h: 9,
                crop_w: 15,
            },
        )
        .unwrap();
        assert_eq!(
            direct.infer_probs(image.view()).unwrap(),
            tiled.infer_probs(image.view()).unwrap()
        );
    }

    #[test]
    fn multiscale_is_deterministic_and_normalised() {
        let image = striped_image(30, 40);
        let engine = TileEngine::new(
            &channel_logits,
            3,
            [6.0; 3],
            Some([3.0; 3]),
            true,
            DEFAULT_STRIDE_RATE,
        );
        let ms = MultiScale::new(
            engine,
            3,
            vec![0.5, 1.0, 1.75],
            40,
            CropMode::Tiled {
                crop_h: 17,
                crop_w: 17,
            },
        )
        .unwrap();
        let probs = ms.infer_probs(image.view()).unwrap();
        assert_eq!(probs.dim(), (30, 40, 3));
        for lane in probs.lanes(Axis(2)) {
            assert!((lane.sum() - 1.0).abs() < 1e-4);
        }
        assert_eq!(
            ms.infer_multiscale(image.view()).unwrap(),
            ms.infer_multiscale(image.view()).unwrap()
        );
    }

    #[test]
    fn up_down_resize_keeps_label_counts_close() {
        let image = Array3::from_shape_fn((32, 32, 3), |(y, x, c)| {
            if (x < 16) == (c == 0) && y < 24 {
                200.0
            } else {
                0.0
            }
        });
        let count =
            |labels: &Array2<u8>, cls: u8| labels.iter().filter(|&&l| l == cls).count() as i64;

        let engine = TileEngine::new(&channel_logits, 3, [0.0; 3], None, false, DEFAULT_STRIDE_RATE);
        let base = MultiScale::new(engine, 3, vec![1.0], 32, CropMode::Direct).unwrap();
        let engine = TileEngine::new(&channel_logits, 3, [0.0; 3], None, false, DEFAULT_STRIDE_RATE);
        let upscaled = MultiScale::new(engine, 3, vec![2.0], 32, CropMode::Direct).unwrap();

        let a = base.infer_multiscale(image.view()).unwrap();
        let b = upscaled.infer_multiscale(image.view()).unwrap();
        for cls in 0..3u8 {
            // boundary pixels may flip, interiors may not
            assert!((count(&a, cls) - count(&b, cls)).abs() <= 2 * 32 * 2);
        }
    }

    #[test]
    fn output_keeps_input_resolution_at_every_scale() {
        let image = striped_image(21, 13);
        let engine = TileEngine::new(&channel_logits, 3, [6.0; 3], None, false, DEFAULT_STRIDE_RATE);
        let ms = MultiScale::new(
            engine,
            3,
            vec![0.75, 1.25],
            24,
            CropMode::Tiled {
                crop_h: 10,
                crop_w: 10,
            },
        )
        .unwrap();
        assert_eq!(ms.infer_multiscale(image.view()).unwrap().dim(), (21, 13));
    }

    #[test]
    fn constant_predictor_gives_constant_labels() {
        let constant = |batch: ArrayView4<'_, f32>| -> Result<ModelOutput> {
            let (n, _, h, w) = batch.dim();
            let ary = Array4::from_shape_fn((n, 4, h, w), |(_, c, _, _)| {
                if c == 2 {
                    1.0f32
                } else {
                    0.0
                }
            });
            Ok(ary.into())
        };
        let image = striped_image(19, 23);
        let engine = TileEngine::new(&constant, 4, [0.0; 3], None, true, DEFAULT_STRIDE_RATE);
        let ms = MultiScale::new(
            engine,
            4,
            vec![0.5, 1.0],
            23,
            CropMode::Tiled {
                crop_h: 8,
                crop_w: 8,
            },
        )
        .unwrap();
        assert!(ms.infer_multiscale(image.view()).unwrap().iter().all(|&l| l == 2));
    }

    #[test]
    fn empty_or_non_positive_scales_are_rejected() {
        for scales in [vec![], vec![1.0, 0.0], vec![-0.5], vec![f32::NAN]] {
            let engine =
                TileEngine::new(&channel_logits, 3, [6.0; 3], None, false, DEFAULT_STRIDE_RATE);
            assert!(MultiScale::new(engine, 3, scales, 4, CropMode::Direct).is_err());
        }
    }

    #[test]
    fn class_count_must_fit_label_map() {
        for classes in [0, 257] {
            let engine =
                TileEngine::new(&channel_logits, 3, [6.0; 3], None, false, DEFAULT_STRIDE_RATE);
            assert!(MultiScale::new(engine, classes, vec![1.0], 4, CropMode::Direct).is_err());
        }
        let engine = TileEngine::new(&channel_logits, 3, [6.0; 3], None, false, DEFAULT_STRIDE_RATE);
        let zero_crop = CropMode::Tiled {
            crop_h: 0,
            crop_w: 4,
        };
        assert!(MultiScale::new(engine, 3, vec![1.0], 4, zero_crop).is_err());
    }
}
