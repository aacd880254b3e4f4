//! Tiled inference at a single scale.
//!
//! The (optionally padded) image is covered with overlapping crops; every crop's class
//! probabilities are summed into a running accumulator together with a per-pixel window
//! count, and the mean is cropped back to the unpadded region and resized to the
//! requested output size.

use crate::error::{Result, SegError};
use crate::postpro::normalize_overlap;
use crate::predictor::{NetProcess, Predictor};
use crate::prepro::{pad_constant, Padding};
use crate::scheduler::{CropGrid, CropWindow};
use crate::utils::resize_bilinear;
use ndarray::{s, Array2, Array3, ArrayView3, CowArray, Ix3};

/// Running sum of class probabilities and window count over a padded canvas.
#[derive(Debug, Clone)]
pub struct RunningAccumulator {
    ary_out: Array3<f32>,
    ary_counter: Array2<f32>,
}

impl RunningAccumulator {
    pub fn new(new_h: usize, new_w: usize, classes: usize) -> Self {
        Self {
            ary_out: Array3::zeros((new_h, new_w, classes)),
            ary_counter: Array2::zeros((new_h, new_w)),
        }
    }

    pub fn add(&mut self, win: CropWindow, ary_prob: ArrayView3<'_, f32>) -> Result<()> {
        let mut out_sub = self
            .ary_out
            .slice_mut(s![win.start_row..win.end_row, win.start_col..win.end_col, ..]);
        if out_sub.dim() != ary_prob.dim() {
            return Err(SegError::invalid_input(format!(
                "crop prediction {:?} does not fit window {:?}",
                ary_prob.dim(),
                out_sub.dim()
            )));
        }
        out_sub += &ary_prob;

        let mut cnt_sub = self
            .ary_counter
            .slice_mut(s![win.start_row..win.end_row, win.start_col..win.end_col]);
        cnt_sub += 1.0;
        Ok(())
    }

    pub fn counter(&self) -> &Array2<f32> {
        &self.ary_counter
    }

    /// Overlap-averaged probabilities for the whole canvas.
    pub fn normalize(&self) -> Result<Array3<f32>> {
        normalize_overlap(self.ary_out.view(), self.ary_counter.view())
    }
}

/// Sliding-window inference engine for one predictor.
pub struct TileEngine<'a, P: Predictor + ?Sized> {
    net: NetProcess<'a, P>,
    classes: usize,
    stride_rate: f64,
}

impl<'a, P: Predictor + ?Sized> TileEngine<'a, P> {
    pub fn new(
        predictor: &'a P,
        classes: usize,
        mean: [f32; 3],
        std: Option<[f32; 3]>,
        flip: bool,
        stride_rate: f64,
    ) -> Self {
        Self {
            net: NetProcess {
                predictor,
                mean,
                std,
                flip,
            },
            classes,
            stride_rate,
        }
    }

    /// Class probabilities for `image`, resized to `out_h x out_w`.
    ///
    /// Images smaller than the crop are padded with the channel mean, centred, before
    /// tiling; the padding is removed again before the final resize.
    pub fn infer_tiled(
        &self,
        image: ArrayView3<'_, f32>,
        crop_h: usize,
        crop_w: usize,
        out_h: usize,
        out_w: usize,
    ) -> Result<Array3<f32>> {
        let (ori_h, ori_w, _) = image.dim();
        let pad = Padding::to_fit(ori_h, ori_w, crop_h, crop_w);
        let padded: CowArray<'_, f32, Ix3> = if pad.is_zero() {
            image.into()
        } else {
            pad_constant(image, pad, &self.net.mean).into()
        };
        let (new_h, new_w, _) = padded.dim();

        let grid = CropGrid::new(new_h, new_w, crop_h, crop_w, self.stride_rate)?;
        tracing::debug!(
            new_h,
            new_w,
            grid_h = grid.grid_h,
            grid_w = grid.grid_w,
            "tiling"
        );

        let mut acc = RunningAccumulator::new(new_h, new_w, self.classes);
        for win in grid.windows() {
            let image_crop =
                padded.slice(s![win.start_row..win.end_row, win.start_col..win.end_col, ..]);
            let ary_prob = self.net.run(image_crop)?;
            acc.add(win, ary_prob.view())?;
        }

        let ary_mean_prob = acc.normalize()?;
        let ary_mean_prob = ary_mean_prob.slice(s![
            pad.top..pad.top + ori_h,
            pad.left..pad.left + ori_w,
            ..
        ]);
        resize_bilinear(ary_mean_prob, out_h, out_w, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::ModelOutput;
    use crate::scheduler::DEFAULT_STRIDE_RATE;
    use ndarray::{Array4, ArrayView4};

    // logits ln(1), ln(2), ln(5): softmax gives 0.125, 0.25, 0.625 everywhere
    fn constant_logits(batch: ArrayView4<'_, f32>) -> Result<ModelOutput> {
        let (n, _, h, w) = batch.dim();
        let logits = [1.0f32.ln(), 2.0f32.ln(), 5.0f32.ln()];
        Ok(Array4::from_shape_fn((n, 3, h, w), |(_, c, _, _)| logits[c]).into())
    }

    fn failing(_: ArrayView4<'_, f32>) -> Result<ModelOutput> {
        Err(SegError::invalid_input("device lost"))
    }

    #[test]
    fn constant_scores_survive_overlap_averaging() {
        let image = Array3::from_shape_fn((37, 50, 3), |(y, x, c)| (y * x + c) as f32);
        let engine = TileEngine::new(&constant_logits, 3, [0.0; 3], None, true, DEFAULT_STRIDE_RATE);
        let prob = engine.infer_tiled(image.view(), 16, 12, 37, 50).unwrap();
        assert_eq!(prob.dim(), (37, 50, 3));
        for (i, expect) in [0.125f32, 0.25, 0.625].iter().enumerate() {
            assert!(prob
                .slice(s![.., .., i])
                .iter()
                .all(|&p| (p - expect).abs() < 1e-5));
        }
    }

    #[test]
    fn counter_covers_padded_canvas() {
        let image = Array3::<f32>::zeros((10, 31, 3));
        let grid = CropGrid::new(10, 31, 6, 9, DEFAULT_STRIDE_RATE).unwrap();
        let mut acc = RunningAccumulator::new(10, 31, 1);
        let engine = TileEngine::new(&constant_logits, 3, [0.0; 3], None, false, DEFAULT_STRIDE_RATE);
        for win in grid.windows() {
            let crop = image.slice(s![win.start_row..win.end_row, win.start_col..win.end_col, ..]);
            let prob = engine.net.run(crop).unwrap();
            acc.add(win, prob.slice(s![.., .., 0..1])).unwrap();
        }
        assert!(acc.counter().iter().all(|&c| c >= 1.0));
    }

    #[test]
    fn small_image_is_padded_and_cropped_back() {
        let image = Array3::<f32>::zeros((5, 7, 3));
        let engine = TileEngine::new(&constant_logits, 3, [1.0; 3], None, false, DEFAULT_STRIDE_RATE);
        let prob = engine.infer_tiled(image.view(), 16, 16, 10, 14).unwrap();
        assert_eq!(prob.dim(), (10, 14, 3));
    }

    #[test]
    fn predictor_failure_aborts_the_image() {
        let image = Array3::<f32>::zeros((8, 8, 3));
        let engine = TileEngine::new(&failing, 3, [0.0; 3], None, false, DEFAULT_STRIDE_RATE);
        assert!(engine.infer_tiled(image.view(), 4, 4, 8, 8).is_err());
    }

    #[test]
    fn class_count_mismatch_is_reported() {
        let image = Array3::<f32>::zeros((8, 8, 3));
        let engine = TileEngine::new(&constant_logits, 2, [0.0; 3], None, false, DEFAULT_STRIDE_RATE);
        assert!(engine.infer_tiled(image.view(), 4, 4, 8, 8).is_err());
    }
}
