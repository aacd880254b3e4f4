use crate::error::{Result, SegError};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

/// Divides accumulated class scores by the per-pixel window count.
pub fn normalize_overlap(
    ary_out: ArrayView3<'_, f32>,     // (h, w, C)
    ary_counter: ArrayView2<'_, f32>, // (h, w)
) -> Result<Array3<f32>> {
    if ary_counter.iter().any(|&c| c <= 0.0) {
        return Err(SegError::invalid_input(
            "overlap count is zero inside the tiled region",
        ));
    }

    // --- ary_mean_prob = ary_out / ary_counter[:, :, None] ---
    let ary_counter_b = ary_counter.insert_axis(Axis(2)); // (h, w, 1)
    Ok(&ary_out / &ary_counter_b)
}

/// Per-pixel index of the highest class score.
pub fn argmax(ary_prob: ArrayView3<'_, f32>) -> Result<Array2<u8>> {
    let (h, w, n_channels) = ary_prob.dim();
    if n_channels == 0 || n_channels > 256 {
        return Err(SegError::invalid_input(format!(
            "cannot encode {n_channels} classes as 8-bit labels"
        )));
    }
    let mut ary_pred = Array2::<u8>::zeros((h, w));

    for y in 0..h {
        for x in 0..w {
            let mut max_val = f32::MIN;
            let mut max_idx = 0usize;
            for c in 0..n_channels {
                let v = ary_prob[(y, x, c)];
                // first maximum wins on ties
                if v > max_val {
                    max_val = v;
                    max_idx = c;
                }
            }
            ary_pred[(y, x)] = max_idx as u8;
        }
    }

    Ok(ary_pred)
}
