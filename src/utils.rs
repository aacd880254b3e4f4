use crate::error::Result;
use ndarray::{Array3, ArrayView3, ArrayViewD, Axis};
use rayon::prelude::*;

/// Drops singleton axes from a view, leaving the first `keep` axes untouched.
pub fn squeeze_from<A>(view: ArrayViewD<'_, A>, keep: usize) -> ArrayViewD<'_, A> {
    let mut v = view;
    let mut axis = keep;

    while axis < v.ndim() {
        if v.shape()[axis] == 1 {
            v = v.remove_axis(Axis(axis));
        } else {
            axis += 1;
        }
    }
    v
}

// (i0, i1, w0, w1) per output index along one axis
fn axis_lut(n_in: usize, n_out: usize, align_corners: bool) -> Vec<(usize, usize, f32, f32)> {
    let last = (n_in - 1) as f32;
    (0..n_out)
        .map(|o| {
            let src = if align_corners {
                if n_out > 1 {
                    o as f32 * last / (n_out - 1) as f32
                } else {
                    0.0
                }
            } else {
                (o as f32 + 0.5) * n_in as f32 / n_out as f32 - 0.5
            };
            let src = src.clamp(0.0, last);
            let i0 = src.floor() as usize;
            let i1 = (i0 + 1).min(n_in - 1);
            let w1 = src - i0 as f32;
            (i0, i1, 1.0 - w1, w1)
        })
        .collect()
}

/// Bilinear resize of an (H, W, C) array to (out_h, out_w, C).
///
/// With `align_corners == false` pixel centres are mapped half-pixel style, so a resize
/// to the same size is the identity. With `align_corners == true` the corner samples of
/// input and output coincide.
pub fn resize_bilinear(
    ary_in: ArrayView3<'_, f32>,
    out_h: usize,
    out_w: usize,
    align_corners: bool,
) -> Result<Array3<f32>> {
    let (in_h, in_w, n_chn) = ary_in.dim();
    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 || n_chn == 0 {
        return Err(crate::SegError::invalid_input(format!(
            "cannot resize {in_h}x{in_w}x{n_chn} to {out_h}x{out_w}"
        )));
    }
    if (in_h, in_w) == (out_h, out_w) {
        return Ok(ary_in.to_owned());
    }

    let y_lut = axis_lut(in_h, out_h, align_corners);
    let x_lut = axis_lut(in_w, out_w, align_corners);

    let ary_std = ary_in.as_standard_layout();
    let base = ary_std
        .as_slice()
        .ok_or_else(|| crate::SegError::invalid_input("non-contiguous resize input"))?;

    let mut out = vec![0f32; out_h * out_w * n_chn];
    out.par_chunks_mut(n_chn)
        .enumerate()
        .for_each(|(idx, chunk)| {
            let (y0, y1, wy0, wy1) = y_lut[idx / out_w];
            let (x0, x1, wx0, wx1) = x_lut[idx % out_w];
            let w00 = wy0 * wx0;
            let w01 = wy0 * wx1;
            let w10 = wy1 * wx0;
            let w11 = wy1 * wx1;

            let base00 = (y0 * in_w + x0) * n_chn;
            let base01 = (y0 * in_w + x1) * n_chn;
            let base10 = (y1 * in_w + x0) * n_chn;
            let base11 = (y1 * in_w + x1) * n_chn;

            for c in 0..n_chn {
                chunk[c] = base[base00 + c] * w00
                    + base[base01 + c] * w01
                    + base[base10 + c] * w10
                    + base[base11 + c] * w11;
            }
        });

    Ok(Array3::from_shape_vec((out_h, out_w, n_chn), out)?)
}

/// Tracks the latest value and running average of a scalar, e.g. per-image timings.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
}

impl AverageMeter {
    pub fn update(&mut self, val: f64) {
        self.val = val;
        self.sum += val;
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Installs the global tracing subscriber, honouring `RUST_LOG` and defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
