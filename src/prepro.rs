use crate::error::{Result, SegError};
use crate::utils::{resize_bilinear, squeeze_from};
use ndarray::{s, Array2, Array3, ArrayD, ArrayView3, Ix2, Ix3};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::Path;

pub fn is_nifti(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".nii") || name.ends_with(".nii.gz")
}

/// Reads a NIfTI volume as a dense f32 array in (x, y, ...) index order.
pub fn load_nifti(path: &Path) -> Result<ArrayD<f32>> {
    let nifti_err = |source: nifti::NiftiError| SegError::Nifti {
        path: path.to_path_buf(),
        source,
    };
    let obj = ReaderOptions::new().read_file(path).map_err(nifti_err)?;
    let volume: ArrayD<f32> = obj.into_volume().into_ndarray::<f32>().map_err(nifti_err)?;
    Ok(volume)
}

// nifti slices are (x, y[, c]); images here are (row, col[, c]).
// Only axes past the two spatial ones are squeezed, so 1-pixel-wide slices survive.
fn nifti_slice_to_image(volume: ArrayD<f32>) -> Result<Array3<f32>> {
    let view = squeeze_from(volume.view(), 2);
    match view.ndim() {
        2 => {
            let ary_2d = view.into_dimensionality::<Ix2>()?.reversed_axes();
            let (h, w) = ary_2d.dim();
            Ok(Array3::from_shape_fn((h, w, 3), |(y, x, _)| ary_2d[(y, x)]))
        }
        3 if view.shape()[2] == 3 => {
            let ary_3d = view.into_dimensionality::<Ix3>()?;
            Ok(ary_3d.permuted_axes([1, 0, 2]).as_standard_layout().into_owned())
        }
        _ => Err(SegError::invalid_input(format!(
            "expected a 2-D slice or 3-channel slice, got shape {:?}",
            view.shape()
        ))),
    }
}

/// Loads an RGB image as an (H, W, 3) f32 array with intensities in [0, 255].
pub fn load_image(path: &Path) -> Result<Array3<f32>> {
    if is_nifti(path) {
        return nifti_slice_to_image(load_nifti(path)?);
    }
    let rgb = image::open(path)?.to_rgb8();
    let (w, h) = rgb.dimensions();
    let data: Vec<f32> = rgb.into_raw().into_iter().map(f32::from).collect();
    Ok(Array3::from_shape_vec((h as usize, w as usize, 3), data)?)
}

fn nifti_slice_to_label(volume: ArrayD<f32>) -> Result<Array2<u8>> {
    let view = squeeze_from(volume.view(), 2);
    let ary_2d = view.into_dimensionality::<Ix2>()?.reversed_axes();
    Ok(ary_2d.mapv(|v| v.round().clamp(0.0, 255.0) as u8))
}

/// Loads a single-channel label map.
pub fn load_label(path: &Path) -> Result<Array2<u8>> {
    if is_nifti(path) {
        return nifti_slice_to_label(load_nifti(path)?);
    }
    let gray = image::open(path)?.to_luma8();
    let (w, h) = gray.dimensions();
    Ok(Array2::from_shape_vec((h as usize, w as usize), gray.into_raw())?)
}

/// Translates label encodings; each `[from, to]` pair matches against the source values.
pub fn convert_label(label: &Array2<u8>, mapping: &[[u8; 2]]) -> Array2<u8> {
    let mut lut: [u8; 256] = std::array::from_fn(|i| i as u8);
    for &[from, to] in mapping {
        lut[from as usize] = to;
    }
    label.mapv(|v| lut[v as usize])
}

/// Border added around an image so it fits at least one crop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Padding {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Padding {
    /// Centres an `h x w` image in a canvas of at least `crop_h x crop_w`; odd
    /// remainders go to the bottom and right.
    pub fn to_fit(h: usize, w: usize, crop_h: usize, crop_w: usize) -> Self {
        let pad_h = crop_h.saturating_sub(h);
        let pad_w = crop_w.saturating_sub(w);
        Self {
            top: pad_h / 2,
            bottom: pad_h - pad_h / 2,
            left: pad_w / 2,
            right: pad_w - pad_w / 2,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Pads with a per-channel constant, e.g. the channel mean.
pub fn pad_constant(image: ArrayView3<'_, f32>, pad: Padding, value: &[f32]) -> Array3<f32> {
    let (h, w, n_chn) = image.dim();
    let new_h = h + pad.top + pad.bottom;
    let new_w = w + pad.left + pad.right;
    let mut ary_out = Array3::from_shape_fn((new_h, new_w, n_chn), |(_, _, c)| {
        value.get(c).copied().unwrap_or(0.0)
    });
    ary_out
        .slice_mut(s![pad.top..pad.top + h, pad.left..pad.left + w, ..])
        .assign(&image);
    ary_out
}

/// Bilinear image resize with half-pixel centres.
pub fn resize_image(image: ArrayView3<'_, f32>, new_h: usize, new_w: usize) -> Result<Array3<f32>> {
    resize_bilinear(image, new_h, new_w, false)
}

/// Output size whose longer side equals `long_side`, short side rounded proportionally.
pub fn scaled_size(h: usize, w: usize, long_side: usize) -> (usize, usize) {
    if h > w {
        let new_w = (long_side as f64 / h as f64 * w as f64).round_ties_even() as usize;
        (long_side, new_w.max(1))
    } else {
        let new_h = (long_side as f64 / w as f64 * h as f64).round_ties_even() as usize;
        (new_h.max(1), long_side)
    }
}
