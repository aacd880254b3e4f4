//! Crop window scheduling over a padded image.
//!
//! Windows are laid out on a regular grid with `stride = ceil(crop * stride_rate)` and the
//! last window along each axis is pulled back so it ends exactly at the image border.

use crate::error::{Result, SegError};

/// Stride rate used when none is configured.
pub const DEFAULT_STRIDE_RATE: f64 = 2.0 / 3.0;

/// Half-open window `[start_row, end_row) x [start_col, end_col)` into a padded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub start_row: usize,
    pub end_row: usize,
    pub start_col: usize,
    pub end_col: usize,
}

/// Grid of crop windows for one padded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropGrid {
    pub new_h: usize,
    pub new_w: usize,
    pub crop_h: usize,
    pub crop_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub grid_h: usize,
    pub grid_w: usize,
}

fn axis_stride(crop: usize, stride_rate: f64) -> usize {
    ((crop as f64 * stride_rate).ceil() as usize).max(1)
}

fn axis_count(new_dim: usize, crop: usize, stride: usize) -> usize {
    (new_dim - crop).div_ceil(stride) + 1
}

// start of the index-th window, pulled back when it would run past the border
fn axis_start(index: usize, stride: usize, crop: usize, new_dim: usize) -> usize {
    let start = index * stride;
    if start + crop > new_dim {
        new_dim - crop
    } else {
        start
    }
}

impl CropGrid {
    /// Plans the grid. The image must already be padded to at least the crop size.
    pub fn new(
        new_h: usize,
        new_w: usize,
        crop_h: usize,
        crop_w: usize,
        stride_rate: f64,
    ) -> Result<Self> {
        if crop_h == 0 || crop_w == 0 {
            return Err(SegError::invalid_input("crop size must be positive"));
        }
        if !(stride_rate > 0.0 && stride_rate <= 1.0) {
            return Err(SegError::invalid_input(format!(
                "stride rate must be in (0, 1], got {stride_rate}"
            )));
        }
        if new_h < crop_h || new_w < crop_w {
            return Err(SegError::invalid_input(format!(
                "image {new_h}x{new_w} is smaller than crop {crop_h}x{crop_w}, pad it first"
            )));
        }

        let stride_h = axis_stride(crop_h, stride_rate);
        let stride_w = axis_stride(crop_w, stride_rate);
        Ok(Self {
            new_h,
            new_w,
            crop_h,
            crop_w,
            stride_h,
            stride_w,
            grid_h: axis_count(new_h, crop_h, stride_h),
            grid_w: axis_count(new_w, crop_w, stride_w),
        })
    }

    pub fn len(&self) -> usize {
        self.grid_h * self.grid_w
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Window of grid cell (index_h, index_w).
    pub fn window(&self, index_h: usize, index_w: usize) -> CropWindow {
        let start_row = axis_start(index_h, self.stride_h, self.crop_h, self.new_h);
        let start_col = axis_start(index_w, self.stride_w, self.crop_w, self.new_w);
        CropWindow {
            start_row,
            end_row: start_row + self.crop_h,
            start_col,
            end_col: start_col + self.crop_w,
        }
    }

    /// Windows in row-major grid order.
    pub fn windows(&self) -> impl Iterator<Item = CropWindow> + '_ {
        (0..self.grid_h).flat_map(move |ih| (0..self.grid_w).map(move |iw| self.window(ih, iw)))
    }
}

/// Convenience wrapper returning every window for the given padded size.
pub fn crop_windows(
    new_h: usize,
    new_w: usize,
    crop_h: usize,
    crop_w: usize,
    stride_rate: f64,
) -> Result<Vec<CropWindow>> {
    Ok(CropGrid::new(new_h, new_w, crop_h, crop_w, stride_rate)?
        .windows()
        .collect())
}
