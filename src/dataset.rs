//! Data list parsing and prediction persistence.

use crate::config::Split;
use crate::error::{Result, SegError};
use crate::prepro::is_nifti;
use image::{GrayImage, Rgb, RgbImage};
use ndarray::Array2;
use nifti::writer::WriterOptions;
use std::fs;
use std::path::{Path, PathBuf};

/// One image and its ground-truth label map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    pub image_path: PathBuf,
    pub label_path: PathBuf,
}

/// Parses a list file of `image [label]` lines relative to `data_root`.
///
/// Image-only lines are accepted for the test split, where the label path then repeats
/// the image path.
pub fn read_data_list(data_root: &Path, list_path: &Path, split: Split) -> Result<Vec<SampleEntry>> {
    let contents = fs::read_to_string(list_path)?;
    let mut entries = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let entry = match (fields.as_slice(), split) {
            ([], _) => continue,
            ([image], Split::Test) => SampleEntry {
                image_path: data_root.join(image),
                label_path: data_root.join(image),
            },
            ([image, label], _) => SampleEntry {
                image_path: data_root.join(image),
                label_path: data_root.join(label),
            },
            _ => {
                return Err(SegError::invalid_input(format!(
                    "image list file read line error at {}:{}: {line}",
                    list_path.display(),
                    lineno + 1
                )))
            }
        };
        entries.push(entry);
    }
    tracing::info!(split = ?split, total = entries.len(), "data list loaded");
    Ok(entries)
}

/// Keeps `[index_start, index_start + index_step)`; a zero step runs to the end.
pub fn select_range(entries: Vec<SampleEntry>, index_start: usize, index_step: usize) -> Vec<SampleEntry> {
    let index_end = if index_step == 0 {
        entries.len()
    } else {
        (index_start + index_step).min(entries.len())
    };
    entries
        .into_iter()
        .take(index_end)
        .skip(index_start)
        .collect()
}

/// Output name for a prediction derived from its target label path.
///
/// Flat layouts keep the file name; nested (`is_med`) layouts keep the last five path
/// segments. Every `label` in the result becomes `pred`.
pub fn image_name(target_path: &Path, is_med: bool) -> PathBuf {
    let keep = if is_med { 5 } else { 1 };
    let parts: Vec<String> = target_path
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let tail = parts[parts.len().saturating_sub(keep)..].join("/");
    PathBuf::from(tail.replace("label", "pred"))
}

/// Reads a colour table: one `r g b` row per class.
pub fn load_colors(path: &Path) -> Result<Vec<[u8; 3]>> {
    let contents = fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let rgb: Vec<u8> = line
                .split_whitespace()
                .map(|v| v.parse::<f64>().map(|f| f as u8))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| SegError::invalid_input(format!("bad colour row '{line}': {e}")))?;
            match rgb[..] {
                [r, g, b] => Ok([r, g, b]),
                _ => Err(SegError::invalid_input(format!(
                    "colour row needs 3 values: '{line}'"
                ))),
            }
        })
        .collect()
}

/// Reads class names, one per line.
pub fn load_names(path: &Path) -> Result<Vec<String>> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(|l| l.trim_end().to_string())
        .collect())
}

/// Maps class indices to colours; unknown classes are black.
pub fn colorize(gray: &Array2<u8>, colors: &[[u8; 3]]) -> RgbImage {
    let (h, w) = gray.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let label = gray[(y as usize, x as usize)] as usize;
        Rgb(colors.get(label).copied().unwrap_or([0, 0, 0]))
    })
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes a label map as 8-bit gray; `.nii`/`.nii.gz` names are written as NIfTI.
pub fn save_gray(gray: &Array2<u8>, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    if is_nifti(path) {
        // nifti is (x, y)
        return WriterOptions::new(path)
            .write_nifti(&gray.t())
            .map_err(|source| SegError::Nifti {
                path: path.to_path_buf(),
                source,
            });
    }
    let (h, w) = gray.dim();
    let img = GrayImage::from_raw(w as u32, h as u32, gray.iter().copied().collect())
        .ok_or_else(|| SegError::invalid_input("label map does not fit a gray image"))?;
    img.save(path)?;
    Ok(())
}

/// Writes the gray and colourised copies of a prediction, returning the gray path.
pub fn save_prediction(
    gray: &Array2<u8>,
    name: &Path,
    gray_folder: &Path,
    color_folder: &Path,
    colors: &[[u8; 3]],
) -> Result<PathBuf> {
    let gray_path = gray_folder.join(name);
    save_gray(gray, &gray_path)?;

    let mut color_path = color_folder.join(name);
    if is_nifti(&color_path) {
        let stem = color_path.to_string_lossy().replace(".nii.gz", "").replace(".nii", "");
        color_path = PathBuf::from(format!("{stem}.png"));
    }
    ensure_parent(&color_path)?;
    colorize(gray, colors).save(&color_path)?;
    Ok(gray_path)
}
