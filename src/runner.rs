//! Evaluation run: inference over a data list, then scoring of the saved predictions.

use crate::config::{EvalConfig, Split};
use crate::dataset::{
    image_name, load_colors, load_names, read_data_list, save_prediction, select_range,
    SampleEntry,
};
use crate::error::Result;
use crate::metrics::{intersection_and_union, ClassStats, EvalSummary};
use crate::multiscale::MultiScale;
use crate::predictor::{Predictor, PredictorRegistry};
use crate::prepro::{convert_label, load_image, load_label};
use crate::utils::AverageMeter;
use std::time::Instant;

/// Everything a run needs besides the model.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub cfg: EvalConfig,
    pub entries: Vec<SampleEntry>,
    pub colors: Vec<[u8; 3]>,
    pub names: Vec<String>,
}

impl EvalContext {
    pub fn load(cfg: EvalConfig) -> Result<Self> {
        let entries = read_data_list(&cfg.data_root, &cfg.test_list, cfg.split)?;
        let entries = select_range(entries, cfg.index_start, cfg.index_step);
        let colors = load_colors(&cfg.colors_path)?;
        let names = load_names(&cfg.names_path)?;
        if names.len() < cfg.classes {
            tracing::warn!(
                names = names.len(),
                classes = cfg.classes,
                "fewer class names than classes"
            );
        }
        Ok(Self {
            cfg,
            entries,
            colors,
            names,
        })
    }
}

/// Predicts every entry and writes gray and colour label maps under `save_folder`.
pub fn test<P: Predictor + ?Sized>(ctx: &EvalContext, predictor: &P) -> Result<()> {
    tracing::info!(">>>>>>>>>>>>>>>> Start Evaluation >>>>>>>>>>>>>>>>");
    let cfg = &ctx.cfg;
    let ms = MultiScale::from_config(predictor, cfg)?;
    let (gray_folder, color_folder) = (cfg.gray_folder(), cfg.color_folder());
    let total = ctx.entries.len();

    let mut data_time = AverageMeter::default();
    let mut batch_time = AverageMeter::default();
    let mut end = Instant::now();
    for (i, entry) in ctx.entries.iter().enumerate() {
        let image = load_image(&entry.image_path)?;
        data_time.update(end.elapsed().as_secs_f64());

        let prediction = ms.infer_multiscale(image.view())?;
        batch_time.update(end.elapsed().as_secs_f64());
        end = Instant::now();

        if (i + 1) % 10 == 0 || i + 1 == total {
            tracing::info!(
                "Test: [{}/{}] Data {:.3} ({:.3}) Batch {:.3} ({:.3}).",
                i + 1,
                total,
                data_time.val,
                data_time.avg(),
                batch_time.val,
                batch_time.avg()
            );
        }

        let name = image_name(&entry.label_path, cfg.is_med);
        save_prediction(&prediction, &name, &gray_folder, &color_folder, &ctx.colors)?;
    }
    tracing::info!("<<<<<<<<<<<<<<<<< End Evaluation <<<<<<<<<<<<<<<<<");
    Ok(())
}

/// Scores the saved predictions against their targets.
pub fn cal_acc(ctx: &EvalContext) -> Result<EvalSummary> {
    let cfg = &ctx.cfg;
    let gray_folder = cfg.gray_folder();
    let total = ctx.entries.len();
    let mut stats = ClassStats::new(cfg.classes);

    for (i, entry) in ctx.entries.iter().enumerate() {
        let name = image_name(&entry.label_path, cfg.is_med);
        let pred = load_label(&gray_folder.join(&name))?;
        let mut target = load_label(&entry.label_path)?;
        if let Some(mapping) = &cfg.label_mapping {
            target = convert_label(&target, mapping);
        }

        let image_stats = intersection_and_union(pred.view(), target.view(), cfg.classes)?;
        stats.update(&image_stats)?;
        tracing::info!(
            "Evaluating {}/{} on image {}, accuracy {:.4}, dice {:.4}.",
            i + 1,
            total,
            name.display(),
            image_stats.accuracy(),
            image_stats.foreground_dice()
        );
    }

    let summary = stats.summary();
    summary.log(&ctx.names);
    Ok(summary)
}

/// Full run: inference unless predictions already exist, then scoring unless the split
/// has no ground truth.
pub fn run(cfg: EvalConfig, registry: &PredictorRegistry) -> Result<Option<EvalSummary>> {
    tracing::info!(?cfg, "run configuration");
    tracing::info!(classes = cfg.classes, "Classes: {}", cfg.classes);
    let ctx = EvalContext::load(cfg)?;

    if !ctx.cfg.has_prediction {
        let predictor = registry.build(&ctx.cfg)?;
        test(&ctx, predictor.as_ref())?;
    }
    if ctx.cfg.split == Split::Test {
        return Ok(None);
    }
    cal_acc(&ctx).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Arch;
    use crate::predictor::ModelOutput;
    use ndarray::{s, Array4, ArrayView4};
    use std::fs;
    use std::path::Path;

    // class 1 wherever the red channel is above the mean, class 0 elsewhere
    fn red_threshold(batch: ArrayView4<'_, f32>) -> Result<ModelOutput> {
        let (n, _, h, w) = batch.dim();
        let mut ary = Array4::<f32>::zeros((n, 2, h, w));
        ary.slice_mut(s![.., 1, .., ..])
            .assign(&batch.slice(s![.., 0, .., ..]).mapv(|v| v * 10.0));
        Ok(ary.into())
    }

    fn build_red_threshold(_: &EvalConfig) -> Result<Box<dyn Predictor>> {
        Ok(Box::new(red_threshold))
    }

    fn write_sample(root: &Path, stem: &str, split_col: u32) {
        let (w, h) = (24u32, 16u32);
        let img = image::RgbImage::from_fn(w, h, |x, _| {
            if x < split_col {
                image::Rgb([250, 0, 0])
            } else {
                image::Rgb([5, 0, 0])
            }
        });
        img.save(root.join(format!("img/{stem}.png"))).unwrap();
        let label = image::GrayImage::from_fn(w, h, |x, _| {
            image::Luma([if x < split_col { 1 } else { 0 }])
        });
        label.save(root.join(format!("gt/{stem}_label.png"))).unwrap();
    }

    fn setup(root: &Path, split: &str) -> EvalConfig {
        fs::create_dir_all(root.join("img")).unwrap();
        fs::create_dir_all(root.join("gt")).unwrap();
        write_sample(root, "a", 8);
        write_sample(root, "b", 20);
        fs::write(
            root.join("list.txt"),
            "img/a.png gt/a_label.png\nimg/b.png gt/b_label.png\n",
        )
        .unwrap();
        fs::write(root.join("colors.txt"), "0 0 0\n255 255 255\n").unwrap();
        fs::write(root.join("names.txt"), "background\nforeground\n").unwrap();

        let mut cfg: EvalConfig = serde_json::from_value(serde_json::json!({
            "arch": "psp", "classes": 2, "split": split,
            "train_h": 9, "train_w": 9, "test_h": 10, "test_w": 10,
            "base_size": 24, "scales": [1.0, 0.5],
            "mean": [127.5, 0.0, 0.0], "std": null,
            "data_root": root, "test_list": root.join("list.txt"),
            "save_folder": root.join("out"),
            "colors_path": root.join("colors.txt"),
            "names_path": root.join("names.txt")
        }))
        .unwrap();
        cfg.validate().unwrap();
        cfg
    }

    #[test]
    fn end_to_end_perfect_predictor() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path(), "val");
        let ctx = EvalContext::load(cfg).unwrap();
        test(&ctx, &red_threshold).unwrap();
        assert!(dir.path().join("out/gray/a_pred.png").exists());
        assert!(dir.path().join("out/color/b_pred.png").exists());

        let summary = cal_acc(&ctx).unwrap();
        assert!(summary.all_acc > 0.95, "allAcc {}", summary.all_acc);
        assert!(summary.m_iou > 0.9, "mIoU {}", summary.m_iou);
    }

    #[test]
    fn registry_run_skips_scoring_on_test_split() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path(), "test");
        let mut registry = PredictorRegistry::empty();
        registry.register(Arch::Psp, build_red_threshold);
        assert!(run(cfg, &registry).unwrap().is_none());
        assert!(dir.path().join("out/gray/b_pred.png").exists());
    }

    #[test]
    fn has_prediction_reuses_saved_maps() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = setup(dir.path(), "val");
        let mut registry = PredictorRegistry::empty();
        registry.register(Arch::Psp, build_red_threshold);
        let first = run(cfg.clone(), &registry).unwrap().unwrap();

        cfg.has_prediction = true;
        // no builder needed once predictions exist
        let second = run(cfg, &PredictorRegistry::empty()).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn label_mapping_applies_to_targets() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = setup(dir.path(), "val");
        let ctx = EvalContext::load(cfg.clone()).unwrap();
        test(&ctx, &red_threshold).unwrap();

        // swapping target labels turns a perfect run into a fully wrong one
        cfg.label_mapping = Some(vec![[0, 1], [1, 0]]);
        let summary = cal_acc(&EvalContext::load(cfg).unwrap()).unwrap();
        assert!(summary.all_acc < 0.05, "allAcc {}", summary.all_acc);
    }

    #[test]
    fn missing_prediction_aborts_scoring() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path(), "val");
        assert!(cal_acc(&EvalContext::load(cfg).unwrap()).is_err());
    }
}
