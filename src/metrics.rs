//! Per-class confusion statistics.
//!
//! Only the diagonal and the marginals of the confusion matrix are kept: per class the
//! intersection, the union and the target pixel count. Per-image vectors are summed into
//! a run-wide [`ClassStats`], from which IoU, accuracy and Dice are derived.

use crate::error::{Result, SegError};
use ndarray::ArrayView2;

/// Added to every denominator so absent classes yield 0 instead of NaN.
pub const EPSILON: f64 = 1e-10;

/// Intersection, union and target counts per class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub intersection: Vec<u64>,
    pub union: Vec<u64>,
    pub target: Vec<u64>,
}

/// Counts for one prediction/target pair.
///
/// Pixels whose target is not a valid class (e.g. an ignore label of 255) are skipped;
/// predictions outside `[0, classes)` never match and only the target side is counted.
pub fn intersection_and_union(
    prediction: ArrayView2<'_, u8>,
    target: ArrayView2<'_, u8>,
    classes: usize,
) -> Result<ClassStats> {
    if prediction.dim() != target.dim() {
        return Err(SegError::invalid_input(format!(
            "prediction {:?} and target {:?} differ in size",
            prediction.dim(),
            target.dim()
        )));
    }

    let mut stats = ClassStats::new(classes);
    let mut area_output = vec![0u64; classes];
    for (&p, &t) in prediction.iter().zip(target.iter()) {
        let (p, t) = (p as usize, t as usize);
        if t >= classes {
            continue;
        }
        stats.target[t] += 1;
        if p < classes {
            area_output[p] += 1;
            if p == t {
                stats.intersection[t] += 1;
            }
        }
    }
    for c in 0..classes {
        stats.union[c] = area_output[c] + stats.target[c] - stats.intersection[c];
    }
    Ok(stats)
}

fn ratio(num: u64, den: u64) -> f64 {
    num as f64 / (den as f64 + EPSILON)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

impl ClassStats {
    pub fn new(classes: usize) -> Self {
        Self {
            intersection: vec![0; classes],
            union: vec![0; classes],
            target: vec![0; classes],
        }
    }

    pub fn classes(&self) -> usize {
        self.intersection.len()
    }

    /// Adds another set of counts for the same classes.
    pub fn update(&mut self, other: &ClassStats) -> Result<()> {
        if other.classes() != self.classes() {
            return Err(SegError::invalid_input(format!(
                "cannot merge stats for {} classes into {}",
                other.classes(),
                self.classes()
            )));
        }
        let pairs = [
            (&mut self.intersection, &other.intersection),
            (&mut self.union, &other.union),
            (&mut self.target, &other.target),
        ];
        for (acc, add) in pairs {
            acc.iter_mut().zip(add).for_each(|(a, b)| *a += b);
        }
        Ok(())
    }

    /// Reduce step for stats gathered by independent workers.
    pub fn merge(mut self, other: &ClassStats) -> Result<Self> {
        self.update(other)?;
        Ok(self)
    }

    /// Overall pixel accuracy.
    pub fn accuracy(&self) -> f64 {
        ratio(self.intersection.iter().sum(), self.target.iter().sum())
    }

    /// Dice over all foreground classes pooled together.
    pub fn foreground_dice(&self) -> f64 {
        let inter: u64 = self.intersection.iter().skip(1).sum();
        let union: u64 = self.union.iter().skip(1).sum();
        2.0 * ratio(inter, inter + union)
    }

    pub fn iou_class(&self) -> Vec<f64> {
        (0..self.classes())
            .map(|c| ratio(self.intersection[c], self.union[c]))
            .collect()
    }

    pub fn accuracy_class(&self) -> Vec<f64> {
        (0..self.classes())
            .map(|c| ratio(self.intersection[c], self.target[c]))
            .collect()
    }

    pub fn dice_class(&self) -> Vec<f64> {
        (0..self.classes())
            .map(|c| 2.0 * ratio(self.intersection[c], self.intersection[c] + self.union[c]))
            .collect()
    }

    /// Per-class and mean metrics.
    ///
    /// `m_iou` and `m_acc` average over every class, background included, so they match
    /// the usual benchmark reporting. `m_dice` averages classes `1..` only, since the
    /// background Dice dominates on sparse foreground such as medical scans. With a
    /// single class `m_dice` is 0.
    pub fn summary(&self) -> EvalSummary {
        let iou = self.iou_class();
        let accuracy = self.accuracy_class();
        let dice = self.dice_class();
        EvalSummary {
            m_iou: mean(&iou),
            m_acc: mean(&accuracy),
            all_acc: self.accuracy(),
            // background is left out of the Dice mean only
            m_dice: mean(dice.get(1..).unwrap_or(&[])),
            iou,
            accuracy,
            dice,
        }
    }
}

/// Final metrics for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalSummary {
    pub m_iou: f64,
    pub m_acc: f64,
    pub all_acc: f64,
    pub m_dice: f64,
    pub iou: Vec<f64>,
    pub accuracy: Vec<f64>,
    pub dice: Vec<f64>,
}

impl EvalSummary {
    /// Emits the aggregate line and one line per class.
    pub fn log(&self, names: &[String]) {
        tracing::info!(
            "Eval result: mIoU/mAcc/allAcc/mDice {:.4}/{:.4}/{:.4}/{:.4}.",
            self.m_iou,
            self.m_acc,
            self.all_acc,
            self.m_dice
        );
        for (i, ((iou, acc), dice)) in self
            .iou
            .iter()
            .zip(&self.accuracy)
            .zip(&self.dice)
            .enumerate()
        {
            let name = names.get(i).map(String::as_str).unwrap_or("");
            tracing::info!(
                "Class_{} result: iou/accuracy/dice {:.4}/{:.4}/{:.4}, name: {}.",
                i,
                iou,
                acc,
                dice,
                name
            );
        }
    }
}
