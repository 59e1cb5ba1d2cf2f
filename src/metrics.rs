//! # Metric Engine
//!
//! Discrimination and threshold metrics for predicted malignancy
//! probabilities against observed outcomes:
//!
//! - AUC from the Mann-Whitney statistic with average ranks for ties.
//! - A percentile confidence interval for the AUC from stratified bootstrap
//!   resamples, so every resample keeps the observed class counts.
//! - The Youden-optimal threshold over every distinct predicted probability.
//! - Sensitivity, specificity, accuracy and MCC at a threshold, where a
//!   subject is called malignant when its probability is at or above it.
//!
//! A single-class input has no ROC curve and is rejected with
//! [`MetricError::SingleClass`]; no placeholder AUC is ever produced.

use crate::seeding::{SeedStream, rng_for};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub bootstrap_resamples: usize,
    pub confidence_level: f64,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            bootstrap_resamples: 1000,
            confidence_level: 0.95,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("All {n} subjects are {class}; AUC and the ROC curve are undefined.")]
    SingleClass { n: usize, class: &'static str },
    #[error("{probabilities} probabilities were given for {labels} outcomes.")]
    LengthMismatch { probabilities: usize, labels: usize },
    #[error("No subjects to evaluate.")]
    Empty,
    #[error("Predicted probability {0} is not a finite value in [0, 1].")]
    InvalidProbability(f64),
    #[error("Confidence level must be in (0, 1), got {0}.")]
    InvalidConfidenceLevel(f64),
}

fn check_inputs(probs: &[f64], labels: &[bool]) -> Result<(usize, usize), MetricError> {
    if probs.len() != labels.len() {
        return Err(MetricError::LengthMismatch {
            probabilities: probs.len(),
            labels: labels.len(),
        });
    }
    if probs.is_empty() {
        return Err(MetricError::Empty);
    }
    if let Some(&bad) = probs.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(MetricError::InvalidProbability(bad));
    }
    let positives = labels.iter().filter(|&&l| l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(MetricError::SingleClass {
            n: labels.len(),
            class: if positives == 0 { "benign" } else { "malignant" },
        });
    }
    Ok((positives, negatives))
}

/// Mann-Whitney AUC; tied scores share their average rank.
fn auc_unchecked(scores: &[f64], labels: &[bool], positives: usize, negatives: usize) -> f64 {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks start..end (0-based) average to this 1-based rank.
        let rank = (start + end + 1) as f64 / 2.0;
        let tied_positives = order[start..end].iter().filter(|&&i| labels[i]).count();
        positive_rank_sum += rank * tied_positives as f64;
        start = end;
    }

    let np = positives as f64;
    (positive_rank_sum - np * (np + 1.0) / 2.0) / (np * negatives as f64)
}

/// Area under the ROC curve of `probs` against `labels`.
pub fn roc_auc(probs: &[f64], labels: &[bool]) -> Result<f64, MetricError> {
    let (positives, negatives) = check_inputs(probs, labels)?;
    Ok(auc_unchecked(probs, labels, positives, negatives))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RocPoint {
    pub threshold: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub true_positives: usize,
    pub false_positives: usize,
}

impl RocPoint {
    pub fn youden_index(&self) -> f64 {
        self.sensitivity + self.specificity - 1.0
    }
}

/// One point per distinct predicted probability, highest threshold first.
pub fn roc_curve(probs: &[f64], labels: &[bool]) -> Result<Vec<RocPoint>, MetricError> {
    let (positives, negatives) = check_inputs(probs, labels)?;
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut points = Vec::new();
    let (mut tp, mut fp) = (0usize, 0usize);
    let mut start = 0;
    while start < order.len() {
        let threshold = probs[order[start]];
        let mut end = start;
        while end < order.len() && probs[order[end]] == threshold {
            if labels[order[end]] {
                tp += 1;
            } else {
                fp += 1;
            }
            end += 1;
        }
        points.push(RocPoint {
            threshold,
            sensitivity: tp as f64 / positives as f64,
            specificity: (negatives - fp) as f64 / negatives as f64,
            true_positives: tp,
            false_positives: fp,
        });
        start = end;
    }
    Ok(points)
}

/// The distinct predicted probability that maximizes sensitivity +
/// specificity - 1. Ties go to the larger threshold.
pub fn youden_threshold(probs: &[f64], labels: &[bool]) -> Result<f64, MetricError> {
    let (positives, negatives) = check_inputs(probs, labels)?;
    let curve = roc_curve(probs, labels)?;
    // J scaled by P*N, compared exactly so ties are real ties.
    let scaled = |p: &RocPoint| {
        p.true_positives as i128 * negatives as i128 - p.false_positives as i128 * positives as i128
    };
    let mut best = curve[0];
    for point in &curve[1..] {
        if scaled(point) > scaled(&best) {
            best = *point;
        }
    }
    Ok(best.threshold)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConfusionCounts {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ConfusionCounts {
    pub fn total(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }

    pub fn sensitivity(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.true_negative, self.true_negative + self.false_positive)
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positive + self.true_negative, self.total())
    }

    /// Matthews correlation coefficient; 0 when any margin is empty.
    pub fn mcc(&self) -> f64 {
        let tp = self.true_positive as f64;
        let fp = self.false_positive as f64;
        let tn = self.true_negative as f64;
        let fn_ = self.false_negative as f64;
        let denominator = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
        if denominator == 0.0 {
            0.0
        } else {
            (tp * tn - fp * fn_) / denominator
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { f64::NAN } else { num as f64 / den as f64 }
}

/// Confusion counts with `p >= threshold` called positive.
pub fn confusion_at(probs: &[f64], labels: &[bool], threshold: f64) -> ConfusionCounts {
    let mut counts = ConfusionCounts::default();
    for (&p, &label) in probs.iter().zip(labels) {
        match (p >= threshold, label) {
            (true, true) => counts.true_positive += 1,
            (true, false) => counts.false_positive += 1,
            (false, false) => counts.true_negative += 1,
            (false, true) => counts.false_negative += 1,
        }
    }
    counts
}

/// Linear-interpolation quantile of an ascending slice.
pub fn quantile_linear_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let t = pos - lo as f64;
    (1.0 - t) * sorted[lo] + t * sorted[hi]
}

/// Percentile interval of the AUC over stratified bootstrap resamples.
///
/// Resample `b` draws from its own generator, so the interval does not depend
/// on how resamples are scheduled across threads.
pub fn bootstrap_auc_ci(
    probs: &[f64],
    labels: &[bool],
    config: &MetricConfig,
    seed: u64,
) -> Result<(f64, f64), MetricError> {
    let (positives, negatives) = check_inputs(probs, labels)?;
    let level = config.confidence_level;
    if !(level > 0.0 && level < 1.0) {
        return Err(MetricError::InvalidConfidenceLevel(level));
    }
    let pos: Vec<f64> = probs.iter().zip(labels).filter(|(_, l)| **l).map(|(p, _)| *p).collect();
    let neg: Vec<f64> = probs.iter().zip(labels).filter(|(_, l)| !**l).map(|(p, _)| *p).collect();
    let mut resample_labels = vec![true; positives];
    resample_labels.extend(std::iter::repeat_n(false, negatives));

    let mut aucs: Vec<f64> = (0..config.bootstrap_resamples)
        .into_par_iter()
        .map(|b| {
            let mut rng = rng_for(seed, SeedStream::Bootstrap, b as u64);
            let mut scores = Vec::with_capacity(positives + negatives);
            scores.extend((0..positives).map(|_| pos[rng.gen_range(0..positives)]));
            scores.extend((0..negatives).map(|_| neg[rng.gen_range(0..negatives)]));
            auc_unchecked(&scores, &resample_labels, positives, negatives)
        })
        .collect();
    aucs.sort_by(f64::total_cmp);

    let alpha = 1.0 - level;
    Ok((
        quantile_linear_sorted(&aucs, alpha / 2.0),
        quantile_linear_sorted(&aucs, 1.0 - alpha / 2.0),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    Youden,
    Supplied,
}

/// Discrimination and threshold metrics for one set of predictions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricReport {
    pub n_subjects: usize,
    pub n_positive: usize,
    pub auc: f64,
    pub auc_ci_lower: f64,
    pub auc_ci_upper: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub accuracy: f64,
    pub mcc: f64,
    pub threshold: f64,
    pub threshold_source: ThresholdSource,
}

/// Scores `probs` against `labels`.
///
/// With `threshold = None` the Youden-optimal threshold of these same
/// predictions is used.
pub fn evaluate(
    probs: &[f64],
    labels: &[bool],
    threshold: Option<f64>,
    config: &MetricConfig,
    seed: u64,
) -> Result<MetricReport, MetricError> {
    let (positives, negatives) = check_inputs(probs, labels)?;
    let auc = auc_unchecked(probs, labels, positives, negatives);
    let (auc_ci_lower, auc_ci_upper) = bootstrap_auc_ci(probs, labels, config, seed)?;
    let (threshold, threshold_source) = match threshold {
        Some(t) => (t, ThresholdSource::Supplied),
        None => (youden_threshold(probs, labels)?, ThresholdSource::Youden),
    };
    let counts = confusion_at(probs, labels, threshold);

    Ok(MetricReport {
        n_subjects: probs.len(),
        n_positive: positives,
        auc,
        auc_ci_lower,
        auc_ci_upper,
        sensitivity: counts.sensitivity(),
        specificity: counts.specificity(),
        accuracy: counts.accuracy(),
        mcc: counts.mcc(),
        threshold,
        threshold_source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn auc_counts_ties_as_half() {
        let probs = [0.1, 0.4, 0.4, 0.8];
        let labels = [false, false, true, true];
        // Pairs: (0.4 vs 0.1) win, (0.4 vs 0.4) half, (0.8 vs both) wins.
        assert_abs_diff_eq!(roc_auc(&probs, &labels).unwrap(), 3.5 / 4.0, epsilon = 1e-12);
    }

    #[test]
    fn perfect_and_inverted_rankings() {
        let labels = [false, false, true, true];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels).unwrap(), 1.0);
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels).unwrap(), 0.0);
    }

    #[test]
    fn single_class_input_is_degenerate() {
        let err = evaluate(&[0.2, 0.7, 0.9], &[true, true, true], None, &MetricConfig::default(), 1)
            .unwrap_err();
        assert_eq!(err, MetricError::SingleClass { n: 3, class: "malignant" });
    }

    #[test]
    fn roc_curve_has_one_point_per_distinct_probability() {
        let probs = [0.9, 0.3, 0.3, 0.6, 0.1];
        let labels = [true, false, true, true, false];
        let curve = roc_curve(&probs, &labels).unwrap();
        let thresholds: Vec<f64> = curve.iter().map(|p| p.threshold).collect();
        assert_eq!(thresholds, vec![0.9, 0.6, 0.3, 0.1]);
        let last = curve.last().unwrap();
        assert_eq!((last.sensitivity, last.specificity), (1.0, 0.0));
    }

    #[test]
    fn youden_prefers_the_larger_threshold_on_ties() {
        // Thresholds 0.9 and 0.5 both give J = 1/3.
        let probs = [0.9, 0.7, 0.5, 0.4, 0.2, 0.1];
        let labels = [true, false, true, false, false, true];
        let curve = roc_curve(&probs, &labels).unwrap();
        let best = curve.iter().map(|p| p.youden_index()).fold(f64::MIN, f64::max);
        let t = youden_threshold(&probs, &labels).unwrap();
        let chosen = curve.iter().find(|p| p.threshold == t).unwrap();
        assert_abs_diff_eq!(chosen.youden_index(), best, epsilon = 1e-12);
        assert_eq!(t, 0.9);
    }

    #[test]
    fn confusion_metrics_at_threshold() {
        let probs = [0.9, 0.8, 0.4, 0.3, 0.6, 0.1];
        let labels = [true, true, true, false, false, false];
        let c = confusion_at(&probs, &labels, 0.5);
        assert_eq!(
            c,
            ConfusionCounts {
                true_positive: 2,
                false_positive: 1,
                true_negative: 2,
                false_negative: 1
            }
        );
        assert_abs_diff_eq!(c.sensitivity(), 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.specificity(), 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.accuracy(), 4.0 / 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.mcc(), 1.0 / 3.0, epsilon = 1e-12);
        // A probability equal to the threshold is a positive call.
        assert_eq!(confusion_at(&[0.5], &[true], 0.5).true_positive, 1);
    }

    #[test]
    fn mcc_is_zero_when_a_margin_is_empty() {
        let c = confusion_at(&[0.9, 0.8], &[true, false], 0.1);
        assert_eq!(c.mcc(), 0.0);
    }

    #[test]
    fn bootstrap_interval_is_reproducible_and_ordered() {
        let probs: Vec<f64> = (0..60).map(|i| (i as f64 * 0.37).sin().abs()).collect();
        let labels: Vec<bool> = (0..60).map(|i| (i as f64 * 0.37).sin().abs() + (i % 3) as f64 * 0.2 > 0.6).collect();
        let config = MetricConfig {
            bootstrap_resamples: 300,
            ..MetricConfig::default()
        };
        let a = bootstrap_auc_ci(&probs, &labels, &config, 9).unwrap();
        let b = bootstrap_auc_ci(&probs, &labels, &config, 9).unwrap();
        assert_eq!(a, b);
        assert!(a.0 <= a.1);
        let auc = roc_auc(&probs, &labels).unwrap();
        assert!(a.0 <= auc && auc <= a.1);
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let s = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(quantile_linear_sorted(&s, 0.0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile_linear_sorted(&s, 0.625), 3.5, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile_linear_sorted(&s, 1.0), 5.0, epsilon = 1e-12);
    }
}
