//! # Nested Validator
//!
//! Outer stratified k-fold over the training partition. Each outer fold runs
//! the whole screen, select and fit pipeline on its outer-training rows, with
//! the selector's own k-fold CV nested inside, and scores the held-out rows
//! with that fold's model and encoding. The fold's decision threshold is the
//! Youden point of its own training predictions, so the held-out rows inform
//! nothing but their own metrics.
//!
//! Folds share no mutable state: each gets an isolated [`Cohort`] copy and a
//! seed derived from its index, and they run concurrently on the rayon pool.

use crate::config::PipelineConfig;
use crate::data::Cohort;
use crate::error::{ErrorContext, PipelineError, PipelineStage};
use crate::feature_set::{DataOrigin, FeatureSet};
use crate::folds::{split_fold, stratified_folds};
use crate::metrics::{MetricReport, evaluate, youden_threshold};
use crate::model::{FittedModel, ModelType};
use crate::pipeline::fit_pipeline;
use crate::seeding::{SeedStream, derive_seed, rng_for};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NestedConfig {
    pub outer_folds: usize,
    /// Folds of the selector's cross-validation inside each outer fold.
    pub inner_folds: usize,
}

impl Default for NestedConfig {
    fn default() -> Self {
        Self {
            outer_folds: 5,
            inner_folds: 5,
        }
    }
}

/// A successfully evaluated outer fold.
#[derive(Debug)]
pub struct FoldOutcome {
    pub fold: usize,
    /// Subjects used anywhere in this fold's screen, select and fit.
    pub training_subjects: Vec<String>,
    pub held_out_subjects: Vec<String>,
    pub feature_set: FeatureSet,
    pub model: FittedModel,
    pub report: MetricReport,
    /// Non-fatal errors raised while fitting this fold.
    pub recorded: Vec<PipelineError>,
}

/// An outer fold excluded from aggregation.
#[derive(Debug)]
pub struct FoldFailure {
    pub fold: usize,
    pub error: PipelineError,
}

/// Mean and sample standard deviation of one metric across folds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spread {
    pub mean: f64,
    pub sd: f64,
}

impl Spread {
    fn of(values: &[f64]) -> Self {
        let n = values.len();
        if n == 0 {
            return Spread {
                mean: f64::NAN,
                sd: f64::NAN,
            };
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let sd = if n > 1 {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            f64::NAN
        };
        Spread { mean, sd }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NestedSummary {
    pub completed_folds: usize,
    pub failed_folds: usize,
    pub auc: Spread,
    pub sensitivity: Spread,
    pub specificity: Spread,
    pub accuracy: Spread,
    pub mcc: Spread,
}

#[derive(Debug)]
pub struct NestedValidationResult {
    pub model_type: ModelType,
    pub folds: Vec<FoldOutcome>,
    pub failures: Vec<FoldFailure>,
}

impl NestedValidationResult {
    /// Fraction of completed folds selecting each feature, most stable first
    /// (ties by name).
    pub fn selection_frequency(&self) -> Vec<(String, f64)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for fold in &self.folds {
            for name in &fold.feature_set.names {
                *counts.entry(name.as_str()).or_default() += 1;
            }
        }
        let total = self.folds.len().max(1) as f64;
        let mut out: Vec<(String, f64)> = counts
            .into_iter()
            .map(|(name, c)| (name.to_string(), c as f64 / total))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    pub fn summary(&self) -> NestedSummary {
        let collect = |f: fn(&MetricReport) -> f64| -> Vec<f64> {
            self.folds.iter().map(|fold| f(&fold.report)).collect()
        };
        NestedSummary {
            completed_folds: self.folds.len(),
            failed_folds: self.failures.len(),
            auc: Spread::of(&collect(|r| r.auc)),
            sensitivity: Spread::of(&collect(|r| r.sensitivity)),
            specificity: Spread::of(&collect(|r| r.specificity)),
            accuracy: Spread::of(&collect(|r| r.accuracy)),
            mcc: Spread::of(&collect(|r| r.mcc)),
        }
    }
}

/// Runs one outer fold end to end on its own data view.
fn run_fold(
    training: &Cohort,
    assignment: &[usize],
    fold: usize,
    pool: &[String],
    config: &PipelineConfig,
    seed: u64,
) -> Result<FoldOutcome, PipelineError> {
    let (train_idx, test_idx) = split_fold(assignment, fold);
    let inner_training = training.subset(&train_idx);
    let held_out = training.subset(&test_idx);
    let origin = DataOrigin::InnerTraining { fold };
    let fold_seed = derive_seed(seed, SeedStream::NestedFold, fold as u64);

    let fit = fit_pipeline(&inner_training, pool, config, origin, fold_seed)?;

    let context = ErrorContext::new(PipelineStage::MetricEngine, origin.label()).with_fold(Some(fold));
    let train_probs = fit
        .model
        .predict_proba(&inner_training)
        .map_err(|e| PipelineError::from_model(e, context.clone()))?
        .to_vec();
    let threshold = youden_threshold(&train_probs, &inner_training.labels())
        .map_err(|e| PipelineError::from_metric(e, context.clone()))?;

    let context = ErrorContext::new(PipelineStage::MetricEngine, format!("held-out/outer-fold-{fold}"))
        .with_fold(Some(fold));
    let test_probs = fit
        .model
        .predict_proba(&held_out)
        .map_err(|e| PipelineError::from_model(e, context.clone()))?
        .to_vec();
    let report = evaluate(
        &test_probs,
        &held_out.labels(),
        Some(threshold),
        &config.metrics,
        derive_seed(fold_seed, SeedStream::Evaluation, 0),
    )
    .map_err(|e| PipelineError::from_metric(e, context))?;

    Ok(FoldOutcome {
        fold,
        training_subjects: fit.training_subjects,
        held_out_subjects: held_out.subject_ids().to_vec(),
        feature_set: fit.selected,
        model: fit.model,
        report,
        recorded: fit.recorded,
    })
}

/// Estimates generalization of the pipeline for `model_type` by nested
/// cross-validation over `training`.
///
/// A fold that fails is recorded and left out of the summaries; the call only
/// fails if the outer folds cannot be assigned.
pub fn nested_validate(
    training: &Cohort,
    pool: &[String],
    model_type: ModelType,
    config: &PipelineConfig,
    seed: u64,
) -> Result<NestedValidationResult, PipelineError> {
    let mut rng = rng_for(seed, SeedStream::OuterFolds, 0);
    let assignment = stratified_folds(&training.labels(), config.nested.outer_folds, &mut rng)
        .map_err(|e| {
            PipelineError::Configuration(format!(
                "[{}] cannot assign outer folds: {e}",
                PipelineStage::NestedValidator
            ))
        })?;

    let mut inner = config.clone();
    inner.selector.folds = config.nested.inner_folds;

    let results: Vec<Result<FoldOutcome, PipelineError>> = (0..config.nested.outer_folds)
        .into_par_iter()
        .map(|fold| run_fold(training, &assignment, fold, pool, &inner, seed))
        .collect();

    let mut folds = Vec::new();
    let mut failures = Vec::new();
    for (fold, result) in results.into_iter().enumerate() {
        match result {
            Ok(outcome) => folds.push(outcome),
            Err(error) => {
                log::warn!("{model_type}: outer fold {fold} excluded: {error}");
                failures.push(FoldFailure { fold, error });
            }
        }
    }

    if folds.is_empty() {
        log::warn!("{model_type}: every outer fold failed; no nested estimate is available.");
    }

    let result = NestedValidationResult {
        model_type,
        folds,
        failures,
    };
    let summary = result.summary();
    log::info!(
        "{model_type}: nested AUC {:.3} ± {:.3} over {} folds ({} failed).",
        summary.auc.mean,
        summary.auc.sd,
        summary.completed_folds,
        summary.failed_folds
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spread_close(s: Spread, mean: f64, sd: f64) -> bool {
        (s.mean - mean).abs() < 1e-12 && (s.sd - sd).abs() < 1e-12
    }

    #[test]
    fn spread_uses_the_sample_standard_deviation() {
        assert!(spread_close(Spread::of(&[1.0, 2.0, 3.0]), 2.0, 1.0));
        let single = Spread::of(&[0.7]);
        assert_eq!(single.mean, 0.7);
        assert!(single.sd.is_nan());
        assert!(Spread::of(&[]).mean.is_nan());
    }

    #[test]
    fn nested_defaults_are_five_by_five() {
        let c = NestedConfig::default();
        assert_eq!((c.outer_folds, c.inner_folds), (5, 5));
    }
}
