//! # Study orchestration
//!
//! [`fit_pipeline`] is the unit of work: screen, select and fit on one
//! training table. It reads nothing but its arguments, so the top-level fit
//! and every outer fold of nested validation call the same function on their
//! own isolated cohort view with their own derived seed.
//!
//! [`run_study`] partitions the cohort once and, for each model type with a
//! non-empty pool, runs the top-level pipeline on the training partition,
//! nested validation on the training partition, and finally scores all three
//! partitions with the top-level model. Failures inside the top-level pipeline
//! are fatal; failures local to one penalty strength or one outer fold are
//! recorded and excluded.

use crate::collinearity::{FilterOutcome, filter_collinear};
use crate::config::PipelineConfig;
use crate::data::Cohort;
use crate::encoding::Encoding;
use crate::error::{ErrorContext, PipelineError, PipelineStage};
use crate::feature_set::{DataOrigin, FeatureSet, SelectionStage};
use crate::fitter::fit_model;
use crate::lasso::{Selection, select_features};
use crate::metrics::{MetricReport, evaluate, youden_threshold};
use crate::model::{FittedModel, ModelArtifact, ModelType};
use crate::nested::{NestedValidationResult, nested_validate};
use crate::partition::{PartitionName, Partitions, partition_cohort};
use crate::seeding::{SeedStream, derive_seed};

/// Everything one run of screen, select and fit produced.
#[derive(Debug)]
pub struct PipelineFit {
    pub origin: DataOrigin,
    /// Subjects whose rows were read by any step of this fit.
    pub training_subjects: Vec<String>,
    pub post_correlation: FeatureSet,
    pub post_vif: FeatureSet,
    pub selected: FeatureSet,
    pub filter: FilterOutcome,
    pub selection: Selection,
    pub model: FittedModel,
    /// Non-fatal errors: singular VIF drops and failed penalty strengths.
    pub recorded: Vec<PipelineError>,
}

/// Runs Collinearity Filter, Regularized Selector and Model Fitter on
/// `training`, drawing candidate features from `pool`.
pub fn fit_pipeline(
    training: &Cohort,
    pool: &[String],
    config: &PipelineConfig,
    origin: DataOrigin,
    seed: u64,
) -> Result<PipelineFit, PipelineError> {
    let context = ErrorContext::new(PipelineStage::CollinearityFilter, origin.label())
        .with_fold(origin.fold());
    let mut recorded = Vec::new();

    let filter = filter_collinear(training, pool, &config.collinearity)
        .map_err(|e| PipelineError::from_filter(e, context.clone()))?;
    for drop in filter.singular_drops() {
        recorded.push(PipelineError::Numerical {
            context: context.clone(),
            message: format!(
                "correlation matrix is singular; '{}' dropped without a VIF value",
                drop.name
            ),
        });
    }
    let post_correlation = FeatureSet::new(
        filter.after_correlation.clone(),
        SelectionStage::PostCorrelation,
        origin,
    );
    let post_vif = FeatureSet::new(filter.after_vif.clone(), SelectionStage::PostVif, origin);

    let context = context.at_stage(PipelineStage::RegularizedSelector);
    let encoding = Encoding::for_features(training.schema(), &post_vif.names)
        .map_err(|e| PipelineError::from_encoding(e, context.clone()))?;
    let x = encoding
        .design(training)
        .map_err(|e| PipelineError::from_encoding(e, context.clone()))?;
    let selection = select_features(x.view(), training.outcome(), &encoding, &config.selector, seed)
        .map_err(|e| PipelineError::from_lasso(e, context.clone()))?;
    for (_, failure) in selection.path.failures() {
        recorded.push(PipelineError::from_path_failure(failure, &context));
    }
    if selection.selected_features.is_empty() {
        log::warn!("[{context}] no feature has a non-zero coefficient; fitting an intercept-only model.");
    }
    let selected = FeatureSet::new(
        selection.selected_features.clone(),
        SelectionStage::PostLasso,
        origin,
    );

    let context = context.at_stage(PipelineStage::ModelFitter);
    let model = fit_model(training, &selected, &config.fitter)
        .map_err(|e| PipelineError::from_fit(e, context.clone()))?;

    Ok(PipelineFit {
        origin,
        training_subjects: training.subject_ids().to_vec(),
        post_correlation,
        post_vif,
        selected,
        filter,
        selection,
        model,
        recorded,
    })
}

/// The outcome of one model type.
#[derive(Debug)]
pub struct ModelReport {
    pub model_type: ModelType,
    pub pool: Vec<String>,
    pub fit: PipelineFit,
    /// Youden threshold of the training predictions.
    pub decision_threshold: f64,
    pub partition_reports: Vec<(PartitionName, MetricReport)>,
    pub nested: NestedValidationResult,
}

impl ModelReport {
    pub fn artifact(&self) -> ModelArtifact {
        ModelArtifact {
            model_type: self.model_type,
            decision_threshold: self.decision_threshold,
            model: self.fit.model.clone(),
        }
    }

    /// Every non-fatal error recorded for this model type.
    pub fn recorded(&self) -> impl Iterator<Item = &PipelineError> {
        self.fit
            .recorded
            .iter()
            .chain(self.nested.folds.iter().flat_map(|f| f.recorded.iter()))
            .chain(self.nested.failures.iter().map(|f| &f.error))
    }
}

#[derive(Debug)]
pub struct StudyReport {
    pub subject_ids: Vec<String>,
    pub partitions: Partitions,
    pub models: Vec<ModelReport>,
}

/// Partitions `cohort` and runs every model type with a non-empty pool.
pub fn run_study(cohort: &Cohort, config: &PipelineConfig) -> Result<StudyReport, PipelineError> {
    config.validate()?;
    let partitions = partition_cohort(&cohort.labels(), &config.split, config.seed).map_err(|e| {
        PipelineError::Configuration(format!("[{}] {e}", PipelineStage::Partitioner))
    })?;
    let training = cohort.subset(&partitions.training);

    let mut models = Vec::new();
    for model_type in config.model_types() {
        let pool = config.pools.pool(model_type);
        let model_seed = derive_seed(config.seed, SeedStream::ModelType, model_type as u64);
        log::info!("--- {model_type}: {} candidate features ---", pool.len());

        let fit = fit_pipeline(&training, &pool, config, DataOrigin::Training, model_seed)?;
        let nested = nested_validate(&training, &pool, model_type, config, model_seed)?;

        let context = ErrorContext::new(PipelineStage::MetricEngine, PartitionName::Training.as_str());
        let training_probs = fit
            .model
            .predict_proba(&training)
            .map_err(|e| PipelineError::from_model(e, context.clone()))?
            .to_vec();
        let decision_threshold = youden_threshold(&training_probs, &training.labels())
            .map_err(|e| PipelineError::from_metric(e, context))?;

        let mut partition_reports = Vec::with_capacity(3);
        for (index, name) in PartitionName::ALL.into_iter().enumerate() {
            let context = ErrorContext::new(PipelineStage::MetricEngine, name.as_str());
            let part = cohort.subset(partitions.get(name));
            let probs = fit
                .model
                .predict_proba(&part)
                .map_err(|e| PipelineError::from_model(e, context.clone()))?
                .to_vec();
            let threshold = match name {
                PartitionName::Training => None,
                _ => Some(decision_threshold),
            };
            let report = evaluate(
                &probs,
                &part.labels(),
                threshold,
                &config.metrics,
                derive_seed(model_seed, SeedStream::Evaluation, index as u64),
            )
            .map_err(|e| PipelineError::from_metric(e, context))?;
            log::info!(
                "{model_type} | {name}: AUC {:.3} [{:.3}, {:.3}], sensitivity {:.3}, specificity {:.3}, MCC {:.3}",
                report.auc,
                report.auc_ci_lower,
                report.auc_ci_upper,
                report.sensitivity,
                report.specificity,
                report.mcc
            );
            partition_reports.push((name, report));
        }

        models.push(ModelReport {
            model_type,
            pool,
            fit,
            decision_threshold,
            partition_reports,
            nested,
        });
    }

    Ok(StudyReport {
        subject_ids: cohort.subject_ids().to_vec(),
        partitions,
        models,
    })
}
