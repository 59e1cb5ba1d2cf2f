//! # Stage-attributed pipeline errors
//!
//! Every module reports failures with its own `thiserror` enum. When a failure
//! crosses a stage boundary it is mapped onto one of five categories and
//! tagged with the stage, partition and fold it happened in, so a failure
//! report can say exactly where a run went wrong.

use crate::collinearity::FilterError;
use crate::config::ConfigError;
use crate::data::DataError;
use crate::encoding::EncodingError;
use crate::fitter::FitError;
use crate::lasso::{LassoError, PathFailure};
use crate::metrics::MetricError;
use crate::model::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The pipeline stage an error is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Partitioner,
    CollinearityFilter,
    RegularizedSelector,
    ModelFitter,
    NestedValidator,
    MetricEngine,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Partitioner => "partitioner",
            PipelineStage::CollinearityFilter => "collinearity filter",
            PipelineStage::RegularizedSelector => "regularized selector",
            PipelineStage::ModelFitter => "model fitter",
            PipelineStage::NestedValidator => "nested validator",
            PipelineStage::MetricEngine => "metric engine",
        };
        f.write_str(name)
    }
}

/// Where an error happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorContext {
    pub stage: PipelineStage,
    /// Partition label, e.g. `training`, `testing`, or `training/outer-fold-2`.
    pub partition: String,
    pub fold: Option<usize>,
}

impl ErrorContext {
    pub fn new(stage: PipelineStage, partition: impl Into<String>) -> Self {
        Self {
            stage,
            partition: partition.into(),
            fold: None,
        }
    }

    pub fn with_fold(mut self, fold: Option<usize>) -> Self {
        self.fold = fold;
        self
    }

    pub fn at_stage(&self, stage: PipelineStage) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fold {
            Some(fold) => write!(f, "{} | {} | fold {}", self.stage, self.partition, fold),
            None => write!(f, "{} | {}", self.stage, self.partition),
        }
    }
}

/// The crate-level error type.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("[{context}] numerical error: {message}")]
    Numerical {
        context: ErrorContext,
        message: String,
    },

    #[error(
        "[{context}] solver did not converge at penalty strength {lambda:.4e} within {iterations} iterations"
    )]
    Convergence {
        context: ErrorContext,
        lambda: f64,
        iterations: usize,
    },

    #[error(
        "[{context}] perfect separation: the coefficient for '{term}' diverges. The model cannot be reported."
    )]
    Separation { context: ErrorContext, term: String },

    #[error("[{context}] degenerate input: {message}")]
    DegenerateInput {
        context: ErrorContext,
        message: String,
    },

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Model artifact error: {0}")]
    Model(#[from] ModelError),

    #[error("Failed to write output: {0}")]
    Output(String),
}

impl PipelineError {
    /// The error category name used in failure tables.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "ConfigurationError",
            PipelineError::Numerical { .. } => "NumericalError",
            PipelineError::Convergence { .. } => "ConvergenceError",
            PipelineError::Separation { .. } => "SeparationError",
            PipelineError::DegenerateInput { .. } => "DegenerateInputError",
            PipelineError::Data(_) => "DataError",
            PipelineError::Model(_) => "ModelError",
            PipelineError::Output(_) => "OutputError",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            PipelineError::Numerical { context, .. }
            | PipelineError::Convergence { context, .. }
            | PipelineError::Separation { context, .. }
            | PipelineError::DegenerateInput { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Maps a Collinearity Filter failure onto the taxonomy.
    pub fn from_filter(err: FilterError, context: ErrorContext) -> Self {
        match err {
            FilterError::UnknownFeature(name) => PipelineError::Configuration(format!(
                "[{context}] feature '{name}' is not part of the cohort schema"
            )),
        }
    }

    pub fn from_encoding(err: EncodingError, context: ErrorContext) -> Self {
        PipelineError::Configuration(format!("[{context}] {err}"))
    }

    /// Maps a Regularized Selector failure onto the taxonomy.
    pub fn from_lasso(err: LassoError, context: ErrorContext) -> Self {
        match err {
            LassoError::DidNotConverge { lambda, iterations } => PipelineError::Convergence {
                context,
                lambda,
                iterations,
            },
            LassoError::Folds(e) => PipelineError::DegenerateInput {
                context,
                message: format!("cannot assign selector folds: {e}"),
            },
            other => PipelineError::Numerical {
                context,
                message: other.to_string(),
            },
        }
    }

    /// A solver failure recorded on the regularization path.
    pub fn from_path_failure(failure: &PathFailure, context: &ErrorContext) -> Self {
        let partition = match failure.fold {
            Some(fold) => format!("{}/selector-fold-{fold}", context.partition),
            None => format!("{}/selector-full", context.partition),
        };
        let context = ErrorContext {
            partition,
            ..context.clone()
        };
        Self::from_lasso(failure.error.clone(), context)
    }

    /// Maps a Model Fitter failure onto the taxonomy.
    pub fn from_fit(err: FitError, context: ErrorContext) -> Self {
        match err {
            FitError::Separation { term, .. } => PipelineError::Separation { context, term },
            FitError::DidNotConverge { iterations } => PipelineError::Convergence {
                context,
                lambda: 0.0,
                iterations,
            },
            FitError::SingleClass { .. } => PipelineError::DegenerateInput {
                context,
                message: err.to_string(),
            },
            FitError::Encoding(e) => Self::from_encoding(e, context),
            other => PipelineError::Numerical {
                context,
                message: other.to_string(),
            },
        }
    }

    /// Maps a Metric Engine failure onto the taxonomy.
    pub fn from_metric(err: MetricError, context: ErrorContext) -> Self {
        match err {
            MetricError::SingleClass { .. } | MetricError::Empty => PipelineError::DegenerateInput {
                context,
                message: err.to_string(),
            },
            other => PipelineError::Numerical {
                context,
                message: other.to_string(),
            },
        }
    }

    pub fn from_model(err: ModelError, context: ErrorContext) -> Self {
        match err {
            ModelError::Encoding(e) => Self::from_encoding(e, context),
            other => PipelineError::Model(other),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_renders_stage_partition_and_fold() {
        let ctx = ErrorContext::new(PipelineStage::ModelFitter, "training/outer-fold-3")
            .with_fold(Some(3));
        let err = PipelineError::Separation {
            context: ctx,
            term: "spiculation[marked]".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("model fitter"));
        assert!(text.contains("training/outer-fold-3"));
        assert!(text.contains("fold 3"));
        assert!(text.contains("spiculation[marked]"));
        assert_eq!(err.category(), "SeparationError");
    }

    #[test]
    fn path_failures_name_the_selector_fold() {
        let ctx = ErrorContext::new(PipelineStage::RegularizedSelector, "training/outer-fold-1")
            .with_fold(Some(1));
        let failure = PathFailure {
            fold: Some(4),
            error: LassoError::DidNotConverge {
                lambda: 0.05,
                iterations: 100,
            },
        };
        let err = PipelineError::from_path_failure(&failure, &ctx);
        assert_eq!(err.category(), "ConvergenceError");
        let context = err.context().unwrap();
        assert_eq!(context.partition, "training/outer-fold-1/selector-fold-4");
        assert_eq!(context.fold, Some(1));
    }

    #[test]
    fn single_class_metrics_are_degenerate_input() {
        let ctx = ErrorContext::new(PipelineStage::MetricEngine, "testing");
        let err = PipelineError::from_metric(
            MetricError::SingleClass {
                n: 10,
                class: "malignant",
            },
            ctx,
        );
        assert_eq!(err.category(), "DegenerateInputError");
    }

    #[test]
    fn at_stage_keeps_partition_and_fold() {
        let ctx = ErrorContext::new(PipelineStage::CollinearityFilter, "training")
            .with_fold(Some(1))
            .at_stage(PipelineStage::MetricEngine);
        assert_eq!(ctx.stage, PipelineStage::MetricEngine);
        assert_eq!(ctx.partition, "training");
        assert_eq!(ctx.fold, Some(1));
    }
}
