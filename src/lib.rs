pub mod collinearity;
pub mod config;
pub mod data;
pub mod encoding;
pub mod error;
pub mod export;
pub mod faer_ndarray;
pub mod feature_set;
pub mod fitter;
pub mod folds;
pub mod lasso;
pub mod metrics;
pub mod model;
pub mod nested;
pub mod partition;
pub mod pipeline;
pub mod seeding;

pub use config::PipelineConfig;
pub use data::{Cohort, load_cohort};
pub use error::{ErrorContext, PipelineError, PipelineStage};
pub use model::{FittedModel, ModelArtifact, ModelType};
pub use pipeline::{StudyReport, fit_pipeline, run_study};
