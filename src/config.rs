//! Run configuration, read from a TOML file.
//!
//! Every stage has its own table with defaults, so a minimal file only names
//! the input columns, the features and the pools:
//!
//! ```toml
//! seed = 20240501
//! subject_id_column = "patient_id"
//! outcome_column = "malignant"
//! missing_sentinel = -999.0
//!
//! [[features]]
//! name = "diameter_mm"
//! kind = "continuous"
//!
//! [[features]]
//! name = "margin"
//! kind = "categorical"
//! levels = [0, 1, 2]
//! labels = ["smooth", "lobulated", "spiculated"]
//!
//! [pools]
//! clinico_radiological = ["diameter_mm", "margin"]
//! scan_parameters = ["slice_thickness"]
//! ```

use crate::collinearity::CollinearityConfig;
use crate::data::{DataError, FeatureSchema, FeatureSpec, TableLayout};
use crate::fitter::FitterConfig;
use crate::lasso::LassoConfig;
use crate::metrics::MetricConfig;
use crate::model::ModelType;
use crate::nested::NestedConfig;
use crate::partition::{PartitionError, SplitRatios};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid feature schema: {0}")]
    Schema(#[from] DataError),
    #[error("{0}")]
    Split(#[from] PartitionError),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Pool '{pool}' names feature '{feature}', which is not declared under [[features]].")]
    UnknownPoolFeature { pool: ModelType, feature: String },
    #[error("Pool '{pool}' lists feature '{feature}' more than once.")]
    DuplicatePoolFeature { pool: ModelType, feature: String },
    #[error("Every feature pool is empty; there is nothing to model.")]
    NoPools,
}

/// Candidate features per model type. An omitted hybrid pool is the union
/// of the other two.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPools {
    pub clinico_radiological: Vec<String>,
    pub scan_parameters: Vec<String>,
    pub hybrid: Option<Vec<String>>,
}

impl ModelPools {
    pub fn pool(&self, model_type: ModelType) -> Vec<String> {
        match model_type {
            ModelType::ClinicoRadiological => self.clinico_radiological.clone(),
            ModelType::ScanParameters => self.scan_parameters.clone(),
            ModelType::Hybrid => match &self.hybrid {
                Some(pool) => pool.clone(),
                None => self
                    .clinico_radiological
                    .iter()
                    .chain(&self.scan_parameters)
                    .unique()
                    .cloned()
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Controls partitioning, every fold assignment and every bootstrap.
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub subject_id_column: String,
    pub outcome_column: String,
    #[serde(default)]
    pub missing_sentinel: Option<f64>,
    #[serde(default)]
    pub split: SplitRatios,
    #[serde(default)]
    pub collinearity: CollinearityConfig,
    #[serde(default)]
    pub selector: LassoConfig,
    #[serde(default)]
    pub fitter: FitterConfig,
    #[serde(default)]
    pub nested: NestedConfig,
    #[serde(default)]
    pub metrics: MetricConfig,
    pub features: Vec<FeatureSpec>,
    #[serde(default)]
    pub pools: ModelPools,
}

fn default_seed() -> u64 {
    42
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

impl PipelineConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn schema(&self) -> Result<FeatureSchema, ConfigError> {
        Ok(FeatureSchema::new(self.features.clone())?)
    }

    pub fn table_layout(&self) -> Result<TableLayout<'_>, ConfigError> {
        Ok(TableLayout {
            subject_id_column: &self.subject_id_column,
            outcome_column: &self.outcome_column,
            missing_sentinel: self.missing_sentinel,
            schema: Arc::new(self.schema()?),
        })
    }

    /// Model types whose pool has at least one feature.
    pub fn model_types(&self) -> Vec<ModelType> {
        ModelType::ALL
            .into_iter()
            .filter(|&t| !self.pools.pool(t).is_empty())
            .collect()
    }

    /// Checks every setting before any data is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.split.validate()?;
        let schema = self.schema()?;

        let c = &self.collinearity;
        if !(c.correlation_threshold > 0.0 && c.correlation_threshold <= 1.0) {
            return Err(invalid(
                "collinearity.correlation_threshold",
                format!("must be in (0, 1], got {}", c.correlation_threshold),
            ));
        }
        if !(c.vif_threshold >= 1.0) {
            return Err(invalid(
                "collinearity.vif_threshold",
                format!("must be at least 1, got {}", c.vif_threshold),
            ));
        }

        let s = &self.selector;
        if s.folds < 2 {
            return Err(invalid("selector.folds", format!("must be at least 2, got {}", s.folds)));
        }
        if s.n_lambdas == 0 {
            return Err(invalid("selector.n_lambdas", "must be at least 1"));
        }
        if !(s.lambda_min_ratio > 0.0 && s.lambda_min_ratio < 1.0) {
            return Err(invalid(
                "selector.lambda_min_ratio",
                format!("must be in (0, 1), got {}", s.lambda_min_ratio),
            ));
        }
        if s.max_iterations == 0 || s.max_passes == 0 || !(s.tolerance > 0.0) {
            return Err(invalid(
                "selector",
                "max_iterations, max_passes and tolerance must be positive",
            ));
        }
        if self.fitter.max_iterations == 0 || !(self.fitter.tolerance > 0.0) {
            return Err(invalid("fitter", "max_iterations and tolerance must be positive"));
        }
        if self.nested.outer_folds < 2 || self.nested.inner_folds < 2 {
            return Err(invalid("nested", "outer_folds and inner_folds must be at least 2"));
        }
        if self.metrics.bootstrap_resamples == 0 {
            return Err(invalid("metrics.bootstrap_resamples", "must be at least 1"));
        }
        let level = self.metrics.confidence_level;
        if !(level > 0.0 && level < 1.0) {
            return Err(invalid(
                "metrics.confidence_level",
                format!("must be in (0, 1), got {level}"),
            ));
        }

        for model_type in ModelType::ALL {
            let pool = self.pools.pool(model_type);
            let mut seen = HashSet::new();
            for feature in &pool {
                if schema.get(feature).is_none() {
                    return Err(ConfigError::UnknownPoolFeature {
                        pool: model_type,
                        feature: feature.clone(),
                    });
                }
                if !seen.insert(feature.as_str()) {
                    return Err(ConfigError::DuplicatePoolFeature {
                        pool: model_type,
                        feature: feature.clone(),
                    });
                }
            }
        }
        if self.model_types().is_empty() {
            return Err(ConfigError::NoPools);
        }
        Ok(())
    }
}
