use crate::data::Cohort;
use crate::encoding::{Encoding, EncodingError};
use crate::feature_set::FeatureSet;
use crate::lasso::sigmoid;
use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Two-sided 95% standard-normal quantile.
const WALD_Z_95: f64 = 1.959_963_984_540_054;

/// The three feature pools a study fits a model for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    ClinicoRadiological,
    ScanParameters,
    Hybrid,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [
        ModelType::ClinicoRadiological,
        ModelType::ScanParameters,
        ModelType::Hybrid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::ClinicoRadiological => "clinico_radiological",
            ModelType::ScanParameters => "scan_parameters",
            ModelType::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The data cannot be encoded with the model's encoding: {0}")]
    Encoding(#[from] EncodingError),
    #[error("The model has {expected} coefficients but the design has {found} columns.")]
    MismatchedColumns { found: usize, expected: usize },
}

/// One encoded term of a fitted logistic model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub name: String,
    pub feature: String,
    pub coefficient: f64,
    /// Wald standard error from the inverse observed information.
    pub std_error: f64,
}

impl Term {
    pub fn odds_ratio(&self) -> f64 {
        self.coefficient.exp()
    }

    /// 95% Wald interval for the odds ratio.
    pub fn odds_ratio_interval(&self) -> (f64, f64) {
        let half = WALD_Z_95 * self.std_error;
        ((self.coefficient - half).exp(), (self.coefficient + half).exp())
    }

    pub fn z_value(&self) -> f64 {
        self.coefficient / self.std_error
    }
}

/// An unpenalized logistic model bound to the feature set and encoding it
/// was fitted with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub feature_set: FeatureSet,
    pub intercept: f64,
    pub intercept_std_error: f64,
    pub deviance: f64,
    pub null_deviance: f64,
    pub iterations: usize,
    pub n_subjects: usize,
    pub encoding: Encoding,
    pub terms: Vec<Term>,
}

impl FittedModel {
    pub fn coefficients(&self) -> Array1<f64> {
        self.terms.iter().map(|t| t.coefficient).collect()
    }

    /// Term name to coefficient; the intercept is under `(intercept)`.
    pub fn coefficient_map(&self) -> BTreeMap<String, f64> {
        let mut map: BTreeMap<String, f64> = self
            .terms
            .iter()
            .map(|t| (t.name.clone(), t.coefficient))
            .collect();
        map.insert("(intercept)".to_string(), self.intercept);
        map
    }

    /// Linear predictor for an already-encoded design.
    pub fn linear_predictor_design(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if x.ncols() != self.terms.len() {
            return Err(ModelError::MismatchedColumns {
                found: x.ncols(),
                expected: self.terms.len(),
            });
        }
        Ok(x.dot(&self.coefficients()) + self.intercept)
    }

    pub fn linear_predictor(&self, cohort: &Cohort) -> Result<Array1<f64>, ModelError> {
        let x = self.encoding.design(cohort)?;
        self.linear_predictor_design(x.view())
    }

    /// Malignancy probabilities for every subject of `cohort`.
    pub fn predict_proba(&self, cohort: &Cohort) -> Result<Array1<f64>, ModelError> {
        Ok(self.linear_predictor(cohort)?.mapv(sigmoid))
    }
}

/// A fitted model together with the decision threshold chosen for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_type: ModelType,
    pub decision_threshold: f64,
    pub model: FittedModel,
}

impl ModelArtifact {
    /// Probabilities and thresholded calls for every subject of `cohort`.
    pub fn predict(&self, cohort: &Cohort) -> Result<(Array1<f64>, Vec<bool>), ModelError> {
        let probs = self.model.predict_proba(cohort)?;
        let calls = probs.iter().map(|&p| p >= self.decision_threshold).collect();
        Ok((probs, calls))
    }

    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let artifact = toml::from_str(&toml_string)?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FeatureSchema, FeatureSpec};
    use crate::feature_set::{DataOrigin, SelectionStage};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn schema() -> Arc<FeatureSchema> {
        Arc::new(
            FeatureSchema::new(vec![
                FeatureSpec::continuous("diameter"),
                FeatureSpec::categorical("margin", &[0, 1], &["smooth", "spiculated"]),
            ])
            .unwrap(),
        )
    }

    fn model() -> FittedModel {
        let names = vec!["diameter".to_string(), "margin".to_string()];
        let encoding = Encoding::for_features(&schema(), &names).unwrap();
        FittedModel {
            feature_set: FeatureSet::new(names, SelectionStage::PostLasso, DataOrigin::Training),
            intercept: -3.0,
            intercept_std_error: 0.8,
            deviance: 40.0,
            null_deviance: 80.0,
            iterations: 6,
            n_subjects: 70,
            encoding,
            terms: vec![
                Term {
                    name: "diameter".into(),
                    feature: "diameter".into(),
                    coefficient: 0.2,
                    std_error: 0.05,
                },
                Term {
                    name: "margin[spiculated]".into(),
                    feature: "margin".into(),
                    coefficient: 1.5,
                    std_error: 0.5,
                },
            ],
        }
    }

    #[test]
    fn predicts_with_its_own_encoding() {
        let cohort = Cohort::new(
            schema(),
            vec!["s1".into(), "s2".into()],
            array![[10.0, 0.0], [15.0, 1.0]],
            array![0.0, 1.0],
        )
        .unwrap();
        let eta = model().linear_predictor(&cohort).unwrap();
        assert_abs_diff_eq!(eta[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eta[1], 1.5, epsilon = 1e-12);
    }

    #[test]
    fn odds_ratio_interval_brackets_the_estimate() {
        let term = &model().terms[1];
        let (lo, hi) = term.odds_ratio_interval();
        assert!(lo < term.odds_ratio() && term.odds_ratio() < hi);
        assert_abs_diff_eq!(lo, (1.5 - WALD_Z_95 * 0.5_f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn artifact_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let path = path.to_str().unwrap();
        let artifact = ModelArtifact {
            model_type: ModelType::Hybrid,
            decision_threshold: 0.37,
            model: model(),
        };
        artifact.save(path).unwrap();
        let loaded = ModelArtifact::load(path).unwrap();
        assert_eq!(loaded, artifact);
        assert_eq!(loaded.model.coefficient_map()["(intercept)"], -3.0);
    }
}
