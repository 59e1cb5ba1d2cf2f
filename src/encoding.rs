//! Design-matrix encoding with fixed reference-category dummy coding.
//!
//! An [`Encoding`] is derived from the schema and a list of feature names and
//! is stored with every fitted model, so any later partition is encoded with
//! exactly the columns the model was fitted on.

use crate::data::{Cohort, FeatureKind, FeatureSchema};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnSource {
    Continuous,
    /// Indicator of `level`; the reference level has no column.
    Dummy { level: i64, label: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedColumn {
    /// Term name, e.g. `diameter` or `margin[spiculated]`.
    pub term: String,
    /// Feature the column is derived from.
    pub feature: String,
    #[serde(flatten)]
    pub source: ColumnSource,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Encoding {
    pub columns: Vec<EncodedColumn>,
    /// Reference level of each categorical feature, by feature name.
    #[serde(default)]
    pub reference_levels: Vec<(String, i64)>,
}

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Feature '{0}' is not part of the cohort schema.")]
    UnknownFeature(String),
    #[error("Feature '{feature}' is continuous in the cohort but was encoded as categorical.")]
    KindMismatch { feature: String },
}

impl Encoding {
    /// Columns for `features`, in the order given.
    pub fn for_features(schema: &FeatureSchema, features: &[String]) -> Result<Self, EncodingError> {
        let mut columns = Vec::new();
        let mut reference_levels = Vec::new();
        for name in features {
            let spec = schema
                .get(name)
                .ok_or_else(|| EncodingError::UnknownFeature(name.clone()))?;
            match &spec.kind {
                FeatureKind::Continuous => columns.push(EncodedColumn {
                    term: name.clone(),
                    feature: name.clone(),
                    source: ColumnSource::Continuous,
                }),
                FeatureKind::Categorical { levels, .. } => {
                    reference_levels.push((name.clone(), levels[0]));
                    for &level in &levels[1..] {
                        let label = spec.level_label(level);
                        columns.push(EncodedColumn {
                            term: format!("{name}[{label}]"),
                            feature: name.clone(),
                            source: ColumnSource::Dummy { level, label },
                        });
                    }
                }
            }
        }
        Ok(Self {
            columns,
            reference_levels,
        })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn terms(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.term.clone()).collect()
    }

    /// Source feature of every column, in column order.
    pub fn column_features(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.feature.as_str()).collect()
    }

    /// The encoded design matrix of `cohort`, without an intercept column.
    pub fn design(&self, cohort: &Cohort) -> Result<Array2<f64>, EncodingError> {
        let schema = cohort.schema();
        let mut x = Array2::zeros((cohort.len(), self.columns.len()));
        for (j, column) in self.columns.iter().enumerate() {
            let spec = schema
                .get(&column.feature)
                .ok_or_else(|| EncodingError::UnknownFeature(column.feature.clone()))?;
            let values = cohort
                .column(&column.feature)
                .ok_or_else(|| EncodingError::UnknownFeature(column.feature.clone()))?;
            match &column.source {
                ColumnSource::Continuous => x.column_mut(j).assign(&values),
                ColumnSource::Dummy { level, .. } => {
                    if spec.is_continuous() {
                        return Err(EncodingError::KindMismatch {
                            feature: column.feature.clone(),
                        });
                    }
                    let target = *level as f64;
                    x.column_mut(j)
                        .zip_mut_with(&values, |out, &v| *out = if v == target { 1.0 } else { 0.0 });
                }
            }
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FeatureSpec;
    use ndarray::{Array1, array};
    use std::sync::Arc;

    fn cohort() -> Cohort {
        let schema = FeatureSchema::new(vec![
            FeatureSpec::continuous("diameter"),
            FeatureSpec::categorical("margin", &[0, 1, 2], &["smooth", "lobulated", "spiculated"]),
        ])
        .unwrap();
        Cohort::new(
            Arc::new(schema),
            vec!["a".into(), "b".into(), "c".into()],
            array![[10.0, 0.0], [12.0, 2.0], [7.5, 1.0]],
            Array1::from_vec(vec![0.0, 1.0, 0.0]),
        )
        .unwrap()
    }

    #[test]
    fn categorical_features_expand_against_the_first_level() {
        let c = cohort();
        let enc =
            Encoding::for_features(c.schema(), &["margin".to_string(), "diameter".to_string()])
                .unwrap();
        assert_eq!(
            enc.terms(),
            vec!["margin[lobulated]", "margin[spiculated]", "diameter"]
        );
        assert_eq!(enc.reference_levels, vec![("margin".to_string(), 0)]);
        let x = enc.design(&c).unwrap();
        assert_eq!(x, array![[0.0, 0.0, 10.0], [0.0, 1.0, 12.0], [1.0, 0.0, 7.5]]);
    }

    #[test]
    fn unknown_feature_is_reported() {
        let c = cohort();
        let err = Encoding::for_features(c.schema(), &["volume".to_string()]).unwrap_err();
        assert!(matches!(err, EncodingError::UnknownFeature(name) if name == "volume"));
    }

    #[test]
    fn encoding_survives_a_toml_round_trip() {
        let c = cohort();
        let enc = Encoding::for_features(c.schema(), &["diameter".to_string(), "margin".to_string()])
            .unwrap();
        let text = toml::to_string_pretty(&enc).unwrap();
        let back: Encoding = toml::from_str(&text).unwrap();
        assert_eq!(back, enc);
    }
}
