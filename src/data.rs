//! # Cohort Loading and Validation Module
//!
//! This module is the entry point for subject-level data. It reads a tab
//! separated table, validates it against the feature schema declared in the
//! pipeline configuration, and produces a [`Cohort`]: one row per subject, the
//! feature matrix in schema order, and the binary outcome.
//!
//! - Missing values: empty cells and cells equal to the configured sentinel are
//!   missing. A subject with a missing value in any required column is excluded
//!   before any modeling, and the number of exclusions is reported.
//! - Categorical features are small non-negative integer codes that must be one
//!   of the levels declared for the feature.
//! - The outcome must be coded exactly 0 (benign) or 1 (malignant).

use ndarray::{Array1, Array2, ArrayView1, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// How a feature is measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    Continuous,
    /// Integer-coded categories. The first level is the reference category.
    Categorical {
        levels: Vec<i64>,
        #[serde(default)]
        labels: Vec<String>,
    },
}

/// One column of the feature table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FeatureKind,
}

impl FeatureSpec {
    pub fn continuous(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Continuous,
        }
    }

    pub fn categorical(name: &str, levels: &[i64], labels: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Categorical {
                levels: levels.to_vec(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self.kind, FeatureKind::Continuous)
    }

    /// Display label of a categorical level. Falls back to the numeric code.
    pub fn level_label(&self, level: i64) -> String {
        match &self.kind {
            FeatureKind::Categorical { levels, labels } => levels
                .iter()
                .position(|&l| l == level)
                .and_then(|i| labels.get(i))
                .cloned()
                .unwrap_or_else(|| level.to_string()),
            FeatureKind::Continuous => level.to_string(),
        }
    }
}

/// The ordered feature columns of a cohort.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    features: Vec<FeatureSpec>,
}

impl FeatureSchema {
    pub fn new(features: Vec<FeatureSpec>) -> Result<Self, DataError> {
        let mut seen = HashSet::new();
        for spec in &features {
            if !seen.insert(spec.name.as_str()) {
                return Err(DataError::DuplicateFeature(spec.name.clone()));
            }
            if let FeatureKind::Categorical { levels, labels } = &spec.kind {
                if levels.len() < 2 {
                    return Err(DataError::InvalidLevels {
                        feature: spec.name.clone(),
                        reason: "at least two levels are required".to_string(),
                    });
                }
                if levels.iter().any(|&l| l < 0) {
                    return Err(DataError::InvalidLevels {
                        feature: spec.name.clone(),
                        reason: "levels must be non-negative integer codes".to_string(),
                    });
                }
                if levels.iter().collect::<HashSet<_>>().len() != levels.len() {
                    return Err(DataError::InvalidLevels {
                        feature: spec.name.clone(),
                        reason: "levels must be distinct".to_string(),
                    });
                }
                if !labels.is_empty() && labels.len() != levels.len() {
                    return Err(DataError::InvalidLevels {
                        feature: spec.name.clone(),
                        reason: format!(
                            "{} labels given for {} levels",
                            labels.len(),
                            levels.len()
                        ),
                    });
                }
            }
        }
        Ok(Self { features })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.features.iter().position(|f| f.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&FeatureSpec> {
        self.features.iter().find(|f| f.name == name)
    }
}

/// A validated cohort: subjects in input order.
#[derive(Debug, Clone)]
pub struct Cohort {
    schema: Arc<FeatureSchema>,
    subject_ids: Vec<String>,
    /// Shape: [n_subjects, schema.len()], columns in schema order.
    features: Array2<f64>,
    /// 0.0 = benign, 1.0 = malignant.
    outcome: Array1<f64>,
}

impl Cohort {
    pub fn new(
        schema: Arc<FeatureSchema>,
        subject_ids: Vec<String>,
        features: Array2<f64>,
        outcome: Array1<f64>,
    ) -> Result<Self, DataError> {
        let n = subject_ids.len();
        if features.nrows() != n || outcome.len() != n || features.ncols() != schema.len() {
            return Err(DataError::ShapeMismatch {
                subjects: n,
                rows: features.nrows(),
                columns: features.ncols(),
                expected_columns: schema.len(),
                outcomes: outcome.len(),
            });
        }
        if let Some(&bad) = outcome.iter().find(|&&v| v != 0.0 && v != 1.0) {
            return Err(DataError::InvalidOutcome(bad));
        }
        let mut ids = HashSet::with_capacity(n);
        for id in &subject_ids {
            if !ids.insert(id.as_str()) {
                return Err(DataError::DuplicateSubject(id.clone()));
            }
        }
        for (j, spec) in schema.features().iter().enumerate() {
            let column = features.column(j);
            if let Some(&bad) = column.iter().find(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValue {
                    column: spec.name.clone(),
                    value: bad,
                });
            }
            if let FeatureKind::Categorical { levels, .. } = &spec.kind {
                for &value in column.iter() {
                    if value.fract() != 0.0 || !levels.contains(&(value as i64)) {
                        return Err(DataError::UnknownCategory {
                            column: spec.name.clone(),
                            value,
                        });
                    }
                }
            }
        }
        Ok(Self {
            schema,
            subject_ids,
            features,
            outcome,
        })
    }

    pub fn len(&self) -> usize {
        self.subject_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subject_ids.is_empty()
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn shared_schema(&self) -> Arc<FeatureSchema> {
        Arc::clone(&self.schema)
    }

    pub fn subject_ids(&self) -> &[String] {
        &self.subject_ids
    }

    pub fn features(&self) -> &Array2<f64> {
        &self.features
    }

    pub fn outcome(&self) -> ArrayView1<'_, f64> {
        self.outcome.view()
    }

    pub fn labels(&self) -> Vec<bool> {
        self.outcome.iter().map(|&v| v == 1.0).collect()
    }

    pub fn n_positive(&self) -> usize {
        self.outcome.iter().filter(|&&v| v == 1.0).count()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.schema.index_of(name).map(|j| self.features.column(j))
    }

    /// An isolated copy holding only the subjects at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Cohort {
        Cohort {
            schema: Arc::clone(&self.schema),
            subject_ids: indices.iter().map(|&i| self.subject_ids[i].clone()).collect(),
            features: self.features.select(Axis(0), indices),
            outcome: self.outcome.select(Axis(0), indices),
        }
    }
}

/// A loaded cohort together with the rows dropped for missing values.
#[derive(Debug)]
pub struct LoadedCohort {
    pub cohort: Cohort,
    pub excluded_rows: usize,
    pub total_rows: usize,
}

/// Describes which columns to read and how to interpret them.
#[derive(Debug, Clone)]
pub struct TableLayout<'a> {
    pub subject_id_column: &'a str,
    pub outcome_column: &'a str,
    pub missing_sentinel: Option<f64>,
    pub schema: Arc<FeatureSchema>,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("The outcome must be coded 0 or 1, but the value {0} was found.")]
    InvalidOutcome(f64),
    #[error("Column '{column}' contains the code {value}, which is not one of its declared levels.")]
    UnknownCategory { column: String, value: f64 },
    #[error("Non-finite value {value} found in column '{column}'.")]
    NonFiniteValue { column: String, value: f64 },
    #[error("Feature '{0}' is declared more than once.")]
    DuplicateFeature(String),
    #[error("Subject identifier '{0}' appears more than once.")]
    DuplicateSubject(String),
    #[error("Invalid levels for categorical feature '{feature}': {reason}")]
    InvalidLevels { feature: String, reason: String },
    #[error(
        "Inconsistent cohort shape: {subjects} subjects, {rows}x{columns} feature matrix (expected {expected_columns} columns), {outcomes} outcomes."
    )]
    ShapeMismatch {
        subjects: usize,
        rows: usize,
        columns: usize,
        expected_columns: usize,
        outcomes: usize,
    },
    #[error("No complete rows remain after excluding {excluded} rows with missing values.")]
    NoCompleteRows { excluded: usize },
}

/// Loads a tab separated cohort file and validates it against `layout`.
pub fn load_cohort(path: &str, layout: &TableLayout<'_>) -> Result<LoadedCohort, DataError> {
    log::info!("Loading cohort from '{path}'");

    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let columns: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    let mut required: Vec<&str> = vec![layout.subject_id_column, layout.outcome_column];
    required.extend(layout.schema.features().iter().map(|f| f.name.as_str()));
    for name in &required {
        if !columns.contains(*name) {
            return Err(DataError::ColumnNotFound(name.to_string()));
        }
    }

    let total_rows = df.height();
    let ids = extract_id_column(&df, layout.subject_id_column)?;
    let outcome = extract_numeric_column(&df, layout.outcome_column, layout.missing_sentinel)?;
    let mut feature_columns = Vec::with_capacity(layout.schema.len());
    for spec in layout.schema.features() {
        feature_columns.push(extract_numeric_column(
            &df,
            &spec.name,
            layout.missing_sentinel,
        )?);
    }

    let complete: Vec<usize> = (0..total_rows)
        .filter(|&i| {
            ids[i].is_some()
                && outcome[i].is_some()
                && feature_columns.iter().all(|col| col[i].is_some())
        })
        .collect();
    let excluded_rows = total_rows - complete.len();
    if excluded_rows > 0 {
        log::warn!(
            "Excluded {excluded_rows} of {total_rows} rows with missing values in required columns."
        );
    }
    if complete.is_empty() {
        return Err(DataError::NoCompleteRows {
            excluded: excluded_rows,
        });
    }

    let subject_ids: Vec<String> = complete
        .iter()
        .filter_map(|&i| ids[i].clone())
        .collect();
    let y: Array1<f64> = complete.iter().filter_map(|&i| outcome[i]).collect();
    let mut x = Array2::zeros((complete.len(), layout.schema.len()));
    for (j, col) in feature_columns.iter().enumerate() {
        for (r, &i) in complete.iter().enumerate() {
            x[(r, j)] = col[i].unwrap_or(f64::NAN);
        }
    }

    let cohort = Cohort::new(layout.schema.clone(), subject_ids, x, y)?;
    log::info!(
        "Loaded {} subjects ({} malignant) with {} features.",
        cohort.len(),
        cohort.n_positive(),
        layout.schema.len()
    );
    Ok(LoadedCohort {
        cohort,
        excluded_rows,
        total_rows,
    })
}

fn extract_numeric_column(
    df: &DataFrame,
    column_name: &str,
    sentinel: Option<f64>,
) -> Result<Vec<Option<f64>>, DataError> {
    let series = df.column(column_name)?;
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        })?;
    // A cast that nulls out non-null cells means the column held text.
    if casted.null_count() > series.null_count() {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }
    let chunked = casted.f64()?;
    Ok(chunked
        .into_iter()
        .map(|value| match (value, sentinel) {
            (Some(v), Some(s)) if v == s => None,
            (Some(v), _) if v.is_nan() => None,
            (other, _) => other,
        })
        .collect())
}

fn extract_id_column(df: &DataFrame, column_name: &str) -> Result<Vec<Option<String>>, DataError> {
    let series = df.column(column_name)?;
    let casted = series
        .cast(&DataType::String)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "string identifier",
            found_type: format!("{:?}", series.dtype()),
        })?;
    let chunked = casted.str()?;
    Ok(chunked
        .into_iter()
        .map(|value| value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn schema() -> Arc<FeatureSchema> {
        Arc::new(
            FeatureSchema::new(vec![
                FeatureSpec::continuous("diameter"),
                FeatureSpec::categorical("margin", &[0, 1, 2], &["smooth", "lobulated", "spiculated"]),
            ])
            .unwrap(),
        )
    }

    fn layout(schema: Arc<FeatureSchema>) -> TableLayout<'static> {
        TableLayout {
            subject_id_column: "subject_id",
            outcome_column: "malignant",
            missing_sentinel: Some(-999.0),
            schema,
        }
    }

    #[test]
    fn rows_with_missing_values_are_excluded_and_counted() {
        let content = "subject_id\tmalignant\tdiameter\tmargin\n\
                       s1\t1\t12.5\t2\n\
                       s2\t0\t-999\t0\n\
                       s3\t0\t8.1\t\n\
                       s4\t1\t15.0\t1\n\
                       s5\t0\t6.3\t0";
        let file = create_test_tsv(content).unwrap();
        let loaded = load_cohort(file.path().to_str().unwrap(), &layout(schema())).unwrap();
        assert_eq!(loaded.total_rows, 5);
        assert_eq!(loaded.excluded_rows, 2);
        assert_eq!(loaded.cohort.subject_ids(), &["s1", "s4", "s5"]);
        assert_eq!(loaded.cohort.n_positive(), 2);
        assert_eq!(loaded.cohort.column("margin").unwrap().to_vec(), vec![2.0, 1.0, 0.0]);
    }

    #[test]
    fn missing_column_is_reported_by_name() {
        let content = "subject_id\tmalignant\tdiameter\ns1\t1\t3.0";
        let file = create_test_tsv(content).unwrap();
        let err = load_cohort(file.path().to_str().unwrap(), &layout(schema())).unwrap_err();
        match err {
            DataError::ColumnNotFound(col) => assert_eq!(col, "margin"),
            other => panic!("Expected ColumnNotFound(margin), got {:?}", other),
        }
    }

    #[test]
    fn outcome_outside_zero_one_is_rejected() {
        let content = "subject_id\tmalignant\tdiameter\tmargin\ns1\t2\t3.0\t0\ns2\t0\t4.0\t1";
        let file = create_test_tsv(content).unwrap();
        let err = load_cohort(file.path().to_str().unwrap(), &layout(schema())).unwrap_err();
        assert!(matches!(err, DataError::InvalidOutcome(v) if v == 2.0));
    }

    #[test]
    fn undeclared_category_code_is_rejected() {
        let content = "subject_id\tmalignant\tdiameter\tmargin\ns1\t1\t3.0\t7\ns2\t0\t4.0\t1";
        let file = create_test_tsv(content).unwrap();
        let err = load_cohort(file.path().to_str().unwrap(), &layout(schema())).unwrap_err();
        match err {
            DataError::UnknownCategory { column, value } => {
                assert_eq!(column, "margin");
                assert_eq!(value, 7.0);
            }
            other => panic!("Expected UnknownCategory, got {:?}", other),
        }
    }

    #[test]
    fn subset_preserves_requested_order() {
        let cohort = Cohort::new(
            schema(),
            vec!["a".into(), "b".into(), "c".into()],
            Array2::from_shape_vec((3, 2), vec![1.0, 0.0, 2.0, 1.0, 3.0, 2.0]).unwrap(),
            Array1::from_vec(vec![0.0, 1.0, 1.0]),
        )
        .unwrap();
        let sub = cohort.subset(&[2, 0]);
        assert_eq!(sub.subject_ids(), &["c", "a"]);
        assert_eq!(sub.column("diameter").unwrap().to_vec(), vec![3.0, 1.0]);
        assert_eq!(sub.labels(), vec![true, false]);
    }

    #[test]
    fn schema_rejects_single_level_categoricals() {
        let err = FeatureSchema::new(vec![FeatureSpec::categorical("x", &[0], &[])]).unwrap_err();
        assert!(matches!(err, DataError::InvalidLevels { .. }));
    }
}
