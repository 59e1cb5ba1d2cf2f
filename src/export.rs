//! Tab separated tables and model artifacts for downstream reporting.

use crate::error::PipelineError;
use crate::metrics::{MetricReport, ThresholdSource};
use crate::model::FittedModel;
use crate::pipeline::{ModelReport, StudyReport};
use csv::{Writer, WriterBuilder};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const METRIC_COLUMNS: [&str; 11] = [
    "n_subjects",
    "n_positive",
    "auc",
    "auc_ci_lower",
    "auc_ci_upper",
    "sensitivity",
    "specificity",
    "accuracy",
    "mcc",
    "threshold",
    "threshold_source",
];

fn output_error(path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Output(format!("{}: {err}", path.display()))
}

fn tsv_writer(path: &Path) -> Result<Writer<File>, PipelineError> {
    WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| output_error(path, e))
}

fn metric_fields(report: &MetricReport) -> Vec<String> {
    let source = match report.threshold_source {
        ThresholdSource::Youden => "youden",
        ThresholdSource::Supplied => "supplied",
    };
    vec![
        report.n_subjects.to_string(),
        report.n_positive.to_string(),
        report.auc.to_string(),
        report.auc_ci_lower.to_string(),
        report.auc_ci_upper.to_string(),
        report.sensitivity.to_string(),
        report.specificity.to_string(),
        report.accuracy.to_string(),
        report.mcc.to_string(),
        report.threshold.to_string(),
        source.to_string(),
    ]
}

/// Writes every table for `report` into `out_dir` and returns the paths.
pub fn export_study(report: &StudyReport, out_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    fs::create_dir_all(out_dir).map_err(|e| output_error(out_dir, e))?;
    let mut written = Vec::new();

    let path = out_dir.join("partitions.tsv");
    let mut w = tsv_writer(&path)?;
    w.write_record(["subject_id", "partition"])
        .map_err(|e| output_error(&path, e))?;
    for (id, name) in report
        .subject_ids
        .iter()
        .zip(report.partitions.assignment(report.subject_ids.len()))
    {
        let label = name.map_or("excluded", |n| n.as_str());
        w.write_record([id.as_str(), label])
            .map_err(|e| output_error(&path, e))?;
    }
    w.flush().map_err(|e| output_error(&path, e))?;
    written.push(path);

    let path = out_dir.join("metrics.tsv");
    let mut w = tsv_writer(&path)?;
    let mut header = vec!["model_type", "partition"];
    header.extend(METRIC_COLUMNS);
    w.write_record(&header).map_err(|e| output_error(&path, e))?;
    for model in &report.models {
        for (name, metrics) in &model.partition_reports {
            let mut row = vec![model.model_type.to_string(), name.to_string()];
            row.extend(metric_fields(metrics));
            w.write_record(&row).map_err(|e| output_error(&path, e))?;
        }
    }
    w.flush().map_err(|e| output_error(&path, e))?;
    written.push(path);

    for model in &report.models {
        written.extend(export_model(model, out_dir)?);
    }

    let path = out_dir.join("failures.tsv");
    let mut w = tsv_writer(&path)?;
    w.write_record(["model_type", "category", "stage", "partition", "fold", "message"])
        .map_err(|e| output_error(&path, e))?;
    for model in &report.models {
        for err in model.recorded() {
            let (stage, partition, fold) = match err.context() {
                Some(ctx) => (
                    ctx.stage.to_string(),
                    ctx.partition.clone(),
                    ctx.fold.map(|f| f.to_string()).unwrap_or_default(),
                ),
                None => (String::new(), String::new(), String::new()),
            };
            w.write_record([
                model.model_type.to_string(),
                err.category().to_string(),
                stage,
                partition,
                fold,
                err.to_string(),
            ])
            .map_err(|e| output_error(&path, e))?;
        }
    }
    w.flush().map_err(|e| output_error(&path, e))?;
    written.push(path);

    log::info!("Wrote {} files to '{}'.", written.len(), out_dir.display());
    Ok(written)
}

/// Coefficients with Wald odds-ratio intervals, intercept first.
pub fn write_coefficients(model: &FittedModel, path: &Path) -> Result<(), PipelineError> {
    let mut w = tsv_writer(path)?;
    w.write_record([
        "term",
        "feature",
        "coefficient",
        "std_error",
        "odds_ratio",
        "odds_ratio_ci_lower",
        "odds_ratio_ci_upper",
    ])
    .map_err(|e| output_error(path, e))?;
    w.write_record([
        "(intercept)".to_string(),
        String::new(),
        model.intercept.to_string(),
        model.intercept_std_error.to_string(),
        String::new(),
        String::new(),
        String::new(),
    ])
    .map_err(|e| output_error(path, e))?;
    for term in &model.terms {
        let (lo, hi) = term.odds_ratio_interval();
        w.write_record([
            term.name.clone(),
            term.feature.clone(),
            term.coefficient.to_string(),
            term.std_error.to_string(),
            term.odds_ratio().to_string(),
            lo.to_string(),
            hi.to_string(),
        ])
        .map_err(|e| output_error(path, e))?;
    }
    w.flush().map_err(|e| output_error(path, e))
}

fn export_model(model: &ModelReport, out_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let tag = model.model_type.as_str();
    let mut written = Vec::new();

    let path = out_dir.join(format!("coefficients_{tag}.tsv"));
    write_coefficients(&model.fit.model, &path)?;
    written.push(path);

    let path = out_dir.join(format!("features_{tag}.txt"));
    let mut file = File::create(&path).map_err(|e| output_error(&path, e))?;
    for name in &model.fit.selected.names {
        writeln!(file, "{name}").map_err(|e| output_error(&path, e))?;
    }
    written.push(path);

    let path = out_dir.join(format!("path_{tag}.tsv"));
    let mut w = tsv_writer(&path)?;
    w.write_record(["lambda", "mean_deviance", "std_error", "n_nonzero", "status"])
        .map_err(|e| output_error(&path, e))?;
    let selection = &model.fit.selection;
    for (i, point) in selection.path.points.iter().enumerate() {
        let status = if i == selection.selected_index {
            "selected_1se"
        } else if i == selection.minimum_index {
            "minimum"
        } else if point.is_valid() {
            "valid"
        } else {
            "failed"
        };
        w.write_record([
            point.lambda.to_string(),
            point.mean_deviance.to_string(),
            point.std_error.to_string(),
            point.n_nonzero.to_string(),
            status.to_string(),
        ])
        .map_err(|e| output_error(&path, e))?;
    }
    w.flush().map_err(|e| output_error(&path, e))?;
    written.push(path);

    let path = out_dir.join(format!("nested_{tag}.tsv"));
    let mut w = tsv_writer(&path)?;
    let mut header = vec!["fold", "n_training"];
    header.extend(METRIC_COLUMNS);
    header.push("selected_features");
    w.write_record(&header).map_err(|e| output_error(&path, e))?;
    for fold in &model.nested.folds {
        let mut row = vec![fold.fold.to_string(), fold.training_subjects.len().to_string()];
        row.extend(metric_fields(&fold.report));
        row.push(fold.feature_set.names.join(","));
        w.write_record(&row).map_err(|e| output_error(&path, e))?;
    }
    w.flush().map_err(|e| output_error(&path, e))?;
    written.push(path);

    let path = out_dir.join(format!("stability_{tag}.tsv"));
    let mut w = tsv_writer(&path)?;
    w.write_record(["feature", "selection_frequency"])
        .map_err(|e| output_error(&path, e))?;
    for (name, freq) in model.nested.selection_frequency() {
        w.write_record([name, freq.to_string()])
            .map_err(|e| output_error(&path, e))?;
    }
    w.flush().map_err(|e| output_error(&path, e))?;
    written.push(path);

    let path = out_dir.join(format!("model_{tag}.toml"));
    let path_str = path
        .to_str()
        .ok_or_else(|| output_error(&path, "path is not valid UTF-8"))?;
    model.artifact().save(path_str)?;
    written.push(path);

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FeatureSchema, FeatureSpec};
    use crate::encoding::Encoding;
    use crate::feature_set::{DataOrigin, FeatureSet, SelectionStage};
    use crate::model::Term;
    use tempfile::tempdir;

    #[test]
    fn coefficient_table_lists_intercept_then_terms() {
        let schema = FeatureSchema::new(vec![FeatureSpec::continuous("diameter")]).unwrap();
        let names = vec!["diameter".to_string()];
        let model = FittedModel {
            feature_set: FeatureSet::new(names.clone(), SelectionStage::PostLasso, DataOrigin::Training),
            intercept: -2.0,
            intercept_std_error: 0.5,
            deviance: 10.0,
            null_deviance: 20.0,
            iterations: 5,
            n_subjects: 30,
            encoding: Encoding::for_features(&schema, &names).unwrap(),
            terms: vec![Term {
                name: "diameter".into(),
                feature: "diameter".into(),
                coefficient: 0.25,
                std_error: 0.1,
            }],
        };
        let dir = tempdir().unwrap();
        let path = dir.path().join("coefficients.tsv");
        write_coefficients(&model, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("term\tfeature\tcoefficient"));
        assert!(lines[1].starts_with("(intercept)\t\t-2\t0.5"));
        assert!(lines[2].starts_with("diameter\tdiameter\t0.25\t0.1\t"));
    }
}
