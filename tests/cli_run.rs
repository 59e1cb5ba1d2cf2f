use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

const CONFIG: &str = r#"
seed = 20240501
subject_id_column = "patient_id"
outcome_column = "malignant"
missing_sentinel = -999.0

[selector]
n_lambdas = 20

[nested]
outer_folds = 3
inner_folds = 3

[metrics]
bootstrap_resamples = 100

[[features]]
name = "diameter_mm"
kind = "continuous"

[[features]]
name = "margin"
kind = "categorical"
levels = [0, 1, 2]
labels = ["smooth", "lobulated", "spiculated"]

[[features]]
name = "slice_thickness"
kind = "continuous"

[pools]
clinico_radiological = ["diameter_mm", "margin"]
scan_parameters = ["slice_thickness"]
"#;

/// 180 nodules plus one row with a missing diameter.
fn write_cohort(path: &Path) {
    let mut rng = StdRng::seed_from_u64(404);
    let mut text = String::from("patient_id\tdiameter_mm\tmargin\tslice_thickness\tmalignant\n");
    for i in 0..180 {
        let diameter: f64 = 14.0 + 5.0 * rng.sample::<f64, _>(StandardNormal);
        let margin: i64 = rng.gen_range(0..3);
        let thickness = if rng.r#gen::<bool>() { 1.0 } else { 2.5 };
        let eta = 0.35 * (diameter - 14.0) + 0.6 * margin as f64 - 0.6;
        let malignant = u8::from(rng.r#gen::<f64>() < 1.0 / (1.0 + (-eta).exp()));
        writeln!(text, "P{i:03}\t{diameter:.2}\t{margin}\t{thickness}\t{malignant}").unwrap();
    }
    writeln!(text, "P999\t-999\t1\t1.0\t1").unwrap();
    fs::write(path, text).unwrap();
}

#[test]
fn run_then_predict_round_trips_through_the_model_artifact() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    let config = tmp.path().join("study.toml");
    let out = tmp.path().join("results");
    write_cohort(&data);
    fs::write(&config, CONFIG).unwrap();

    let exe = env!("CARGO_BIN_EXE_radsel");
    let status = Command::new(exe)
        .args([
            "run",
            data.to_str().unwrap(),
            "--config",
            config.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
        ])
        .status()
        .expect("run radsel");
    assert!(status.success(), "run exited with {status:?}");

    for file in [
        "partitions.tsv",
        "metrics.tsv",
        "failures.tsv",
        "coefficients_clinico_radiological.tsv",
        "features_clinico_radiological.txt",
        "path_hybrid.tsv",
        "nested_scan_parameters.tsv",
        "stability_hybrid.tsv",
        "model_clinico_radiological.toml",
    ] {
        assert!(out.join(file).exists(), "{file} missing");
    }

    let partitions = fs::read_to_string(out.join("partitions.tsv")).unwrap();
    assert_eq!(partitions.lines().count(), 181, "header plus one row per complete subject");
    assert!(!partitions.contains("P999"));

    // Three model types, three partitions each.
    let metrics = fs::read_to_string(out.join("metrics.tsv")).unwrap();
    assert_eq!(metrics.lines().count(), 10);

    let features = fs::read_to_string(out.join("features_clinico_radiological.txt")).unwrap();
    assert!(features.lines().any(|l| l == "diameter_mm"));

    // A single bootstrap resample collapses the printed interval to a point,
    // which shows predict honours the [metrics] table.
    let predict_config = tmp.path().join("predict.toml");
    fs::write(
        &predict_config,
        CONFIG.replace("bootstrap_resamples = 100", "bootstrap_resamples = 1"),
    )
    .unwrap();
    let predictions = tmp.path().join("predictions.tsv");
    let output = Command::new(exe)
        .args([
            "predict",
            data.to_str().unwrap(),
            "--config",
            predict_config.to_str().unwrap(),
            "--model",
            out.join("model_clinico_radiological.toml").to_str().unwrap(),
            "--out",
            predictions.to_str().unwrap(),
        ])
        .output()
        .expect("run radsel predict");
    assert!(output.status.success(), "predict exited with {:?}", output.status);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let auc_line = stdout
        .lines()
        .find(|l| l.starts_with("AUC "))
        .unwrap_or_else(|| panic!("no AUC line in: {stdout}"));
    let interval = &auc_line[auc_line.find('[').unwrap() + 1..auc_line.find(']').unwrap()];
    let bounds: Vec<&str> = interval.split(", ").collect();
    assert_eq!(bounds.len(), 2, "{auc_line}");
    assert_eq!(bounds[0], bounds[1], "{auc_line}");

    let text = fs::read_to_string(&predictions).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("subject_id\tprobability\tmalignant_call"));
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 180);
    for row in rows {
        let fields: Vec<&str> = row.split('\t').collect();
        let p: f64 = fields[1].parse().unwrap();
        assert!((0.0..=1.0).contains(&p));
        assert!(fields[2] == "0" || fields[2] == "1");
    }
}

#[test]
fn invalid_configuration_exits_with_an_error() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    let config = tmp.path().join("study.toml");
    write_cohort(&data);
    let broken = format!("{CONFIG}\n[split]\ntraining = 0.8\nvalidation = 0.3\ntesting = 0.1\n");
    fs::write(&config, broken).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_radsel"))
        .args(["run", data.to_str().unwrap(), "--config", config.to_str().unwrap()])
        .current_dir(tmp.path())
        .output()
        .expect("run radsel");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Split ratios"), "stderr was: {stderr}");
}
