//! # Regularized Selector: L1-penalized logistic regression
//!
//! Features are selected by fitting a LASSO logistic model along a
//! log-spaced path of penalty strengths and choosing a strength by k-fold
//! cross-validation with the one-standard-error rule.
//!
//! The objective at strength `λ` on standardized columns is
//!
//! ```text
//!     -(1/n) Σ [y log p + (1 - y) log(1 - p)]  +  λ Σ_j |β_j|
//! ```
//!
//! with an unpenalized intercept. Each strength is solved by an outer IRLS
//! loop (quadratic approximation of the log-likelihood) around cyclic
//! coordinate descent with soft-thresholding, warm-started from the previous
//! strength on the path.
//!
//! Every strength is scored on one shared stratified fold assignment. A solver
//! failure at a strength, in any fold or in the full-data fit, removes that
//! strength from the comparison but does not stop the path.

use crate::encoding::Encoding;
use crate::folds::{FoldError, split_fold, stratified_folds};
use crate::seeding::{SeedStream, rng_for};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fitted probabilities are kept inside [PROB_FLOOR, 1 - PROB_FLOOR] while
/// forming IRLS weights, so the weights stay bounded away from zero.
const PROB_FLOOR: f64 = 1e-5;

/// Probabilities are clamped to this distance from 0/1 when scoring deviance.
const DEVIANCE_PROB_FLOOR: f64 = 1e-15;

const ZERO_SCALE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LassoConfig {
    /// Number of cross-validation folds.
    pub folds: usize,
    /// Number of penalty strengths on the path.
    pub n_lambdas: usize,
    /// Smallest strength as a fraction of the strength that zeroes all coefficients.
    pub lambda_min_ratio: f64,
    /// Maximum IRLS iterations per strength.
    pub max_iterations: usize,
    /// Maximum coordinate-descent sweeps per IRLS iteration.
    pub max_passes: usize,
    /// Convergence tolerance on the largest coefficient change.
    pub tolerance: f64,
}

impl Default for LassoConfig {
    fn default() -> Self {
        Self {
            folds: 5,
            n_lambdas: 50,
            lambda_min_ratio: 0.01,
            max_iterations: 100,
            max_passes: 1000,
            tolerance: 1e-6,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LassoError {
    #[error("Coordinate descent did not converge at λ = {lambda:.4e} within {iterations} IRLS iterations.")]
    DidNotConverge { lambda: f64, iterations: usize },
    #[error("Non-finite coefficients encountered at λ = {lambda:.4e}.")]
    NonFinite { lambda: f64 },
    #[error("Every penalty strength on the path failed ({failures} failures); nothing to select from.")]
    NoValidStrength { failures: usize },
    #[error("Invalid selector input: {0}")]
    InvalidInput(String),
    #[error("Fold assignment failed: {0}")]
    Folds(#[from] FoldError),
}

/// Column centering and scaling learned from one training table.
#[derive(Debug, Clone)]
struct Standardizer {
    means: Array1<f64>,
    scales: Array1<f64>,
}

impl Standardizer {
    fn fit(x: ArrayView2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let means = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let mut scales = Array1::zeros(x.ncols());
        for (j, col) in x.axis_iter(Axis(1)).enumerate() {
            let ss: f64 = col.iter().map(|&v| (v - means[j]).powi(2)).sum();
            scales[j] = (ss / n).sqrt();
        }
        Self { means, scales }
    }

    fn is_active(&self, j: usize) -> bool {
        self.scales[j] > ZERO_SCALE
    }

    /// Standardized copy of `x`. Constant columns become zeros.
    fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut out = x.to_owned();
        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            if self.is_active(j) {
                let (m, s) = (self.means[j], self.scales[j]);
                col.mapv_inplace(|v| (v - m) / s);
            } else {
                col.fill(0.0);
            }
        }
        out
    }

    /// Maps standardized-scale coefficients back to the original columns.
    fn unscale(&self, intercept: f64, beta: &Array1<f64>) -> (f64, Array1<f64>) {
        let mut coefficients = Array1::zeros(beta.len());
        let mut b0 = intercept;
        for j in 0..beta.len() {
            if self.is_active(j) {
                coefficients[j] = beta[j] / self.scales[j];
                b0 -= coefficients[j] * self.means[j];
            }
        }
        (b0, coefficients)
    }
}

/// A penalized fit at one strength, on the original column scale.
#[derive(Debug, Clone, PartialEq)]
pub struct PenalizedFit {
    pub lambda: f64,
    pub intercept: f64,
    pub coefficients: Array1<f64>,
    pub iterations: usize,
}

impl PenalizedFit {
    pub fn linear_predictor(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.dot(&self.coefficients) + self.intercept
    }

    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.linear_predictor(x).mapv(sigmoid)
    }

    /// Indices of columns with a non-zero coefficient.
    pub fn nonzero(&self) -> Vec<usize> {
        self.coefficients
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c != 0.0)
            .map(|(j, _)| j)
            .collect()
    }
}

/// Why a path strength was excluded.
#[derive(Debug, Clone, PartialEq)]
pub struct PathFailure {
    /// `None` for the fit on the full selector input.
    pub fold: Option<usize>,
    pub error: LassoError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathPoint {
    pub lambda: f64,
    /// Mean held-out binomial deviance per subject across folds.
    pub mean_deviance: f64,
    /// Standard error of the fold deviances.
    pub std_error: f64,
    pub n_nonzero: usize,
    /// Full-data fit at this strength.
    pub fit: Option<PenalizedFit>,
    pub failures: Vec<PathFailure>,
}

impl PathPoint {
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty() && self.fit.is_some() && self.mean_deviance.is_finite()
    }
}

/// Cross-validated path over decreasing penalty strengths.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularizationPath {
    pub points: Vec<PathPoint>,
    /// Fold id of every row, shared by all strengths.
    pub fold_assignment: Vec<usize>,
}

impl RegularizationPath {
    /// Strength with the lowest mean deviance. Ties go to the larger strength.
    pub fn minimum_index(&self) -> Option<usize> {
        self.points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_valid())
            .fold(None, |best: Option<(usize, f64)>, (i, p)| match best {
                Some((_, d)) if d <= p.mean_deviance => best,
                _ => Some((i, p.mean_deviance)),
            })
            .map(|(i, _)| i)
    }

    /// Largest strength whose mean deviance is within one standard error of
    /// the minimum.
    pub fn one_standard_error_index(&self) -> Option<usize> {
        let min_idx = self.minimum_index()?;
        let min = &self.points[min_idx];
        let ceiling = min.mean_deviance + min.std_error;
        self.points
            .iter()
            .position(|p| p.is_valid() && p.mean_deviance <= ceiling)
    }

    pub fn failures(&self) -> impl Iterator<Item = (f64, &PathFailure)> {
        self.points
            .iter()
            .flat_map(|p| p.failures.iter().map(move |f| (p.lambda, f)))
    }
}

/// The selector's result for one feature pool.
#[derive(Debug, Clone)]
pub struct Selection {
    pub path: RegularizationPath,
    pub minimum_index: usize,
    pub selected_index: usize,
    /// Full-data penalized fit at the selected strength, over all encoded columns.
    pub fit: PenalizedFit,
    /// Features with at least one non-zero column, in encoding order.
    pub selected_features: Vec<String>,
}

impl Selection {
    pub fn selected_lambda(&self) -> f64 {
        self.path.points[self.selected_index].lambda
    }
}

#[inline]
pub(crate) fn sigmoid(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

#[inline]
fn soft_threshold(value: f64, lambda: f64) -> f64 {
    if value > lambda {
        value - lambda
    } else if value < -lambda {
        value + lambda
    } else {
        0.0
    }
}

/// Mean binomial deviance of `fit` on `(x, y)`.
pub fn mean_deviance(fit: &PenalizedFit, x: ArrayView2<f64>, y: ArrayView1<f64>) -> f64 {
    binomial_deviance(fit.predict_proba(x).view(), y) / y.len().max(1) as f64
}

/// Total binomial deviance `-2 Σ [y log p + (1-y) log(1-p)]`.
pub fn binomial_deviance(p: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    p.iter()
        .zip(y.iter())
        .map(|(&pi, &yi)| {
            let pi = pi.clamp(DEVIANCE_PROB_FLOOR, 1.0 - DEVIANCE_PROB_FLOOR);
            -2.0 * (yi * pi.ln() + (1.0 - yi) * (1.0 - pi).ln())
        })
        .sum()
}

/// Smallest strength at which every coefficient is zero.
fn lambda_max(xs: ArrayView2<f64>, y: ArrayView1<f64>) -> f64 {
    let n = y.len() as f64;
    let ybar = y.mean().unwrap_or(0.5);
    let centered = y.mapv(|v| v - ybar);
    xs.t()
        .dot(&centered)
        .iter()
        .fold(0.0_f64, |acc, &g| acc.max(g.abs() / n))
}

/// Log-spaced, strictly decreasing strengths from `max` to `max * ratio`.
pub fn lambda_sequence(max: f64, count: usize, ratio: f64) -> Vec<f64> {
    if count <= 1 {
        return vec![max];
    }
    let log_max = max.ln();
    let log_min = (max * ratio).ln();
    (0..count)
        .map(|k| (log_max + (log_min - log_max) * k as f64 / (count - 1) as f64).exp())
        .collect()
}

#[derive(Debug, Clone)]
struct WarmStart {
    intercept: f64,
    beta: Array1<f64>,
}

/// Solves one strength on standardized columns, starting from `start`.
fn solve_strength(
    xs: ArrayView2<f64>,
    y: ArrayView1<f64>,
    lambda: f64,
    start: &WarmStart,
    config: &LassoConfig,
) -> Result<(WarmStart, usize), LassoError> {
    let n = xs.nrows() as f64;
    let p = xs.ncols();
    let mut b0 = start.intercept;
    let mut beta = start.beta.clone();
    let inner_tolerance = config.tolerance * config.tolerance;

    for iteration in 1..=config.max_iterations {
        let eta = xs.dot(&beta) + b0;
        let probs = eta.mapv(|e| sigmoid(e).clamp(PROB_FLOOR, 1.0 - PROB_FLOOR));
        let weights = probs.mapv(|pi| pi * (1.0 - pi));
        // Working residual z - eta.
        let mut residual = Array1::from_shape_fn(y.len(), |i| (y[i] - probs[i]) / weights[i]);
        let weight_sum = weights.sum();
        let curvature: Vec<f64> = (0..p)
            .map(|j| {
                xs.column(j)
                    .iter()
                    .zip(weights.iter())
                    .map(|(&x, &w)| w * x * x)
                    .sum::<f64>()
                    / n
            })
            .collect();

        let previous_b0 = b0;
        let previous_beta = beta.clone();

        for _ in 0..config.max_passes {
            let mut max_step = 0.0_f64;

            let shift = residual
                .iter()
                .zip(weights.iter())
                .map(|(&r, &w)| w * r)
                .sum::<f64>()
                / weight_sum;
            if shift != 0.0 {
                b0 += shift;
                residual.mapv_inplace(|r| r - shift);
                max_step = max_step.max(weight_sum / n * shift * shift);
            }

            for j in 0..p {
                if curvature[j] <= ZERO_SCALE {
                    continue;
                }
                let column = xs.column(j);
                let gradient = column
                    .iter()
                    .zip(weights.iter())
                    .zip(residual.iter())
                    .map(|((&x, &w), &r)| w * x * r)
                    .sum::<f64>()
                    / n
                    + curvature[j] * beta[j];
                let updated = soft_threshold(gradient, lambda) / curvature[j];
                let delta = updated - beta[j];
                if delta != 0.0 {
                    residual.scaled_add(-delta, &column);
                    beta[j] = updated;
                    max_step = max_step.max(curvature[j] * delta * delta);
                }
            }

            if max_step < inner_tolerance {
                break;
            }
        }

        if !b0.is_finite() || beta.iter().any(|b| !b.is_finite()) {
            return Err(LassoError::NonFinite { lambda });
        }

        let change = beta
            .iter()
            .zip(previous_beta.iter())
            .map(|(a, b)| (a - b).abs())
            .fold((b0 - previous_b0).abs(), f64::max);
        if change < config.tolerance {
            return Ok((WarmStart { intercept: b0, beta }, iteration));
        }
    }

    Err(LassoError::DidNotConverge {
        lambda,
        iterations: config.max_iterations,
    })
}

/// Fits every strength in `lambdas` on `(x, y)` with warm starts.
///
/// A failed strength yields its error; the next strength restarts from the
/// last successful solution.
pub fn fit_path(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    lambdas: &[f64],
    config: &LassoConfig,
) -> Vec<Result<PenalizedFit, LassoError>> {
    let standardizer = Standardizer::fit(x);
    let xs = standardizer.transform(x);
    let ybar = y.mean().unwrap_or(0.5).clamp(PROB_FLOOR, 1.0 - PROB_FLOOR);
    let mut warm = WarmStart {
        intercept: (ybar / (1.0 - ybar)).ln(),
        beta: Array1::zeros(x.ncols()),
    };

    lambdas
        .iter()
        .map(|&lambda| {
            let (solution, iterations) = solve_strength(xs.view(), y, lambda, &warm, config)?;
            let (intercept, coefficients) = standardizer.unscale(solution.intercept, &solution.beta);
            warm = solution;
            Ok(PenalizedFit {
                lambda,
                intercept,
                coefficients,
                iterations,
            })
        })
        .collect()
}

/// Runs the cross-validated path and applies the one-standard-error rule.
///
/// `x` is the encoded design (no intercept column) and `encoding` names its
/// columns. Folds are drawn from the selector stream of `seed`.
pub fn select_features(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    encoding: &Encoding,
    config: &LassoConfig,
    seed: u64,
) -> Result<Selection, LassoError> {
    if x.nrows() != y.len() {
        return Err(LassoError::InvalidInput(format!(
            "{} rows in the design but {} outcomes",
            x.nrows(),
            y.len()
        )));
    }
    if x.ncols() != encoding.len() {
        return Err(LassoError::InvalidInput(format!(
            "{} design columns but {} encoded terms",
            x.ncols(),
            encoding.len()
        )));
    }

    let labels: Vec<bool> = y.iter().map(|&v| v == 1.0).collect();
    let mut rng = rng_for(seed, SeedStream::SelectorFolds, 0);
    let fold_assignment = stratified_folds(&labels, config.folds, &mut rng)?;

    let standardized = Standardizer::fit(x).transform(x);
    let top = lambda_max(standardized.view(), y);
    let lambdas = if top > 0.0 {
        lambda_sequence(top, config.n_lambdas, config.lambda_min_ratio)
    } else {
        // No column moves the gradient; the path is all zeros.
        vec![1.0]
    };
    log::debug!(
        "Selector path: {} strengths from {:.4e} to {:.4e}, {} folds.",
        lambdas.len(),
        lambdas[0],
        lambdas[lambdas.len() - 1],
        config.folds
    );

    let fold_scores: Vec<Vec<Result<f64, LassoError>>> = (0..config.folds)
        .into_par_iter()
        .map(|fold| {
            let (train, test) = split_fold(&fold_assignment, fold);
            let x_train = x.select(Axis(0), &train);
            let y_train = y.select(Axis(0), &train);
            let x_test = x.select(Axis(0), &test);
            let y_test = y.select(Axis(0), &test);
            fit_path(x_train.view(), y_train.view(), &lambdas, config)
                .into_iter()
                .map(|fit| {
                    let fit = fit?;
                    let deviance = mean_deviance(&fit, x_test.view(), y_test.view());
                    if deviance.is_finite() {
                        Ok(deviance)
                    } else {
                        Err(LassoError::NonFinite { lambda: fit.lambda })
                    }
                })
                .collect()
        })
        .collect();

    let full_fits = fit_path(x, y, &lambdas, config);

    let k = config.folds as f64;
    let points: Vec<PathPoint> = lambdas
        .iter()
        .enumerate()
        .zip(full_fits)
        .map(|((idx, &lambda), full)| {
            let mut failures = Vec::new();
            let mut deviances = Vec::with_capacity(config.folds);
            for (fold, scores) in fold_scores.iter().enumerate() {
                match &scores[idx] {
                    Ok(d) => deviances.push(*d),
                    Err(e) => failures.push(PathFailure {
                        fold: Some(fold),
                        error: e.clone(),
                    }),
                }
            }
            let fit = match full {
                Ok(fit) => Some(fit),
                Err(error) => {
                    failures.push(PathFailure { fold: None, error });
                    None
                }
            };
            let (mean_deviance, std_error) = if failures.is_empty() {
                let mean = deviances.iter().sum::<f64>() / k;
                let var = deviances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (k - 1.0);
                (mean, (var / k).sqrt())
            } else {
                (f64::NAN, f64::NAN)
            };
            PathPoint {
                lambda,
                mean_deviance,
                std_error,
                n_nonzero: fit.as_ref().map_or(0, |f| f.nonzero().len()),
                fit,
                failures,
            }
        })
        .collect();

    let path = RegularizationPath {
        points,
        fold_assignment,
    };
    let failed = path.points.iter().filter(|p| !p.is_valid()).count();
    if failed > 0 {
        log::warn!(
            "{failed} of {} penalty strengths failed and were excluded from selection.",
            path.points.len()
        );
    }

    let (Some(minimum_index), Some(selected_index)) =
        (path.minimum_index(), path.one_standard_error_index())
    else {
        return Err(LassoError::NoValidStrength {
            failures: path.failures().count(),
        });
    };

    let fit = path.points[selected_index]
        .fit
        .clone()
        .ok_or(LassoError::NoValidStrength {
            failures: path.failures().count(),
        })?;

    let column_features = encoding.column_features();
    let mut selected_features: Vec<String> = Vec::new();
    for j in fit.nonzero() {
        let feature = column_features[j];
        if !selected_features.iter().any(|f| f == feature) {
            selected_features.push(feature.to_string());
        }
    }

    log::info!(
        "Selector: λ_min = {:.4e} (deviance {:.4}), λ_1se = {:.4e} (deviance {:.4}); {} features selected.",
        path.points[minimum_index].lambda,
        path.points[minimum_index].mean_deviance,
        path.points[selected_index].lambda,
        path.points[selected_index].mean_deviance,
        selected_features.len()
    );

    Ok(Selection {
        path,
        minimum_index,
        selected_index,
        fit,
        selected_features,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FeatureSchema, FeatureSpec};
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn continuous_encoding(p: usize) -> Encoding {
        let names: Vec<String> = (0..p).map(|j| format!("x{j}")).collect();
        let schema =
            FeatureSchema::new(names.iter().map(|n| FeatureSpec::continuous(n)).collect()).unwrap();
        Encoding::for_features(&schema, &names).unwrap()
    }

    fn logistic_data(n: usize, beta: &[f64], seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let p = beta.len();
        let mut x = Array2::zeros((n, p));
        for v in x.iter_mut() {
            *v = rng.sample::<f64, _>(StandardNormal);
        }
        let y = Array1::from_shape_fn(n, |i| {
            let eta: f64 = (0..p).map(|j| beta[j] * x[(i, j)]).sum();
            if rng.r#gen::<f64>() < sigmoid(eta) { 1.0 } else { 0.0 }
        });
        (x, y)
    }

    #[test]
    fn lambda_sequence_is_log_spaced_and_decreasing() {
        let seq = lambda_sequence(2.0, 5, 0.01);
        assert_eq!(seq.len(), 5);
        assert_abs_diff_eq!(seq[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(seq[4], 0.02, epsilon = 1e-12);
        let ratio = seq[1] / seq[0];
        for w in seq.windows(2) {
            assert!(w[1] < w[0]);
            assert_abs_diff_eq!(w[1] / w[0], ratio, epsilon = 1e-12);
        }
    }

    #[test]
    fn first_strength_zeroes_every_coefficient() {
        let (x, y) = logistic_data(150, &[1.5, 0.0, -1.0], 4);
        let xs = Standardizer::fit(x.view()).transform(x.view());
        let top = lambda_max(xs.view(), y.view());
        let fits = fit_path(x.view(), y.view(), &[top * 1.0001, top * 0.5], &LassoConfig::default());
        let first = fits[0].as_ref().unwrap();
        assert!(first.coefficients.iter().all(|&c| c == 0.0));
        let second = fits[1].as_ref().unwrap();
        assert!(!second.nonzero().is_empty());
    }

    #[test]
    fn small_penalty_approaches_the_maximum_likelihood_direction() {
        let (x, y) = logistic_data(600, &[1.0, -2.0], 8);
        let fits = fit_path(x.view(), y.view(), &[1e-4], &LassoConfig::default());
        let fit = fits[0].as_ref().unwrap();
        assert!(fit.coefficients[0] > 0.5 && fit.coefficients[0] < 1.6);
        assert!(fit.coefficients[1] < -1.3 && fit.coefficients[1] > -2.8);
    }

    #[test]
    fn one_standard_error_rule_bounds_hold() {
        let (x, y) = logistic_data(200, &[1.2, -0.8, 0.0, 0.0, 0.5, 0.0], 21);
        let enc = continuous_encoding(6);
        let sel = select_features(x.view(), y.view(), &enc, &LassoConfig::default(), 3).unwrap();
        let min = &sel.path.points[sel.minimum_index];
        let chosen = &sel.path.points[sel.selected_index];
        assert!(chosen.mean_deviance >= min.mean_deviance);
        assert!(chosen.mean_deviance <= min.mean_deviance + min.std_error);
        assert!(chosen.lambda >= min.lambda);
        // No larger valid strength also satisfies the rule.
        for p in &sel.path.points[..sel.selected_index] {
            assert!(!p.is_valid() || p.mean_deviance > min.mean_deviance + min.std_error);
        }
        assert!(sel.selected_features.contains(&"x0".to_string()));
        assert!(sel.selected_features.contains(&"x1".to_string()));
    }

    #[test]
    fn selection_is_deterministic_for_a_seed() {
        let (x, y) = logistic_data(120, &[1.0, 0.0, -1.0, 0.0], 2);
        let enc = continuous_encoding(4);
        let a = select_features(x.view(), y.view(), &enc, &LassoConfig::default(), 77).unwrap();
        let b = select_features(x.view(), y.view(), &enc, &LassoConfig::default(), 77).unwrap();
        assert_eq!(a.path, b.path);
        assert_eq!(a.selected_features, b.selected_features);
    }

    #[test]
    fn a_failed_strength_does_not_stop_the_path() {
        let (x, y) = logistic_data(200, &[2.0, 0.0], 12);
        let xs = Standardizer::fit(x.view()).transform(x.view());
        let top = lambda_max(xs.view(), y.view());
        // One IRLS iteration only converges where every coefficient stays at zero.
        let config = LassoConfig {
            max_iterations: 1,
            ..LassoConfig::default()
        };
        let fits = fit_path(x.view(), y.view(), &[top * 10.0, 1e-3, top * 5.0], &config);
        assert!(fits[0].as_ref().is_ok_and(|f| f.nonzero().is_empty()));
        assert!(matches!(
            fits[1],
            Err(LassoError::DidNotConverge { iterations: 1, .. })
        ));
        assert!(fits[2].as_ref().is_ok_and(|f| f.nonzero().is_empty()));
    }

    fn point(lambda: f64, mean_deviance: f64, std_error: f64, failed: bool) -> PathPoint {
        let fit = PenalizedFit {
            lambda,
            intercept: 0.0,
            coefficients: Array1::zeros(1),
            iterations: 3,
        };
        let failures = if failed {
            vec![PathFailure {
                fold: Some(2),
                error: LassoError::DidNotConverge {
                    lambda,
                    iterations: 100,
                },
            }]
        } else {
            Vec::new()
        };
        PathPoint {
            lambda,
            mean_deviance,
            std_error,
            n_nonzero: 0,
            fit: Some(fit),
            failures,
        }
    }

    #[test]
    fn failed_strengths_are_left_out_of_the_comparison() {
        // The failed strengths carry deviances that would otherwise win.
        let path = RegularizationPath {
            points: vec![
                point(1.0, 0.50, 0.01, true),
                point(0.5, 1.30, 0.02, false),
                point(0.25, 1.21, 0.02, false),
                point(0.125, 0.10, 0.01, true),
                point(0.0625, 1.20, 0.02, false),
            ],
            fold_assignment: vec![0, 1, 2, 0, 1, 2],
        };
        assert!(!path.points[0].is_valid());
        assert!(!path.points[3].is_valid());
        assert_eq!(path.minimum_index(), Some(4));
        // 1.21 <= 1.20 + 0.02; 1.30 is not.
        assert_eq!(path.one_standard_error_index(), Some(2));
        assert_eq!(path.failures().count(), 2);
        let lambdas: Vec<f64> = path.failures().map(|(lambda, _)| lambda).collect();
        assert_eq!(lambdas, vec![1.0, 0.125]);
    }

    #[test]
    fn a_path_with_no_valid_strength_has_no_selection() {
        let path = RegularizationPath {
            points: vec![point(1.0, 0.5, 0.1, true), point(0.5, 0.4, 0.1, true)],
            fold_assignment: vec![0, 1],
        };
        assert_eq!(path.minimum_index(), None);
        assert_eq!(path.one_standard_error_index(), None);
    }

    #[test]
    fn perfectly_predictive_feature_is_the_only_one_kept() {
        let n = 100;
        let mut rng = StdRng::seed_from_u64(31);
        let mut x = Array2::zeros((n, 10));
        let y = Array1::from_shape_fn(n, |i| (i % 2) as f64);
        for i in 0..n {
            x[(i, 0)] = y[i];
            for j in 1..10 {
                x[(i, j)] = rng.sample::<f64, _>(StandardNormal);
            }
        }
        let enc = continuous_encoding(10);
        let sel = select_features(x.view(), y.view(), &enc, &LassoConfig::default(), 5).unwrap();
        assert_eq!(sel.selected_features, vec!["x0".to_string()]);
    }
}
