//! # Model Fitter: unpenalized logistic regression
//!
//! Maximum likelihood by Newton-Raphson (equivalently IRLS) on the encoded
//! design with an intercept column. The normal equations are solved with a
//! faer Cholesky factorization of `XᵀWX`; a step that raises the deviance is
//! halved until it does not.
//!
//! Perfect or quasi-perfect separation is reported, never clipped. A finite
//! maximum-likelihood estimate is a fixed point of Newton's method, so its
//! steps shrink quadratically. Under separation the likelihood keeps rising
//! along a direction in coefficient space and the steps never shrink: the
//! slopes grow by a roughly constant amount per iteration. The fit stops with
//! [`FitError::Separation`] when the slopes have grown at every one of the
//! last [`DIVERGENCE_WINDOW`] iterations without the steps shrinking.
//! Extreme fitted probabilities on their own are not separation: a single
//! subject with an extreme covariate value can sit at a probability of
//! almost exactly 0 or 1 under a perfectly finite estimate.

use crate::data::Cohort;
use crate::encoding::{Encoding, EncodingError};
use crate::faer_ndarray::FaerCholesky;
use crate::feature_set::FeatureSet;
use crate::lasso::{binomial_deviance, sigmoid};
use crate::model::{FittedModel, Term};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Consecutive iterations of slope growth that identify a diverging fit.
pub const DIVERGENCE_WINDOW: usize = 5;

/// Minimum total slope growth over the window, on the linear-predictor scale
/// (coefficient times the column's standard deviation).
const DIVERGENCE_GROWTH: f64 = 1.0;

const MAX_STEP_HALVINGS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    pub max_iterations: usize,
    /// Relative deviance change that ends the iteration. The Newton step must
    /// also have shrunk below its square root on the linear-predictor scale.
    pub tolerance: f64,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-8,
        }
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("{0}")]
    Encoding(#[from] EncodingError),
    #[error(
        "Perfect separation: the coefficient for '{term}' diverges (still growing by {growth:.1} on the logit scale over the final iterations)."
    )]
    Separation { term: String, growth: f64 },
    #[error("The information matrix is singular at iteration {iteration}; the design is rank deficient.")]
    Singular { iteration: usize },
    #[error("Newton iterations did not converge within {iterations} iterations.")]
    DidNotConverge { iterations: usize },
    #[error("The fit needs both outcome classes; the {n} training subjects are all {class}.")]
    SingleClass { n: usize, class: &'static str },
    #[error("Non-finite values appeared in the fit at iteration {iteration}.")]
    NonFinite { iteration: usize },
}

/// The result of a maximum-likelihood fit on an already-encoded design.
#[derive(Debug, Clone)]
pub struct LogisticFit {
    /// Intercept first, then one coefficient per design column.
    pub beta: Array1<f64>,
    pub std_errors: Array1<f64>,
    pub deviance: f64,
    pub null_deviance: f64,
    pub iterations: usize,
}

fn with_intercept(x: ArrayView2<f64>) -> Array2<f64> {
    Array2::from_shape_fn((x.nrows(), x.ncols() + 1), |(i, j)| {
        if j == 0 { 1.0 } else { x[(i, j - 1)] }
    })
}

/// `p(1 - p)` without cancellation when `p` rounds to 1.
fn binomial_weight(eta: f64) -> f64 {
    sigmoid(eta) * sigmoid(-eta)
}

/// `y - p` without cancellation when `p` rounds to 0 or 1.
fn residual(y: f64, eta: f64) -> f64 {
    if y == 1.0 { sigmoid(-eta) } else { -sigmoid(eta) }
}

/// Information matrix `XᵀWX` and score `Xᵀ(y - p)` at `eta`.
fn information_and_score(
    design: &Array2<f64>,
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
) -> (Array2<f64>, Array1<f64>) {
    let weights = eta.mapv(binomial_weight);
    let weighted = design * &weights.view().insert_axis(Axis(1));
    let information = design.t().dot(&weighted);
    let residuals = Array1::from_shape_fn(y.len(), |i| residual(y[i], eta[i]));
    let score = design.t().dot(&residuals);
    (information, score)
}

/// Slope coefficients rescaled to the linear-predictor scale, one per
/// design column (the intercept is left out).
struct SlopeScale {
    scales: Vec<f64>,
}

impl SlopeScale {
    fn new(x: ArrayView2<f64>) -> Self {
        let scales = (0..x.ncols())
            .map(|j| {
                let sd = x.column(j).std(0.0);
                if sd.is_finite() && sd > 0.0 { sd } else { 1.0 }
            })
            .collect();
        Self { scales }
    }

    /// Largest scaled change of any coefficient, intercept included.
    fn step_size(&self, step: &Array1<f64>) -> f64 {
        self.scales
            .iter()
            .enumerate()
            .map(|(j, sd)| (step[j + 1] * sd).abs())
            .fold(step[0].abs(), f64::max)
    }

    /// Scaled L1 norm of the slopes.
    fn slope_norm(&self, beta: &Array1<f64>) -> f64 {
        self.scales
            .iter()
            .enumerate()
            .map(|(j, sd)| (beta[j + 1] * sd).abs())
            .sum()
    }

    /// The slope that grew most between `earlier` and `later`.
    fn fastest_growing(&self, earlier: &Array1<f64>, later: &Array1<f64>) -> Option<(usize, f64)> {
        self.scales
            .iter()
            .enumerate()
            .map(|(j, sd)| (j, (later[j + 1].abs() - earlier[j + 1].abs()) * sd))
            .filter(|(_, growth)| growth.is_finite())
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Coefficients accepted at each iteration, oldest first.
struct Trajectory {
    betas: Vec<Array1<f64>>,
}

impl Trajectory {
    /// Growth of the named term if the slopes have grown at every one of the
    /// last `DIVERGENCE_WINDOW` iterations by at least `DIVERGENCE_GROWTH`
    /// in total.
    fn divergence(&self, scale: &SlopeScale, terms: &[String]) -> Option<(String, f64)> {
        if self.betas.len() <= DIVERGENCE_WINDOW {
            return None;
        }
        let window = &self.betas[self.betas.len() - DIVERGENCE_WINDOW - 1..];
        let norms: Vec<f64> = window.iter().map(|b| scale.slope_norm(b)).collect();
        let growing = norms.windows(2).all(|w| w[1] > w[0]);
        let total = norms[norms.len() - 1] - norms[0];
        if !growing || total.is_nan() || total < DIVERGENCE_GROWTH {
            return None;
        }
        let (j, growth) = scale.fastest_growing(&window[0], &window[window.len() - 1])?;
        let term = terms.get(j).cloned().unwrap_or_else(|| format!("column {j}"));
        Some((term, growth))
    }
}

fn separation(term: String, growth: f64) -> FitError {
    log::warn!("Separation detected: '{term}' diverges (grew by {growth:.2} on the logit scale).");
    FitError::Separation { term, growth }
}

/// Fits `logit P(y=1) = β₀ + xβ` by Newton-Raphson with step-halving.
///
/// `terms` names the columns of `x` for error reporting.
pub fn fit_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    terms: &[String],
    config: &FitterConfig,
) -> Result<LogisticFit, FitError> {
    let n = y.len();
    let positives = y.iter().filter(|&&v| v == 1.0).count();
    if positives == 0 || positives == n {
        return Err(FitError::SingleClass {
            n,
            class: if positives == 0 { "benign" } else { "malignant" },
        });
    }

    let design = with_intercept(x);
    let k = design.ncols();
    let scale = SlopeScale::new(x);
    let step_tolerance = config.tolerance.sqrt();
    let ybar = positives as f64 / n as f64;
    let null_deviance = binomial_deviance(Array1::from_elem(n, ybar).view(), y);

    let mut beta = Array1::zeros(k);
    beta[0] = (ybar / (1.0 - ybar)).ln();
    let mut eta = design.dot(&beta);
    let mut deviance = null_deviance;
    let mut trajectory = Trajectory {
        betas: vec![beta.clone()],
    };

    for iteration in 1..=config.max_iterations {
        let (information, score) = information_and_score(&design, y, &eta);
        let factor = match information.cholesky(Side::Lower) {
            Ok(factor) => factor,
            // Vanishing information along a direction the slopes are running
            // off in is separation, not rank deficiency.
            Err(_) => {
                return Err(match trajectory.divergence(&scale, terms) {
                    Some((term, growth)) => separation(term, growth),
                    None => FitError::Singular { iteration },
                });
            }
        };
        let step = factor.solve_vec(&score);
        if step.iter().any(|v| !v.is_finite()) {
            return Err(FitError::NonFinite { iteration });
        }
        if scale.step_size(&step) < step_tolerance {
            return finish(&design, y, beta, deviance, null_deviance, iteration);
        }

        let mut step_scale = 1.0;
        let mut accepted = None;
        for _ in 0..=MAX_STEP_HALVINGS {
            let candidate = &beta + &(&step * step_scale);
            let candidate_eta = design.dot(&candidate);
            let candidate_dev = binomial_deviance(candidate_eta.mapv(sigmoid).view(), y);
            if candidate_dev.is_finite() && candidate_dev <= deviance * (1.0 + 1e-12) {
                accepted = Some((candidate, candidate_eta, candidate_dev, step_scale));
                break;
            }
            step_scale *= 0.5;
        }
        let Some((candidate, candidate_eta, candidate_dev, step_scale)) = accepted else {
            if let Some((term, growth)) = trajectory.divergence(&scale, terms) {
                return Err(separation(term, growth));
            }
            // No descent direction left: the current point is the optimum.
            log::debug!("Step-halving exhausted at iteration {iteration}; accepting current fit.");
            return finish(&design, y, beta, deviance, null_deviance, iteration);
        };

        let change = (deviance - candidate_dev).abs() / (candidate_dev.abs() + 0.1);
        let taken = scale.step_size(&step) * step_scale;
        beta = candidate;
        eta = candidate_eta;
        deviance = candidate_dev;
        trajectory.betas.push(beta.clone());
        log::trace!(
            "Newton iteration {iteration}: deviance {deviance:.6}, change {change:.3e}, step {taken:.3e}"
        );

        if change < config.tolerance {
            if taken < step_tolerance {
                return finish(&design, y, beta, deviance, null_deviance, iteration);
            }
            // The deviance has stopped moving but the coefficients have not.
            if let Some((term, growth)) = trajectory.divergence(&scale, terms) {
                return Err(separation(term, growth));
            }
        }
    }

    match trajectory.divergence(&scale, terms) {
        Some((term, growth)) => Err(separation(term, growth)),
        None => Err(FitError::DidNotConverge {
            iterations: config.max_iterations,
        }),
    }
}

fn finish(
    design: &Array2<f64>,
    y: ArrayView1<f64>,
    beta: Array1<f64>,
    deviance: f64,
    null_deviance: f64,
    iterations: usize,
) -> Result<LogisticFit, FitError> {
    let eta = design.dot(&beta);
    let (information, _) = information_and_score(design, y, &eta);
    let factor = information
        .cholesky(Side::Lower)
        .map_err(|_| FitError::Singular {
            iteration: iterations,
        })?;
    let covariance = factor.inverse(design.ncols());
    let std_errors = covariance.diag().mapv(f64::sqrt);

    Ok(LogisticFit {
        beta,
        std_errors,
        deviance,
        null_deviance,
        iterations,
    })
}

/// Fits an unpenalized logistic model on the features of `features` using
/// the rows of `training`.
pub fn fit_model(
    training: &Cohort,
    features: &FeatureSet,
    config: &FitterConfig,
) -> Result<FittedModel, FitError> {
    let encoding = Encoding::for_features(training.schema(), &features.names)?;
    let x = encoding.design(training)?;
    let terms = encoding.terms();
    let fit = fit_logistic(x.view(), training.outcome(), &terms, config)?;

    let coefficients = fit.beta.slice(s![1..]);
    let std_errors = fit.std_errors.slice(s![1..]);
    let terms = encoding
        .columns
        .iter()
        .enumerate()
        .map(|(j, column)| Term {
            name: column.term.clone(),
            feature: column.feature.clone(),
            coefficient: coefficients[j],
            std_error: std_errors[j],
        })
        .collect();

    log::info!(
        "Fitted logistic model on {} subjects with {} terms ({} iterations, deviance {:.3} vs null {:.3}).",
        training.len(),
        encoding.len(),
        fit.iterations,
        fit.deviance,
        fit.null_deviance
    );

    Ok(FittedModel {
        feature_set: features.clone(),
        intercept: fit.beta[0],
        intercept_std_error: fit.std_errors[0],
        deviance: fit.deviance,
        null_deviance: fit.null_deviance,
        iterations: fit.iterations,
        n_subjects: training.len(),
        encoding,
        terms,
    })
}
