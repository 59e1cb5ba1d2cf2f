//! # Collinearity Filter
//!
//! Two screens over the continuous features of a training table:
//!
//! 1. **Pairwise correlation.** Features are visited from strongest to weakest
//!    univariate association with the outcome (absolute point-biserial
//!    correlation; ties in lexical name order) and a feature is kept only if
//!    its absolute Pearson correlation with every feature kept so far is at
//!    most the threshold. For a single correlated pair this drops exactly the
//!    member with the weaker association.
//! 2. **Variance inflation.** VIFs are read off the diagonal of the inverse
//!    correlation matrix. The largest is dropped while it exceeds the
//!    threshold, and all VIFs are recomputed after every drop. A singular
//!    correlation matrix has no VIFs; the feature responsible is found by
//!    growing a Cholesky factor in lexical order, dropped without a value, and
//!    the loop continues.
//!
//! Categorical features are not screened and pass through unchanged. This
//! module sees only the table it is given; callers pass training rows only.

use crate::data::Cohort;
use crate::faer_ndarray::FaerCholesky;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Squared Cholesky pivots below this mark the correlation matrix singular.
/// The pivot equals 1 - R² of the feature on its predecessors, so this is a
/// VIF ceiling of 1e10.
const SINGULAR_PIVOT: f64 = 1e-10;

const ZERO_VARIANCE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollinearityConfig {
    /// Pairs with |r| above this are reduced to one feature.
    pub correlation_threshold: f64,
    /// Features are removed while any VIF exceeds this.
    pub vif_threshold: f64,
}

impl Default for CollinearityConfig {
    fn default() -> Self {
        Self {
            correlation_threshold: 0.7,
            vif_threshold: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    ZeroVariance,
    Correlated { partner: String, r: f64 },
    Vif { value: f64 },
    /// Dropped because the correlation matrix was singular; no VIF exists.
    Singular,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedFeature {
    pub name: String,
    #[serde(flatten)]
    pub reason: DropReason,
}

/// Feature lists after each screen, in pool order.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub after_correlation: Vec<String>,
    pub after_vif: Vec<String>,
    pub dropped: Vec<DroppedFeature>,
    /// VIF of every continuous feature that survived both screens.
    pub final_vif: Vec<(String, f64)>,
    /// Absolute correlation of each screened feature with the outcome.
    pub associations: Vec<(String, f64)>,
}

impl FilterOutcome {
    pub fn singular_drops(&self) -> impl Iterator<Item = &DroppedFeature> {
        self.dropped
            .iter()
            .filter(|d| matches!(d.reason, DropReason::Singular))
    }
}

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Feature '{0}' is not part of the cohort schema.")]
    UnknownFeature(String),
}

/// Pearson correlation, or `None` if either input is constant.
pub fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Option<f64> {
    let n = a.len();
    if n < 2 || b.len() != n {
        return None;
    }
    let ma = a.mean()?;
    let mb = b.mean()?;
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (dx, dy) = (x - ma, y - mb);
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    }
    let denom = (saa * sbb).sqrt();
    if denom <= ZERO_VARIANCE * n as f64 {
        return None;
    }
    Some((sab / denom).clamp(-1.0, 1.0))
}

/// Correlation matrix of the columns of `x`. Columns must be non-constant.
pub fn correlation_matrix(x: ArrayView2<f64>) -> Array2<f64> {
    let n = x.nrows() as f64;
    let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
    let mut z = &x - &means;
    for mut col in z.axis_iter_mut(Axis(1)) {
        let sd = (col.dot(&col) / n).sqrt();
        if sd > 0.0 {
            col /= sd;
        }
    }
    let mut r = z.t().dot(&z) / n;
    let m = r.nrows();
    for i in 0..m {
        r[(i, i)] = 1.0;
        for j in 0..i {
            let v = r[(i, j)].clamp(-1.0, 1.0);
            r[(i, j)] = v;
            r[(j, i)] = v;
        }
    }
    r
}

/// Outcome of a VIF computation over a set of columns.
#[derive(Debug, Clone, PartialEq)]
pub enum VifComputation {
    Values(Array1<f64>),
    /// The column at this position is a linear combination of earlier ones.
    Singular { offender: usize },
}

/// VIFs from the inverse correlation matrix. Columns are examined in the
/// given order when locating the offender of a singular matrix.
pub fn variance_inflation(x: ArrayView2<f64>) -> VifComputation {
    let m = x.ncols();
    if m == 0 {
        return VifComputation::Values(Array1::zeros(0));
    }
    if m == 1 {
        return VifComputation::Values(Array1::ones(1));
    }
    let r = correlation_matrix(x);
    if let Ok(factor) = r.cholesky(Side::Lower) {
        let pivots = factor.diag();
        if pivots.iter().all(|&d| d.is_finite() && d * d > SINGULAR_PIVOT) {
            let inv = factor.inverse(m);
            return VifComputation::Values(inv.diag().to_owned());
        }
    }
    VifComputation::Singular {
        offender: locate_singular_column(&r),
    }
}

fn locate_singular_column(r: &Array2<f64>) -> usize {
    let m = r.nrows();
    for k in 2..=m {
        let leading = r.slice(s![..k, ..k]);
        let ok = match leading.cholesky(Side::Lower) {
            Ok(factor) => factor
                .diag()
                .iter()
                .all(|&d| d.is_finite() && d * d > SINGULAR_PIVOT),
            Err(_) => false,
        };
        if !ok {
            return k - 1;
        }
    }
    m - 1
}

fn by_association_then_name(a: &(String, f64), b: &(String, f64)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// Screens the continuous members of `pool` for pairwise correlation and
/// variance inflation using the rows of `training`.
pub fn filter_collinear(
    training: &Cohort,
    pool: &[String],
    config: &CollinearityConfig,
) -> Result<FilterOutcome, FilterError> {
    let schema = training.schema();
    let mut continuous = Vec::new();
    for name in pool {
        let spec = schema
            .get(name)
            .ok_or_else(|| FilterError::UnknownFeature(name.clone()))?;
        if spec.is_continuous() {
            continuous.push(name.clone());
        }
    }

    let y = training.outcome();
    let mut dropped = Vec::new();
    let mut associations = Vec::new();
    for name in &continuous {
        let column = training
            .column(name)
            .ok_or_else(|| FilterError::UnknownFeature(name.clone()))?;
        let variance = column.var(0.0);
        if !(variance > ZERO_VARIANCE) {
            log::warn!("Dropping constant feature '{name}' before collinearity screening.");
            dropped.push(DroppedFeature {
                name: name.clone(),
                reason: DropReason::ZeroVariance,
            });
            continue;
        }
        let association = pearson(column, y).map(f64::abs).unwrap_or(0.0);
        associations.push((name.clone(), association));
    }

    // Step 1: pairwise correlation.
    let mut ranked = associations.clone();
    ranked.sort_by(by_association_then_name);
    let mut kept: Vec<String> = Vec::new();
    for (name, _) in &ranked {
        let column = training
            .column(name)
            .ok_or_else(|| FilterError::UnknownFeature(name.clone()))?;
        let mut conflict: Option<(String, f64)> = None;
        for other in &kept {
            let other_col = training
                .column(other)
                .ok_or_else(|| FilterError::UnknownFeature(other.clone()))?;
            if let Some(r) = pearson(column, other_col) {
                let worse = conflict.as_ref().is_none_or(|(_, best)| r.abs() > best.abs());
                if r.abs() > config.correlation_threshold && worse {
                    conflict = Some((other.clone(), r));
                }
            }
        }
        match conflict {
            Some((partner, r)) => {
                log::debug!("Dropping '{name}': |r| = {:.3} with '{partner}'.", r.abs());
                dropped.push(DroppedFeature {
                    name: name.clone(),
                    reason: DropReason::Correlated { partner, r },
                });
            }
            None => kept.push(name.clone()),
        }
    }

    let after_correlation: Vec<String> = pool
        .iter()
        .filter(|name| !dropped.iter().any(|d| &d.name == *name))
        .cloned()
        .collect();

    // Step 2: variance inflation, scanned in lexical order.
    let mut current = kept;
    current.sort();
    let final_vif = loop {
        let indices: Vec<usize> = current
            .iter()
            .filter_map(|name| schema.index_of(name))
            .collect();
        let x = training.features().select(Axis(1), &indices);
        match variance_inflation(x.view()) {
            VifComputation::Singular { offender } => {
                let name = current.remove(offender);
                log::warn!(
                    "Correlation matrix is singular; dropping '{name}' without a VIF value."
                );
                dropped.push(DroppedFeature {
                    name,
                    reason: DropReason::Singular,
                });
            }
            VifComputation::Values(vifs) => {
                // Largest VIF; on ties the lexically later feature goes.
                let worst = vifs
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1).then(a.0.cmp(&b.0)));
                match worst {
                    Some((idx, &value)) if value > config.vif_threshold => {
                        let name = current.remove(idx);
                        log::debug!("Dropping '{name}': VIF = {value:.2}.");
                        dropped.push(DroppedFeature {
                            name,
                            reason: DropReason::Vif { value },
                        });
                    }
                    _ => {
                        break current
                            .iter()
                            .cloned()
                            .zip(vifs.iter().copied())
                            .collect::<Vec<_>>();
                    }
                }
            }
        }
    };

    let after_vif: Vec<String> = after_correlation
        .iter()
        .filter(|name| !dropped.iter().any(|d| &d.name == *name))
        .cloned()
        .collect();

    log::info!(
        "Collinearity filter: {} features in, {} after correlation screen, {} after VIF screen.",
        pool.len(),
        after_correlation.len(),
        after_vif.len()
    );

    Ok(FilterOutcome {
        after_correlation,
        after_vif,
        dropped,
        final_vif,
        associations,
    })
}
