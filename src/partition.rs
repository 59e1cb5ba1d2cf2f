//! Stratified training/validation/testing split.
//!
//! The split is made once per run. Each outcome class is shuffled with the
//! partition stream of the run seed and cut at the configured ratios, so every
//! partition inherits the cohort's prevalence up to rounding.

use crate::seeding::{SeedStream, rng_for};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const RATIO_SUM_TOLERANCE: f64 = 1e-6;

/// Target fractions of the cohort in each partition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitRatios {
    pub training: f64,
    pub validation: f64,
    pub testing: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            training: 0.70,
            validation: 0.14,
            testing: 0.16,
        }
    }
}

impl SplitRatios {
    pub fn validate(&self) -> Result<(), PartitionError> {
        let parts = [self.training, self.validation, self.testing];
        if parts.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            return Err(PartitionError::InvalidRatios(*self));
        }
        if (parts.iter().sum::<f64>() - 1.0).abs() > RATIO_SUM_TOLERANCE {
            return Err(PartitionError::InvalidRatios(*self));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionName {
    Training,
    Validation,
    Testing,
}

impl PartitionName {
    pub const ALL: [PartitionName; 3] = [
        PartitionName::Training,
        PartitionName::Validation,
        PartitionName::Testing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PartitionName::Training => "training",
            PartitionName::Validation => "validation",
            PartitionName::Testing => "testing",
        }
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row indices of each partition, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitions {
    pub training: Vec<usize>,
    pub validation: Vec<usize>,
    pub testing: Vec<usize>,
}

impl Partitions {
    pub fn get(&self, name: PartitionName) -> &[usize] {
        match name {
            PartitionName::Training => &self.training,
            PartitionName::Validation => &self.validation,
            PartitionName::Testing => &self.testing,
        }
    }

    /// Partition membership of every row of a cohort of `n` subjects.
    pub fn assignment(&self, n: usize) -> Vec<Option<PartitionName>> {
        let mut out = vec![None; n];
        for name in PartitionName::ALL {
            for &i in self.get(name) {
                if i < n {
                    out[i] = Some(name);
                }
            }
        }
        out
    }
}

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error(
        "Split ratios must be positive and sum to 1 (got training={:.3}, validation={:.3}, testing={:.3}).",
        .0.training, .0.validation, .0.testing
    )]
    InvalidRatios(SplitRatios),
    #[error(
        "The cohort is too small to stratify: the {partition} partition would receive no {class} subjects ({available} available)."
    )]
    InsufficientClass {
        partition: PartitionName,
        class: &'static str,
        available: usize,
    },
}

/// Splits the subjects with outcome `labels` into three stratified partitions.
pub fn partition_cohort(
    labels: &[bool],
    ratios: &SplitRatios,
    seed: u64,
) -> Result<Partitions, PartitionError> {
    ratios.validate()?;
    let mut rng = rng_for(seed, SeedStream::Partition, 0);

    let mut partitions = Partitions {
        training: Vec::new(),
        validation: Vec::new(),
        testing: Vec::new(),
    };

    for (class, class_name) in [(true, "malignant"), (false, "benign")] {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|&(_, &l)| l == class)
            .map(|(i, _)| i)
            .collect();
        members.shuffle(&mut rng);

        let counts = allocate(members.len(), ratios);
        for (name, &count) in PartitionName::ALL.iter().zip(counts.iter()) {
            if count == 0 {
                return Err(PartitionError::InsufficientClass {
                    partition: *name,
                    class: class_name,
                    available: members.len(),
                });
            }
        }
        let (train, rest) = members.split_at(counts[0]);
        let (valid, test) = rest.split_at(counts[1]);
        partitions.training.extend_from_slice(train);
        partitions.validation.extend_from_slice(valid);
        partitions.testing.extend_from_slice(test);
    }

    partitions.training.sort_unstable();
    partitions.validation.sort_unstable();
    partitions.testing.sort_unstable();

    log::info!(
        "Partitioned {} subjects: {} training, {} validation, {} testing.",
        labels.len(),
        partitions.training.len(),
        partitions.validation.len(),
        partitions.testing.len()
    );
    Ok(partitions)
}

/// Rounds each class to training/validation counts; testing takes the rest.
fn allocate(n: usize, ratios: &SplitRatios) -> [usize; 3] {
    let train = ((n as f64) * ratios.training).round() as usize;
    let train = train.min(n);
    let valid = (((n as f64) * ratios.validation).round() as usize).min(n - train);
    [train, valid, n - train - valid]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn balanced_labels(n: usize) -> Vec<bool> {
        (0..n).map(|i| i % 2 == 0).collect()
    }

    #[test]
    fn same_seed_reproduces_membership() {
        let labels = balanced_labels(200);
        for seed in [0_u64, 1, 42, 9_999] {
            let a = partition_cohort(&labels, &SplitRatios::default(), seed).unwrap();
            let b = partition_cohort(&labels, &SplitRatios::default(), seed).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn different_seeds_give_different_splits() {
        let labels = balanced_labels(200);
        let a = partition_cohort(&labels, &SplitRatios::default(), 1).unwrap();
        let b = partition_cohort(&labels, &SplitRatios::default(), 2).unwrap();
        assert_ne!(a.training, b.training);
    }

    #[test]
    fn partitions_are_disjoint_and_complete() {
        let labels: Vec<bool> = (0..157).map(|i| i % 3 == 0).collect();
        let parts = partition_cohort(&labels, &SplitRatios::default(), 7).unwrap();
        let mut seen = HashSet::new();
        for name in PartitionName::ALL {
            for &i in parts.get(name) {
                assert!(seen.insert(i), "subject {i} assigned twice");
            }
        }
        assert_eq!(seen.len(), labels.len());
        assert!(parts.assignment(labels.len()).iter().all(Option::is_some));
    }

    #[test]
    fn prevalence_is_preserved_within_rounding() {
        let labels: Vec<bool> = (0..500).map(|i| i % 5 == 0).collect();
        let parts = partition_cohort(&labels, &SplitRatios::default(), 3).unwrap();
        for name in PartitionName::ALL {
            let idx = parts.get(name);
            let pos = idx.iter().filter(|&&i| labels[i]).count() as f64;
            let prevalence = pos / idx.len() as f64;
            assert!((prevalence - 0.2).abs() < 0.02, "{name}: {prevalence}");
        }
        assert_eq!(parts.training.len(), 350);
    }

    #[test]
    fn too_few_positives_is_a_configuration_error() {
        let mut labels = vec![false; 60];
        labels[0] = true;
        labels[1] = true;
        let err = partition_cohort(&labels, &SplitRatios::default(), 5).unwrap_err();
        assert!(matches!(
            err,
            PartitionError::InsufficientClass {
                class: "malignant",
                ..
            }
        ));
    }

    #[test]
    fn ratios_must_sum_to_one() {
        let ratios = SplitRatios {
            training: 0.7,
            validation: 0.2,
            testing: 0.2,
        };
        assert!(matches!(
            partition_cohort(&balanced_labels(100), &ratios, 0),
            Err(PartitionError::InvalidRatios(_))
        ));
    }
}
