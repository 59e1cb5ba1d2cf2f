//! Stratified k-fold assignment shared by the selector's cross-validation and
//! the outer loop of nested validation.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FoldError {
    #[error("k must be at least 2 (got {0})")]
    TooFewFolds(usize),
    #[error("k ({k}) exceeds the number of subjects ({n})")]
    TooManyFolds { k: usize, n: usize },
}

/// A fold id in `0..k` for every subject.
///
/// Each class is shuffled separately and dealt round-robin, so class counts
/// per fold differ by at most one. The assignment depends only on `labels`,
/// `k` and the generator state.
pub fn stratified_folds(labels: &[bool], k: usize, rng: &mut StdRng) -> Result<Vec<usize>, FoldError> {
    if k < 2 {
        return Err(FoldError::TooFewFolds(k));
    }
    if k > labels.len() {
        return Err(FoldError::TooManyFolds { k, n: labels.len() });
    }

    let mut assignment = vec![0usize; labels.len()];
    // Negatives continue the deal where positives stopped to balance fold sizes.
    let mut offset = 0;
    for class in [true, false] {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        members.shuffle(rng);
        for (pos, &i) in members.iter().enumerate() {
            assignment[i] = (offset + pos) % k;
        }
        offset = (offset + members.len()) % k;
    }
    Ok(assignment)
}

/// Training and held-out indices of fold `fold`.
pub fn split_fold(assignment: &[usize], fold: usize) -> (Vec<usize>, Vec<usize>) {
    let mut train = Vec::with_capacity(assignment.len());
    let mut test = Vec::new();
    for (i, &f) in assignment.iter().enumerate() {
        if f == fold {
            test.push(i);
        } else {
            train.push(i);
        }
    }
    (train, test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seeding::{SeedStream, rng_for};

    #[test]
    fn folds_are_stratified_and_balanced() {
        let labels: Vec<bool> = (0..103).map(|i| i % 4 == 0).collect();
        let mut rng = rng_for(11, SeedStream::SelectorFolds, 0);
        let folds = stratified_folds(&labels, 5, &mut rng).unwrap();
        let mut pos = [0usize; 5];
        let mut size = [0usize; 5];
        for (i, &f) in folds.iter().enumerate() {
            size[f] += 1;
            if labels[i] {
                pos[f] += 1;
            }
        }
        assert!(pos.iter().max().unwrap() - pos.iter().min().unwrap() <= 1);
        assert!(size.iter().max().unwrap() - size.iter().min().unwrap() <= 1);
    }

    #[test]
    fn split_fold_partitions_indices() {
        let assignment = vec![0, 1, 2, 0, 1, 2, 0];
        let (train, test) = split_fold(&assignment, 0);
        assert_eq!(test, vec![0, 3, 6]);
        assert_eq!(train, vec![1, 2, 4, 5]);
    }

    #[test]
    fn invalid_fold_counts_are_rejected() {
        let labels = vec![true, false, true];
        let mut rng = rng_for(0, SeedStream::OuterFolds, 0);
        assert_eq!(
            stratified_folds(&labels, 1, &mut rng),
            Err(FoldError::TooFewFolds(1))
        );
        assert_eq!(
            stratified_folds(&labels, 4, &mut rng),
            Err(FoldError::TooManyFolds { k: 4, n: 3 })
        );
    }
}
