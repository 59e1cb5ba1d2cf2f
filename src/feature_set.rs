use serde::{Deserialize, Serialize};
use std::fmt;

/// The screen that produced a feature list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStage {
    PostCorrelation,
    PostVif,
    PostLasso,
}

/// The rows a feature list was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum DataOrigin {
    Training,
    /// The inner training subset of an outer cross-validation fold.
    InnerTraining { fold: usize },
}

impl DataOrigin {
    pub fn fold(self) -> Option<usize> {
        match self {
            DataOrigin::Training => None,
            DataOrigin::InnerTraining { fold } => Some(fold),
        }
    }

    /// Partition label used in error contexts and logs.
    pub fn label(self) -> String {
        match self {
            DataOrigin::Training => "training".to_string(),
            DataOrigin::InnerTraining { fold } => format!("training/outer-fold-{fold}"),
        }
    }
}

impl fmt::Display for DataOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// An ordered list of feature names tagged with how and where it was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub names: Vec<String>,
    pub stage: SelectionStage,
    #[serde(flatten)]
    pub origin: DataOrigin,
}

impl FeatureSet {
    pub fn new(names: Vec<String>, stage: SelectionStage, origin: DataOrigin) -> Self {
        Self {
            names,
            stage,
            origin,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_labels_name_the_outer_fold() {
        assert_eq!(DataOrigin::Training.label(), "training");
        assert_eq!(
            DataOrigin::InnerTraining { fold: 2 }.label(),
            "training/outer-fold-2"
        );
        assert_eq!(DataOrigin::InnerTraining { fold: 2 }.fold(), Some(2));
    }

    #[test]
    fn feature_set_round_trips_through_toml() {
        let set = FeatureSet::new(
            vec!["diameter".into(), "margin".into()],
            SelectionStage::PostLasso,
            DataOrigin::InnerTraining { fold: 4 },
        );
        let text = toml::to_string(&set).unwrap();
        let back: FeatureSet = toml::from_str(&text).unwrap();
        assert_eq!(back, set);
        assert!(back.contains("margin"));
    }
}
