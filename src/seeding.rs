//! Seed derivation for every randomized step of the pipeline.
//!
//! There is no advancing global generator. Each consumer asks for a generator
//! keyed by `(global seed, stream, index)`, so a fold or a bootstrap resample
//! draws the same numbers no matter which thread runs it or in what order.

use rand::SeedableRng;
use rand::rngs::StdRng;

/// Independent random streams used by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SeedStream {
    /// Stratified training/validation/testing split.
    Partition,
    /// Fold assignment of the outer loop in nested validation.
    OuterFolds,
    /// Seed handed to the pipeline refit inside one outer fold.
    NestedFold,
    /// Fold assignment for the selector's cross-validated path.
    SelectorFolds,
    /// Seed for one model type's top-level pipeline.
    ModelType,
    /// One bootstrap resample of the metric engine.
    Bootstrap,
    /// Seed for the metric engine on one partition or fold.
    Evaluation,
}

impl SeedStream {
    fn tag(self) -> u64 {
        match self {
            SeedStream::Partition => 0x5041_5254,
            SeedStream::OuterFolds => 0x4f55_5445,
            SeedStream::NestedFold => 0x4e45_5354,
            SeedStream::SelectorFolds => 0x5345_4c46,
            SeedStream::ModelType => 0x4d4f_4445,
            SeedStream::Bootstrap => 0x424f_4f54,
            SeedStream::Evaluation => 0x4556_414c,
        }
    }
}

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Derives the seed for `index` within `stream`, starting from `global`.
pub fn derive_seed(global: u64, stream: SeedStream, index: u64) -> u64 {
    let mixed = splitmix64(global ^ splitmix64(stream.tag()));
    splitmix64(mixed ^ splitmix64(index.wrapping_add(1)))
}

/// A generator positioned at the start of `(global, stream, index)`.
pub fn rng_for(global: u64, stream: SeedStream, index: u64) -> StdRng {
    StdRng::seed_from_u64(derive_seed(global, stream, index))
}
