use std::collections::{HashMap, HashSet};

/// Identifier of an instrumented control-flow edge. Must fit in 56 bits.
pub type EdgeId = u64;

/// A bucketed `(edge, hit-frequency class)` pair: the unit of interestingness.
pub type Feature = u64;

/// Per-run edge execution counts, as returned by an executor.
pub type EdgeCounts = HashMap<EdgeId, u64>;

/// The set of features observed for one execution.
pub type FeatureSet = HashSet<Feature>;

/// Number of low bits of a [`Feature`] that hold the edge id.
pub const EDGE_BITS: u32 = 56;

/// Mask selecting the edge id from a [`Feature`].
pub const EDGE_MASK: u64 = (1 << EDGE_BITS) - 1;

/// Maps a hit count onto its logarithmic bucket.
///
/// Counts 1-3 keep their own bucket (0-2), then 4-7, 8-15, 16-31, 32-127 and
/// 128+ share buckets 3 through 7.
fn count_bucket(count: u64) -> u64 {
    match count {
        0..=3 => count.saturating_sub(1),
        4..=7 => 3,
        8..=15 => 4,
        16..=31 => 5,
        32..=127 => 6,
        _ => 7,
    }
}

/// Encodes an edge and its hit count as `(bucket << 56) | edge`.
///
/// A zero count means the edge did not run and must not be encoded; debug
/// builds assert on it, as they do on edge ids wider than 56 bits.
pub fn encode(edge: EdgeId, count: u64) -> Feature {
    debug_assert!(count > 0, "edge {edge} encoded with a zero hit count");
    debug_assert!(edge <= EDGE_MASK, "edge id {edge:#x} exceeds 56 bits");
    (count_bucket(count) << EDGE_BITS) | (edge & EDGE_MASK)
}

/// The edge a feature was derived from.
pub fn edge_of(feature: Feature) -> EdgeId {
    feature & EDGE_MASK
}

/// Turns a run's edge counts into its feature set. Zero counts are ignored.
pub fn features_from_edge_counts(edge_counts: &EdgeCounts) -> FeatureSet {
    edge_counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(edge, count)| encode(*edge, *count))
        .collect()
}
