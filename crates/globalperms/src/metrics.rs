//! Permission lookup metrics.
//!
//! Cache counters live in `globalperms_cache::metrics`; this module covers
//! shard queries and invalidation.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const SHARD_FAILURES_TOTAL: &str = "globalperms_shard_failures_total";
    pub const INVALIDATIONS_TOTAL: &str = "globalperms_invalidations_total";
}

/// Record a shard that could not contribute to a resolution.
pub fn record_shard_failure(shard: &str) {
    counter!(names::SHARD_FAILURES_TOTAL, "shard" => shard.to_string()).increment(1);
}

/// Record an invalidation, labelled by outcome (`ok` or `error`).
pub fn record_invalidation(outcome: &'static str) {
    counter!(names::INVALIDATIONS_TOTAL, "outcome" => outcome).increment(1);
}
