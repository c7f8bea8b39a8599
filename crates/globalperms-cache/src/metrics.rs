//! Cache metrics.
//!
//! Counters are recorded through the `metrics` facade; the host decides
//! which exporter (if any) is installed.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "globalperms_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "globalperms_cache_misses_total";
    pub const CACHE_REFILLS_TOTAL: &str = "globalperms_cache_refills_total";
    pub const CACHE_DEGRADED_TOTAL: &str = "globalperms_cache_degraded_total";
}

/// Record a cache hit. `state` is `fresh`, `stale` or `refilled`.
pub fn record_cache_hit(state: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "state" => state).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record a refill, labelled by outcome (`ok`, `error` or `discarded`).
pub fn record_refill(outcome: &'static str) {
    counter!(names::CACHE_REFILLS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a computation that bypassed the cache.
pub fn record_degraded(reason: &'static str) {
    counter!(names::CACHE_DEGRADED_TOTAL, "reason" => reason).increment(1);
}
