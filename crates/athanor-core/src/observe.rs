//! Optional metrics instrumentation for the projection daemon.
//!
//! When the `observe` feature is enabled, key operations emit counters,
//! histograms, and gauges via the [`metrics`] crate. A downstream
//! application must install a metrics recorder (e.g. `metrics-exporter-prometheus`)
//! to collect the data.
//!
//! When the feature is **not** enabled every function in this module is a
//! zero-cost no-op.

use crate::types::ShardExecutionState;

/// Record one applied page (counter + events processed).
///
/// - `athanor.shard.pages_total` – counter with `shard` label
/// - `athanor.shard.events_processed_total` – counter with `shard` label
#[inline]
pub fn record_page_applied(shard: &str, events: u64) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("athanor.shard.pages_total", "shard" => shard.to_string()).increment(1);
        metrics::counter!("athanor.shard.events_processed_total", "shard" => shard.to_string())
            .increment(events);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (shard, events);
    }
}

/// Record a progress commit (counter + latency histogram).
///
/// - `athanor.shard.commits_total` – counter with `outcome` label
/// - `athanor.shard.commit_duration_seconds` – histogram
#[inline]
pub fn record_commit(duration: std::time::Duration, success: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if success { "ok" } else { "fail" };
        metrics::counter!("athanor.shard.commits_total", "outcome" => outcome).increment(1);
        metrics::histogram!("athanor.shard.commit_duration_seconds")
            .record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, success);
    }
}

/// Set the published high-water mark gauge.
///
/// - `athanor.high_water.mark` – gauge
/// - `athanor.high_water.stale_total` – counter, incremented when a gap is skipped
#[inline]
pub fn record_high_water(mark: u64, skipped_gap: bool) {
    #[cfg(feature = "observe")]
    {
        metrics::gauge!("athanor.high_water.mark").set(mark as f64);
        if skipped_gap {
            metrics::counter!("athanor.high_water.stale_total").increment(1);
        }
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (mark, skipped_gap);
    }
}

/// Record a dead-lettered event.
///
/// - `athanor.shard.dead_letters_total` – counter with `shard` label
#[inline]
pub fn record_dead_letter(shard: &str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("athanor.shard.dead_letters_total", "shard" => shard.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = shard;
    }
}

/// Record a shard state transition.
///
/// - `athanor.shard.transitions_total` – counter with `shard` and `state` labels
#[inline]
pub fn record_shard_state(shard: &str, state: ShardExecutionState) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!(
            "athanor.shard.transitions_total",
            "shard" => shard.to_string(),
            "state" => state.to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (shard, state);
    }
}

/// Record gaining or losing shard-set ownership.
///
/// - `athanor.ownership.changes_total` – counter with `held` label
/// - `athanor.ownership.held` – gauge (1 while this node owns the shard set)
#[inline]
pub fn record_ownership_change(held: bool) {
    #[cfg(feature = "observe")]
    {
        let label = if held { "acquired" } else { "lost" };
        metrics::counter!("athanor.ownership.changes_total", "held" => label).increment(1);
        metrics::gauge!("athanor.ownership.held").set(if held { 1.0 } else { 0.0 });
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = held;
    }
}
