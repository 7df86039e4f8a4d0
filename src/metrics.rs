// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for crm-sync.
//!
//! Uses the `metrics` crate facade; the host process picks the exporter
//! (Prometheus, OTEL, etc.).
//!
//! # Metric Naming Convention
//! - `crm_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `entity`: contact, order, tag, subscription
//! - `outcome`: ok, error
//! - `status`: completed, failed

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// One gated call to the source API (all attempts included)
pub fn record_source_request(entity: &str, outcome: &str) {
    counter!(
        "crm_sync_source_requests_total",
        "entity" => entity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Time a caller spent waiting on the rate window or spacing rule
pub fn record_gate_wait(wait: Duration) {
    histogram!("crm_sync_gate_wait_seconds").record(wait.as_secs_f64());
}

pub fn record_retry(operation: &str) {
    counter!("crm_sync_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Rows in one upsert batch
pub fn record_batch(entity: &str, rows: usize) {
    histogram!("crm_sync_batch_rows", "entity" => entity.to_string()).record(rows as f64);
}

pub fn record_batch_failure(entity: &str) {
    counter!("crm_sync_batch_failures_total", "entity" => entity.to_string()).increment(1);
}

/// A finished run and how long it took
pub fn record_run(status: &str, duration: Duration) {
    counter!("crm_sync_runs_total", "status" => status.to_string()).increment(1);
    histogram!("crm_sync_run_seconds", "status" => status.to_string()).record(duration.as_secs_f64());
}

pub fn record_conflict(entity: &str) {
    counter!("crm_sync_conflicts_total", "entity" => entity.to_string()).increment(1);
}

pub fn set_pending_conflicts(count: u64) {
    gauge!("crm_sync_pending_conflicts").set(count as f64);
}

pub fn record_cache_invalidation(keys: usize) {
    counter!("crm_sync_cache_keys_invalidated_total").increment(keys as u64);
}

pub fn record_cache_lookup(hit: bool) {
    counter!(
        "crm_sync_cache_lookups_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// RAII timer for one entity pass of a run
pub struct EntityTimer {
    entity: &'static str,
    start: Instant,
}

impl EntityTimer {
    #[must_use]
    pub fn new(entity: &'static str) -> Self {
        Self { entity, start: Instant::now() }
    }
}

impl Drop for EntityTimer {
    fn drop(&mut self) {
        histogram!("crm_sync_entity_pass_seconds", "entity" => self.entity)
            .record(self.start.elapsed().as_secs_f64());
    }
}
