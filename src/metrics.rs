//! Observability surface (C8, §4.8).
//!
//! Counters use interior atomics/mutex so handlers can record through a
//! shared `&Metrics` without needing the broker's single write lock —
//! only the store and lease table require that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

const NEAR_CAPACITY_THRESHOLD: f64 = 0.90;
const AT_CAPACITY_THRESHOLD: f64 = 1.0;

/// Per-action, per-result operation counters and byte/expiry totals.
pub struct Metrics {
    operations: Mutex<HashMap<(&'static str, bool), u64>>,
    compressed_writes: AtomicU64,
    uncompressed_writes: AtomicU64,
    bytes_before: AtomicU64,
    bytes_after: AtomicU64,
    items_expired: AtomicU64,
    leases_expired: AtomicU64,
    total_requests: AtomicU64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            compressed_writes: AtomicU64::new(0),
            uncompressed_writes: AtomicU64::new(0),
            bytes_before: AtomicU64::new(0),
            bytes_after: AtomicU64::new(0),
            items_expired: AtomicU64::new(0),
            leases_expired: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    /// Record one handled request for `action`, split by success/error.
    pub fn record_operation(&self, action: &'static str, ok: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut operations = self.operations.lock().expect("metrics mutex poisoned");
        *operations.entry((action, ok)).or_insert(0) += 1;
    }

    pub fn record_compressed_write(&self, before: u64, after: u64) {
        self.compressed_writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_before.fetch_add(before, Ordering::Relaxed);
        self.bytes_after.fetch_add(after, Ordering::Relaxed);
    }

    pub fn record_uncompressed_write(&self, size: u64) {
        self.uncompressed_writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_before.fetch_add(size, Ordering::Relaxed);
        self.bytes_after.fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_items_expired(&self, count: u64) {
        self.items_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_leases_expired(&self, count: u64) {
        self.leases_expired.fetch_add(count, Ordering::Relaxed);
    }

    /// Capacity assessment shared by `stats` and `health` (§4.8).
    #[must_use]
    pub fn capacity(items: usize, max_items: usize) -> Value {
        let utilization = if max_items == 0 { 0.0 } else { items as f64 / max_items as f64 };
        let near_capacity = utilization >= NEAR_CAPACITY_THRESHOLD;
        let at_capacity = utilization >= AT_CAPACITY_THRESHOLD;
        let warning = if at_capacity {
            "at_capacity"
        } else if near_capacity {
            "near_capacity"
        } else {
            "ok"
        };
        json!({
            "items": items,
            "max_items": max_items,
            "utilization": utilization,
            "near_capacity": near_capacity,
            "at_capacity": at_capacity,
            "warning": warning,
        })
    }

    /// `stats` response body (§4.8).
    #[must_use]
    pub fn stats(
        &self,
        items: usize,
        max_items: usize,
        leases: usize,
        approx_bytes: u64,
        uptime_ms: i64,
    ) -> Value {
        json!({
            "items": items,
            "leases": leases,
            "capacity": Self::capacity(items, max_items),
            "memory": {
                "resident": approx_bytes + RESIDENT_OVERHEAD_BYTES,
                "heap": approx_bytes,
            },
            "uptime_ms": uptime_ms,
        })
    }

    /// `health` response body (§4.8). `ok`/`status` reflect `at_capacity`.
    #[must_use]
    pub fn health(
        &self,
        items: usize,
        max_items: usize,
        approx_bytes: u64,
        uptime_ms: i64,
        now_ms: i64,
        in_flight: u64,
        draining: bool,
    ) -> Value {
        let capacity = Self::capacity(items, max_items);
        let at_capacity = capacity["at_capacity"].as_bool().unwrap_or(false);
        json!({
            "ok": true,
            "status": if at_capacity { "degraded" } else { "healthy" },
            "uptime_ms": uptime_ms,
            "timestamp": now_ms,
            "capacity": capacity,
            "memory": {
                "resident": approx_bytes + RESIDENT_OVERHEAD_BYTES,
                "heap": approx_bytes,
            },
            "in_flight": in_flight,
            "draining": draining,
        })
    }

    /// Prometheus text exposition format (§4.8).
    #[must_use]
    pub fn prometheus(
        &self,
        items: usize,
        max_items: usize,
        leases: usize,
        in_flight: u64,
        draining: bool,
        total_inflight_accounted: u64,
    ) -> String {
        let mut out = String::new();

        out.push_str("# HELP broker_operations_total Requests handled per action and result.\n");
        out.push_str("# TYPE broker_operations_total counter\n");
        let operations = self.operations.lock().expect("metrics mutex poisoned");
        let mut entries: Vec<_> = operations.iter().collect();
        entries.sort_by_key(|((action, ok), _)| (*action, *ok));
        for ((action, ok), count) in entries {
            let result = if *ok { "success" } else { "error" };
            out.push_str(&format!(
                "broker_operations_total{{action=\"{action}\",result=\"{result}\"}} {count}\n"
            ));
        }
        drop(operations);

        out.push_str("# HELP broker_compression_writes_total Writes split by compressed flag.\n");
        out.push_str("# TYPE broker_compression_writes_total counter\n");
        out.push_str(&format!(
            "broker_compression_writes_total{{compressed=\"true\"}} {}\n",
            self.compressed_writes.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "broker_compression_writes_total{{compressed=\"false\"}} {}\n",
            self.uncompressed_writes.load(Ordering::Relaxed)
        ));

        let before = self.bytes_before.load(Ordering::Relaxed);
        let after = self.bytes_after.load(Ordering::Relaxed);
        let ratio = if before == 0 { 1.0 } else { after as f64 / before as f64 };
        out.push_str("# HELP broker_bytes_before_total Bytes before client-side compression.\n");
        out.push_str("# TYPE broker_bytes_before_total counter\n");
        out.push_str(&format!("broker_bytes_before_total {before}\n"));
        out.push_str("# HELP broker_bytes_after_total Bytes after client-side compression.\n");
        out.push_str("# TYPE broker_bytes_after_total counter\n");
        out.push_str(&format!("broker_bytes_after_total {after}\n"));
        out.push_str("# HELP broker_compression_ratio Current aggregate compression ratio.\n");
        out.push_str("# TYPE broker_compression_ratio gauge\n");
        out.push_str(&format!("broker_compression_ratio {ratio}\n"));

        out.push_str("# HELP broker_items_expired_total Value entries removed by TTL.\n");
        out.push_str("# TYPE broker_items_expired_total counter\n");
        out.push_str(&format!("broker_items_expired_total {}\n", self.items_expired.load(Ordering::Relaxed)));
        out.push_str("# HELP broker_leases_expired_total Lease entries removed by TTL.\n");
        out.push_str("# TYPE broker_leases_expired_total counter\n");
        out.push_str(&format!("broker_leases_expired_total {}\n", self.leases_expired.load(Ordering::Relaxed)));

        out.push_str("# HELP broker_requests_total Total requests handled.\n");
        out.push_str("# TYPE broker_requests_total counter\n");
        out.push_str(&format!("broker_requests_total {}\n", total_inflight_accounted));
        out.push_str("# HELP broker_in_flight Requests currently being handled.\n");
        out.push_str("# TYPE broker_in_flight gauge\n");
        out.push_str(&format!("broker_in_flight {in_flight}\n"));
        out.push_str("# HELP broker_draining Whether the broker is draining (1) or not (0).\n");
        out.push_str("# TYPE broker_draining gauge\n");
        out.push_str(&format!("broker_draining {}\n", u8::from(draining)));

        out.push_str("# HELP broker_capacity_items Non-expired value entries.\n");
        out.push_str("# TYPE broker_capacity_items gauge\n");
        out.push_str(&format!("broker_capacity_items {items}\n"));
        out.push_str("# HELP broker_capacity_max_items Configured item cap.\n");
        out.push_str("# TYPE broker_capacity_max_items gauge\n");
        out.push_str(&format!("broker_capacity_max_items {max_items}\n"));
        out.push_str("# HELP broker_capacity_utilization Fraction of max_items in use.\n");
        out.push_str("# TYPE broker_capacity_utilization gauge\n");
        let utilization = if max_items == 0 { 0.0 } else { items as f64 / max_items as f64 };
        out.push_str(&format!("broker_capacity_utilization {utilization}\n"));
        out.push_str("# HELP broker_leases Non-expired lease entries.\n");
        out.push_str("# TYPE broker_leases gauge\n");
        out.push_str(&format!("broker_leases {leases}\n"));

        out
    }

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed overhead added to the approximate heap estimate to stand in
/// for the runtime's own baseline footprint.
const RESIDENT_OVERHEAD_BYTES: u64 = 2 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_thresholds() {
        let low = Metrics::capacity(1, 100);
        assert_eq!(low["warning"], "ok");
        let near = Metrics::capacity(90, 100);
        assert_eq!(near["warning"], "near_capacity");
        let at = Metrics::capacity(100, 100);
        assert_eq!(at["warning"], "at_capacity");
    }

    #[test]
    fn success_error_counters_sum_to_total() {
        let metrics = Metrics::new();
        metrics.record_operation("get", true);
        metrics.record_operation("get", false);
        metrics.record_operation("set", true);
        assert_eq!(metrics.total_requests(), 3);
    }

    #[test]
    fn compression_ratio_defaults_to_one_with_no_writes() {
        let metrics = Metrics::new();
        let text = metrics.prometheus(0, 0, 0, 0, false, 0);
        assert!(text.contains("broker_compression_ratio 1"));
    }
}
