//! Shared broker state and request dispatch.
//!
//! The store, lease table, and metrics are single-writer: every mutating
//! operation runs with [`Inner`]'s mutex held, matching §5's concurrency
//! model. The mutex is a plain [`std::sync::Mutex`] — handlers never
//! `.await` while holding it, so there is no reason to pay for an async
//! one.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::error::BrokerError;
use crate::leases::Leases;
use crate::metrics::Metrics;
use crate::protocol::{failure, ok, success, Request};
use crate::store::Store;

struct Inner {
    store: Store,
    leases: Leases,
    metrics: Metrics,
}

/// The broker's full runtime state (§3 "Broker runtime state").
pub struct BrokerCore {
    pub config: Config,
    inner: Mutex<Inner>,
    pub started_at: i64,
    pub last_activity_at: AtomicI64,
    pub in_flight: AtomicU64,
    pub draining: AtomicBool,
    request_counter: AtomicU64,
}

/// Current wall-clock time in milliseconds, used for all TTL arithmetic.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl BrokerCore {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store = Store::new(config.require_ttl, config.default_ttl_ms, config.max_items, config.max_value_size);
        let leases = Leases::new(config.default_ttl_ms);
        let now = now_ms();
        Self {
            config,
            inner: Mutex::new(Inner { store, leases, metrics: Metrics::new() }),
            started_at: now,
            last_activity_at: AtomicI64::new(now),
            in_flight: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            request_counter: AtomicU64::new(0),
        }
    }

    /// Generate a correlation ID: wall-clock prefix, monotonic suffix.
    #[must_use]
    pub fn next_correlation_id(&self) -> String {
        let seq = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("{:x}-{:x}", now_ms(), seq)
    }

    pub fn touch_activity(&self, now: i64) {
        self.last_activity_at.store(now, Ordering::Relaxed);
    }

    /// Dispatch one already-authenticated request, returning the wire
    /// response and whether the handler considered it a success — the
    /// latter drives the per-action operation counter.
    pub fn dispatch(&self, request: &Request, now: i64) -> (Value, bool) {
        let action: &'static str = match request.action.as_str() {
            "get" => "get",
            "set" => "set",
            "del" => "del",
            "list" => "list",
            "ping" => "ping",
            "stats" => "stats",
            "health" => "health",
            "metrics" => "metrics",
            "lease" => "lease",
            "release" => "release",
            _ => "unknown",
        };

        let (response, result_ok) = self.handle(action, request, now);

        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.metrics.record_operation(action, result_ok);
        (response, result_ok)
    }

    fn handle(&self, action: &'static str, request: &Request, now: i64) -> (Value, bool) {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        match action {
            "get" => {
                let Some(key) = request.key.as_deref() else {
                    return (failure(BrokerError::NotFound), false);
                };
                match inner.store.get(key, now) {
                    Ok((value, compressed)) => {
                        let mut fields = Map::new();
                        fields.insert("value".to_string(), value);
                        fields.insert("compressed".to_string(), Value::Bool(compressed));
                        (success(fields), true)
                    }
                    Err(error) => (failure(error), false),
                }
            }
            "set" => {
                let Some(key) = request.key.clone() else {
                    return (failure(BrokerError::NotFound), false);
                };
                let value = request.value.clone().unwrap_or(Value::Null);
                let compressed = request.compressed.unwrap_or(false);
                let Inner { store, metrics, .. } = &mut *inner;
                let store_result = store.set(
                    key,
                    value,
                    request.ttl,
                    compressed,
                    request.before_size,
                    request.after_size,
                    now,
                    metrics,
                );
                match store_result {
                    Ok(()) => (ok(), true),
                    Err(error) => (failure(error), false),
                }
            }
            "del" => {
                if let Some(key) = request.key.as_deref() {
                    inner.store.del(key);
                }
                (ok(), true)
            }
            "list" => {
                let items = inner.store.list(now);
                let mut map = Map::new();
                for (key, expires_at) in items {
                    map.insert(key, json!({"expires": expires_at, "hasValue": true}));
                }
                let mut fields = Map::new();
                fields.insert("items".to_string(), Value::Object(map));
                (success(fields), true)
            }
            "ping" => {
                let mut fields = Map::new();
                fields.insert("pong".to_string(), json!(now));
                (success(fields), true)
            }
            "stats" => {
                let items = inner.store.non_expired_count(now);
                let leases = inner.leases.non_expired_count(now);
                let approx_bytes = inner.store.approximate_bytes(now);
                let uptime_ms = now.saturating_sub(self.started_at);
                let mut fields = Map::new();
                fields.insert(
                    "stats".to_string(),
                    inner.metrics.stats(items, self.config.max_items, leases, approx_bytes, uptime_ms),
                );
                (success(fields), true)
            }
            "health" => {
                let items = inner.store.non_expired_count(now);
                let approx_bytes = inner.store.approximate_bytes(now);
                let uptime_ms = now.saturating_sub(self.started_at);
                let in_flight = self.in_flight.load(Ordering::Relaxed);
                let draining = self.draining.load(Ordering::Relaxed);
                (
                    inner.metrics.health(items, self.config.max_items, approx_bytes, uptime_ms, now, in_flight, draining),
                    true,
                )
            }
            "metrics" => {
                let items = inner.store.non_expired_count(now);
                let leases = inner.leases.non_expired_count(now);
                let in_flight = self.in_flight.load(Ordering::Relaxed);
                let draining = self.draining.load(Ordering::Relaxed);
                let total = inner.metrics.total_requests();
                let text = inner.metrics.prometheus(items, self.config.max_items, leases, in_flight, draining, total);
                let mut fields = Map::new();
                fields.insert("metrics".to_string(), Value::String(text));
                fields.insert("format".to_string(), Value::String("prometheus".to_string()));
                (success(fields), true)
            }
            "lease" => {
                let (Some(key), Some(worker_id)) = (request.key.as_deref(), request.worker_id.as_deref()) else {
                    return (failure(BrokerError::KeyAndWorkerRequired), false);
                };
                match inner.leases.lease(key, worker_id, request.ttl, now) {
                    Ok(value) => {
                        let mut fields = Map::new();
                        fields.insert("value".to_string(), json!(value));
                        (success(fields), true)
                    }
                    Err(error) => (failure(error), false),
                }
            }
            "release" => {
                let Some(worker_id) = request.worker_id.as_deref() else {
                    return (failure(BrokerError::WorkerRequired), false);
                };
                match inner.leases.release(worker_id) {
                    Ok(released) => {
                        let mut fields = Map::new();
                        fields.insert("released".to_string(), Value::Bool(released));
                        (success(fields), true)
                    }
                    Err(error) => (failure(error), false),
                }
            }
            _ => (failure(BrokerError::UnknownAction), false),
        }
    }

    /// Sweep both tables (C6), incrementing the expiry counters.
    pub fn sweep(&self, now: i64) {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        let items_expired = inner.store.sweep(now);
        let leases_expired = inner.leases.prune_expired(now);
        if items_expired > 0 {
            inner.metrics.record_items_expired(items_expired as u64);
        }
        if leases_expired > 0 {
            inner.metrics.record_leases_expired(leases_expired as u64);
        }
    }

    /// Approximate live-data byte size, used by `stats`/`health` and the
    /// heartbeat event.
    #[must_use]
    pub fn approximate_bytes(&self, now: i64) -> u64 {
        let inner = self.inner.lock().expect("broker mutex poisoned");
        inner.store.approximate_bytes(now)
    }

    /// Drop all stored state (called from `stop()`).
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.store.clear();
        inner.leases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: &str) -> Request {
        serde_json::from_value(json!({"action": action})).unwrap()
    }

    #[test]
    fn unknown_action_reports_failure() {
        let core = BrokerCore::new(Config::default());
        let (response, ok) = core.dispatch(&request("nope"), 0);
        assert!(!ok);
        assert_eq!(response["error"], "unknown_action");
    }

    #[test]
    fn ping_reports_success() {
        let core = BrokerCore::new(Config::default());
        let (response, ok) = core.dispatch(&request("ping"), 1000);
        assert!(ok);
        assert_eq!(response["pong"], 1000);
    }

    #[test]
    fn basic_set_get_del_round_trip() {
        let core = BrokerCore::new(Config::default());
        let set_req: Request = serde_json::from_value(json!({
            "action": "set", "key": "foo", "value": "bar", "ttl": 60_000
        }))
        .unwrap();
        let (resp, ok) = core.dispatch(&set_req, 0);
        assert!(ok);
        assert_eq!(resp["ok"], true);

        let get_req: Request = serde_json::from_value(json!({"action": "get", "key": "foo"})).unwrap();
        let (resp, ok) = core.dispatch(&get_req, 0);
        assert!(ok);
        assert_eq!(resp["value"], "bar");

        let del_req: Request = serde_json::from_value(json!({"action": "del", "key": "foo"})).unwrap();
        let (resp, ok) = core.dispatch(&del_req, 0);
        assert!(ok);
        assert_eq!(resp["ok"], true);

        let (resp, ok) = core.dispatch(&get_req, 0);
        assert!(!ok);
        assert_eq!(resp["error"], "not_found");
    }
}
