//! In-memory value store (C4, §4.4).

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{BrokerError, BrokerResult};
use crate::metrics::Metrics;

/// A stored value plus its expiry and compression flag.
#[derive(Debug, Clone)]
pub struct ValueEntry {
    pub value: Value,
    pub expires_at: i64,
    pub compressed: bool,
}

/// The key/value half of the broker's state.
pub struct Store {
    items: HashMap<String, ValueEntry>,
    require_ttl: bool,
    default_ttl_ms: i64,
    max_items: usize,
    max_value_size: usize,
}

impl Store {
    #[must_use]
    pub fn new(require_ttl: bool, default_ttl_ms: i64, max_items: usize, max_value_size: usize) -> Self {
        Self {
            items: HashMap::new(),
            require_ttl,
            default_ttl_ms,
            max_items,
            max_value_size,
        }
    }

    /// `get(key)` (§4.4): returns the value and compression flag, or
    /// `expired`/`not_found`. An expired entry is evicted on read.
    pub fn get(&mut self, key: &str, now: i64) -> BrokerResult<(Value, bool)> {
        match self.items.get(key) {
            Some(entry) if entry.expires_at > now => Ok((entry.value.clone(), entry.compressed)),
            Some(_) => {
                self.items.remove(key);
                Err(BrokerError::Expired)
            }
            None => Err(BrokerError::NotFound),
        }
    }

    /// `set(key, value, ttl, compressed, before_size, after_size)` (§4.4).
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &mut self,
        key: String,
        value: Value,
        ttl: Option<i64>,
        compressed: bool,
        before_size: Option<u64>,
        after_size: Option<u64>,
        now: i64,
        metrics: &Metrics,
    ) -> BrokerResult<()> {
        let ttl_ms = match ttl {
            Some(t) if t < 0 => return Err(BrokerError::InvalidTtl),
            Some(0) => {
                if self.require_ttl {
                    return Err(BrokerError::InvalidTtl);
                }
                self.default_ttl_ms
            }
            Some(t) => t,
            None => {
                if self.require_ttl {
                    return Err(BrokerError::TtlRequired);
                }
                self.default_ttl_ms
            }
        };

        let size = value_byte_len(&value);
        if size > self.max_value_size {
            return Err(BrokerError::TooLarge);
        }

        let is_new = !self.items.contains_key(&key);
        if is_new && self.max_items != 0 && self.non_expired_count(now) >= self.max_items {
            return Err(BrokerError::MaxItems);
        }

        if compressed {
            if let (Some(before), Some(after)) = (before_size, after_size) {
                metrics.record_compressed_write(before, after);
            } else {
                metrics.record_uncompressed_write(size as u64);
            }
        } else {
            metrics.record_uncompressed_write(size as u64);
        }

        self.items.insert(
            key,
            ValueEntry {
                value,
                expires_at: now.saturating_add(ttl_ms),
                compressed,
            },
        );
        Ok(())
    }

    /// `del(key)` (§4.4): always succeeds.
    pub fn del(&mut self, key: &str) {
        self.items.remove(key);
    }

    /// `list()` (§4.4): non-expired keys with expiry and presence only.
    pub fn list(&self, now: i64) -> Vec<(String, i64)> {
        self.items
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| (key.clone(), entry.expires_at))
            .collect()
    }

    /// Count of entries with `expires_at > now`.
    #[must_use]
    pub fn non_expired_count(&self, now: i64) -> usize {
        self.items.values().filter(|entry| entry.expires_at > now).count()
    }

    /// Remove all expired entries, returning the count removed (C6).
    pub fn sweep(&mut self, now: i64) -> usize {
        let before = self.items.len();
        self.items.retain(|_, entry| entry.expires_at > now);
        before - self.items.len()
    }

    /// Approximate serialized byte size of all live entries, used for
    /// the stats block's memory heuristic. Monotone in key/value size,
    /// per the spec's deliberately unspecified estimator.
    #[must_use]
    pub fn approximate_bytes(&self, now: i64) -> u64 {
        self.items
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| (key.len() + value_byte_len(&entry.value)) as u64)
            .sum()
    }

    /// Drop everything (called from `stop()`).
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

fn value_byte_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        other => serde_json::to_vec(other).map(|bytes| bytes.len()).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new()
    }

    #[test]
    fn round_trip_set_get_del() {
        let mut store = Store::new(true, 1_800_000, 0, 262_144);
        let m = metrics();
        store.set("foo".into(), Value::String("bar".into()), Some(60_000), false, None, None, 0, &m).unwrap();
        let (value, compressed) = store.get("foo", 0).unwrap();
        assert_eq!(value, Value::String("bar".into()));
        assert!(!compressed);
        store.del("foo");
        assert_eq!(store.get("foo", 0), Err(BrokerError::NotFound));
    }

    #[test]
    fn expiry_then_sweep() {
        let mut store = Store::new(true, 1_800_000, 0, 262_144);
        let m = metrics();
        store.set("t".into(), Value::String("v".into()), Some(100), false, None, None, 0, &m).unwrap();
        assert_eq!(store.get("t", 250), Err(BrokerError::Expired));
        assert!(store.get("t", 250).is_err());
    }

    #[test]
    fn require_ttl_rules() {
        let mut store = Store::new(true, 1_800_000, 0, 262_144);
        let m = metrics();
        assert_eq!(
            store.set("k".into(), Value::String("v".into()), None, false, None, None, 0, &m),
            Err(BrokerError::TtlRequired)
        );
        assert_eq!(
            store.set("k".into(), Value::String("v".into()), Some(0), false, None, None, 0, &m),
            Err(BrokerError::InvalidTtl)
        );
        assert_eq!(
            store.set("k".into(), Value::String("v".into()), Some(-1), false, None, None, 0, &m),
            Err(BrokerError::InvalidTtl)
        );
        assert!(store.set("k".into(), Value::String("v".into()), Some(1), false, None, None, 0, &m).is_ok());
    }

    #[test]
    fn max_items_exempts_updates() {
        let mut store = Store::new(true, 1_800_000, 2, 262_144);
        let m = metrics();
        store.set("a".into(), Value::String("1".into()), Some(60_000), false, None, None, 0, &m).unwrap();
        store.set("b".into(), Value::String("2".into()), Some(60_000), false, None, None, 0, &m).unwrap();
        assert_eq!(
            store.set("c".into(), Value::String("3".into()), Some(60_000), false, None, None, 0, &m),
            Err(BrokerError::MaxItems)
        );
        assert!(store.set("a".into(), Value::String("updated".into()), Some(60_000), false, None, None, 0, &m).is_ok());
    }
}
