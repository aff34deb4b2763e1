//! Run-scoped shared state
//!
//! The only component shared across script instances. Values are stored in
//! their serialized form; `wait` parks a caller until another instance sets
//! the key. Registration of a waiter and publication of a value happen under
//! the same lock, so a `set` can never slip between a waiter's "not present"
//! check and its registration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::lock::MutexExt;
use crate::BridgeError;

#[derive(Debug, Default)]
struct Slot {
    value: Option<String>,
    waiters: Vec<oneshot::Sender<String>>,
}

/// Key/value store with blocking wait-for-value, cloned into every instance of a run
#[derive(Debug, Clone, Default)]
pub struct SharedStore {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

fn decode(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key` and resume every pending waiter
    pub fn set(&self, key: &str, value: &Value) {
        let raw = value.to_string();
        let mut slots = self.slots.lock_or_recover();
        let slot = slots.entry(key.to_string()).or_default();
        let woken = slot.waiters.len();
        for waiter in slot.waiters.drain(..) {
            // Receiver gone means that waiter was abandoned
            let _ = waiter.send(raw.clone());
        }
        slot.value = Some(raw);
        tracing::debug!(key, woken, "Shared value set");
    }

    /// Current value for `key`, if ever set
    pub fn get(&self, key: &str) -> Option<Value> {
        let slots = self.slots.lock_or_recover();
        slots.get(key)?.value.as_deref().map(decode)
    }

    /// Wait until `key` holds a value
    ///
    /// Returns immediately when the value is already present. Dropping the
    /// returned future abandons the wait without affecting other waiters.
    pub async fn wait(&self, key: &str) -> Value {
        loop {
            let receiver = {
                let mut slots = self.slots.lock_or_recover();
                let slot = slots.entry(key.to_string()).or_default();
                if let Some(raw) = &slot.value {
                    return decode(raw);
                }
                slot.waiters.retain(|w| !w.is_closed());
                let (tx, rx) = oneshot::channel();
                slot.waiters.push(tx);
                rx
            };

            if let Ok(raw) = receiver.await {
                return decode(&raw);
            }
        }
    }

    /// [`wait`](Self::wait) bounded by `timeout`
    pub async fn wait_timeout(&self, key: &str, timeout: Duration) -> Result<Value, BridgeError> {
        tokio::time::timeout(timeout, self.wait(key))
            .await
            .map_err(|_| BridgeError::Timeout(key.to_string()))
    }

    /// Number of live waiters parked on `key`
    pub fn waiter_count(&self, key: &str) -> usize {
        let slots = self.slots.lock_or_recover();
        slots
            .get(key)
            .map_or(0, |slot| slot.waiters.iter().filter(|w| !w.is_closed()).count())
    }

    /// All keys that currently hold a value
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let slots = self.slots.lock_or_recover();
        slots
            .iter()
            .filter_map(|(key, slot)| slot.value.as_deref().map(|raw| (key.clone(), decode(raw))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn until_waiters(store: &SharedStore, key: &str, n: usize) {
        while store.waiter_count(key) < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn set_before_wait_returns_immediately() {
        let store = SharedStore::new();
        store.set("token", &json!("abc123"));

        let value = tokio::time::timeout(Duration::ZERO, store.wait("token"))
            .await
            .expect("wait should not suspend");
        assert_eq!(value, json!("abc123"));
    }

    #[tokio::test]
    async fn get_roundtrips_structured_values() {
        let store = SharedStore::new();
        let value = json!({"id": 7, "tags": ["a", "b"], "nested": {"ok": true, "ratio": 0.5}});
        store.set("user", &value);

        assert_eq!(store.get("user"), Some(value));
        assert_eq!(store.get("missing"), None);
    }

    #[tokio::test]
    async fn last_write_wins() {
        let store = SharedStore::new();
        store.set("k", &json!(1));
        store.set("k", &json!(2));
        assert_eq!(store.get("k"), Some(json!(2)));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_set_resumes_all_waiters() {
        let store = SharedStore::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.wait("token").await }));
        }
        until_waiters(&store, "token", 3).await;
        assert_eq!(store.get("token"), None);

        store.set("token", &json!("abc123"));
        store.set("token", &json!("later"));

        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!("abc123"));
        }
        assert_eq!(store.waiter_count("token"), 0);
        assert_eq!(store.get("token"), Some(json!("later")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_missed_wakeups_under_contention() {
        for round in 0..50 {
            let store = SharedStore::new();
            let key = format!("k{round}");
            let waiter = {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.wait_timeout(&key, Duration::from_secs(5)).await })
            };
            let setter = {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.set(&key, &json!(round)) })
            };
            setter.await.unwrap();
            assert_eq!(waiter.await.unwrap(), Ok(json!(round)));
        }
    }

    #[tokio::test]
    async fn wait_times_out_and_abandons_registration() {
        let store = SharedStore::new();
        let result = store.wait_timeout("never", Duration::from_millis(10)).await;
        assert_eq!(result, Err(BridgeError::Timeout("never".into())));
        assert_eq!(store.waiter_count("never"), 0);

        // A later set still works and does not trip over the dead waiter
        store.set("never", &json!(null));
        assert_eq!(store.get("never"), Some(Value::Null));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_waiter_does_not_affect_others() {
        let store = SharedStore::new();
        let abandoned = {
            let store = store.clone();
            tokio::spawn(async move { store.wait("k").await })
        };
        let kept = {
            let store = store.clone();
            tokio::spawn(async move { store.wait("k").await })
        };
        until_waiters(&store, "k", 2).await;

        abandoned.abort();
        let _ = abandoned.await;
        store.set("k", &json!("v"));

        assert_eq!(kept.await.unwrap(), json!("v"));
    }
}
