// In-memory implementation of VerdictStore.
//
// Expiry is lazy: an expired entry stays in the map until a read trips over
// it or the sweeper calls `purge_expired`, but it is never returned.

use crate::core::moderation::{StoreError, VerdictStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct StoredValue {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: Value, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Verdict store that lives and dies with the process.
#[derive(Default)]
pub struct InMemoryVerdictStore {
    data: DashMap<String, StoredValue>,
}

impl InMemoryVerdictStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerdictStore for InMemoryVerdictStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Instant::now();
        // Clone out before removing; holding the read guard across remove deadlocks the shard.
        let found = self.data.get(key).map(|entry| entry.clone());
        match found {
            Some(stored) if stored.is_expired(now) => {
                self.data.remove_if(key, |_, v| v.is_expired(now));
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.data
            .insert(key.to_string(), StoredValue::new(value, ttl, Instant::now()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new(Value::from(0), ttl, now));

        if entry.is_expired(now) {
            *entry = StoredValue::new(Value::from(0), ttl, now);
        }

        let current = entry.value.as_i64().ok_or_else(|| StoreError::CorruptValue {
            key: key.to_string(),
            value: entry.value.to_string(),
        })?;
        entry.value = Value::from(current + 1);
        Ok(current + 1)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(value, ttl, now));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl, now));
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, stored| !stored.is_expired(now));
        Ok(before.saturating_sub(self.data.len()) as u64)
    }
}
