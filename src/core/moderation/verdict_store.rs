// Verdict store - the only shared mutable state of the moderation engine.
//
// The store is a plain key-value map with per-key expiry. `ModerationState`
// wraps it with the key layout and the typed operations the engine needs,
// so nothing else builds keys by hand.

use super::moderation_models::{ProbationState, ProcessEpoch};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a warning keeps a user one strike away from a ban.
pub const WARNING_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// How long a redaction is remembered for de-duplication.
pub const DELETION_TTL: Duration = Duration::from_secs(60 * 60);

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Unexpected value stored at {key}: {value}")]
    CorruptValue { key: String, value: String },
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

/// Key-value store with optional per-key expiry.
///
/// Expired keys must be invisible to every read, whether or not they have
/// been physically removed yet.
#[async_trait]
pub trait VerdictStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically add one to an integer key and return the new value.
    /// A missing or expired key counts from zero and gets `ttl`.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError>;

    /// Atomically store `value` unless the key is present. Returns whether it was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Physically remove expired keys. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

#[async_trait]
impl<T: VerdictStore + ?Sized> VerdictStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError> {
        (**self).increment(key, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        (**self).purge_expired().await
    }
}

// ============================================================================
// KEY LAYOUT
// ============================================================================

pub mod keys {
    pub const BOT_START_TIME: &str = "bot_start_time";

    pub fn new_member(user_id: &str) -> String {
        format!("new_members/{}", user_id)
    }

    pub fn warnings(user_id: &str) -> String {
        format!("warnings/{}", user_id)
    }

    pub fn valid_messages(user_id: &str) -> String {
        format!("valid_messages/{}", user_id)
    }

    pub fn deleted_message(event_id: &str) -> String {
        format!("deleted_messages/{}", event_id)
    }
}

// ============================================================================
// TYPED STATE
// ============================================================================

/// Typed view over the verdict store.
///
/// Holds no state of its own: every call goes back to the store.
pub struct ModerationState<S: VerdictStore> {
    store: Arc<S>,
}

impl<S: VerdictStore> Clone for ModerationState<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: VerdictStore> ModerationState<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn record_process_start(&self, epoch: ProcessEpoch) -> Result<(), StoreError> {
        self.store
            .set(keys::BOT_START_TIME, Value::from(epoch.millis()), None)
            .await
    }

    pub async fn is_on_probation(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(&keys::new_member(user_id)).await?.is_some())
    }

    pub async fn start_probation(&self, user_id: &str, window: Duration) -> Result<(), StoreError> {
        self.store
            .set(&keys::new_member(user_id), Value::Bool(true), Some(window))
            .await
    }

    pub async fn warning_count(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        self.read_count(&keys::warnings(user_id)).await
    }

    /// Record the first strike. Expires after [`WARNING_TTL`].
    pub async fn record_warning(&self, user_id: &str) -> Result<(), StoreError> {
        self.store
            .set(&keys::warnings(user_id), Value::from(1), Some(WARNING_TTL))
            .await
    }

    #[cfg(test)]
    pub async fn valid_message_count(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        self.read_count(&keys::valid_messages(user_id)).await
    }

    /// Count one more safe message. Returns the new total.
    pub async fn count_valid_message(&self, user_id: &str) -> Result<i64, StoreError> {
        self.store
            .increment(&keys::valid_messages(user_id), None)
            .await
    }

    /// Take the user off probation after enough good behaviour.
    pub async fn release(&self, user_id: &str) -> Result<(), StoreError> {
        self.store.delete(&keys::new_member(user_id)).await?;
        self.store.delete(&keys::valid_messages(user_id)).await
    }

    /// Forget everything about the user (after a ban).
    pub async fn clear(&self, user_id: &str) -> Result<(), StoreError> {
        self.store.delete(&keys::new_member(user_id)).await?;
        self.store.delete(&keys::warnings(user_id)).await?;
        self.store.delete(&keys::valid_messages(user_id)).await
    }

    pub async fn probation_state(&self, user_id: &str) -> Result<ProbationState, StoreError> {
        if !self.is_on_probation(user_id).await? {
            return Ok(ProbationState::Unmonitored);
        }
        let warnings = self.warning_count(user_id).await?;
        Ok(ProbationState::derive(true, warnings))
    }

    pub async fn is_deleted(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(&keys::deleted_message(event_id))
            .await?
            .is_some())
    }

    /// Claim the right to redact an event. Only the first caller wins.
    pub async fn claim_deletion(&self, event_id: &str) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(
                &keys::deleted_message(event_id),
                Value::Bool(true),
                Some(DELETION_TTL),
            )
            .await
    }

    /// Give a claim back after the redaction failed, so a later attempt can retry.
    pub async fn release_deletion(&self, event_id: &str) -> Result<(), StoreError> {
        self.store.delete(&keys::deleted_message(event_id)).await
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store.purge_expired().await
    }

    async fn read_count(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.store.get(key).await? {
            None => Ok(None),
            Some(value) => value
                .as_i64()
                .map(Some)
                .ok_or_else(|| StoreError::CorruptValue {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::moderation::InMemoryVerdictStore;

    fn state() -> (ModerationState<InMemoryVerdictStore>, Arc<InMemoryVerdictStore>) {
        let store = Arc::new(InMemoryVerdictStore::new());
        (ModerationState::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_state_follows_keys() {
        let (state, _) = state();
        let user = "@new:example.org";

        assert_eq!(
            state.probation_state(user).await.unwrap(),
            ProbationState::Unmonitored
        );

        state
            .start_probation(user, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            state.probation_state(user).await.unwrap(),
            ProbationState::Clean
        );

        state.record_warning(user).await.unwrap();
        assert_eq!(
            state.probation_state(user).await.unwrap(),
            ProbationState::Warned
        );

        state.clear(user).await.unwrap();
        assert_eq!(
            state.probation_state(user).await.unwrap(),
            ProbationState::Unmonitored
        );
        assert_eq!(state.warning_count(user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_keeps_warning_key_untouched() {
        let (state, _) = state();
        let user = "@u:example.org";
        state
            .start_probation(user, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(state.count_valid_message(user).await.unwrap(), 1);
        assert_eq!(state.count_valid_message(user).await.unwrap(), 2);

        state.release(user).await.unwrap();
        assert!(!state.is_on_probation(user).await.unwrap());
        assert_eq!(state.valid_message_count(user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deletion_claim_is_exclusive() {
        let (state, _) = state();
        assert!(state.claim_deletion("$a").await.unwrap());
        assert!(!state.claim_deletion("$a").await.unwrap());
        assert!(state.is_deleted("$a").await.unwrap());

        state.release_deletion("$a").await.unwrap();
        assert!(!state.is_deleted("$a").await.unwrap());
        assert!(state.claim_deletion("$a").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_reported() {
        let (state, store) = state();
        store
            .set(&keys::warnings("@u:x"), Value::from("lots"), None)
            .await
            .unwrap();
        assert!(matches!(
            state.warning_count("@u:x").await,
            Err(StoreError::CorruptValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_process_start_is_recorded() {
        let (state, store) = state();
        state
            .record_process_start(ProcessEpoch::new(42))
            .await
            .unwrap();
        assert_eq!(
            store.get(keys::BOT_START_TIME).await.unwrap(),
            Some(Value::from(42))
        );
    }
}
