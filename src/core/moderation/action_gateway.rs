// Action gateway - every mutating call into the chat protocol goes through here.
//
// Rate-limit responses are retried with exponential backoff; anything else
// is returned to the caller straight away.

use super::moderation_models::{Notice, TimelineEvent};
use super::verdict_store::{ModerationState, VerdictStore};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Rate limited by homeserver")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

// ============================================================================
// PROTOCOL PORTS
// ============================================================================

/// Room operations the engine needs from the chat protocol client.
#[async_trait]
pub trait RoomGateway: Send + Sync {
    async fn redact_event(&self, room_id: &str, event_id: &str) -> Result<(), GatewayError>;

    async fn ban_user(&self, room_id: &str, user_id: &str, reason: &str)
        -> Result<(), GatewayError>;

    async fn send_notice(&self, room_id: &str, notice: &Notice) -> Result<(), GatewayError>;

    /// Events currently buffered for the room, oldest first.
    async fn room_timeline(&self, room_id: &str) -> Result<Vec<TimelineEvent>, GatewayError>;
}

/// Translation of protocol-internal media references into fetchable URLs.
pub trait MediaSource: Send + Sync {
    /// The client's own translation, if it has one for this reference.
    fn resolve_media(&self, reference: &str) -> Option<String>;

    fn access_token(&self) -> Option<String>;
}

#[async_trait]
impl<T: RoomGateway + ?Sized> RoomGateway for Arc<T> {
    async fn redact_event(&self, room_id: &str, event_id: &str) -> Result<(), GatewayError> {
        (**self).redact_event(room_id, event_id).await
    }

    async fn ban_user(
        &self,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), GatewayError> {
        (**self).ban_user(room_id, user_id, reason).await
    }

    async fn send_notice(&self, room_id: &str, notice: &Notice) -> Result<(), GatewayError> {
        (**self).send_notice(room_id, notice).await
    }

    async fn room_timeline(&self, room_id: &str) -> Result<Vec<TimelineEvent>, GatewayError> {
        (**self).room_timeline(room_id).await
    }
}

// ============================================================================
// RETRY
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based). A longer server hint wins.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        match retry_after {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }
}

/// Run `operation`, retrying only on [`GatewayError::RateLimited`].
pub async fn with_rate_limit<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(GatewayError::RateLimited { retry_after }) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, retry_after);
                tracing::warn!(
                    "Rate limited during {}, retrying in {}ms (attempt {}/{})",
                    label,
                    delay.as_millis(),
                    attempt + 1,
                    policy.max_retries
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

// ============================================================================
// GATEWAY
// ============================================================================

pub struct ActionGateway<G: RoomGateway> {
    gateway: G,
    retry: RetryPolicy,
    /// Log bans instead of executing them.
    dry_run: bool,
}

impl<G: RoomGateway> ActionGateway<G> {
    pub fn new(gateway: G, retry: RetryPolicy, dry_run: bool) -> Self {
        Self {
            gateway,
            retry,
            dry_run,
        }
    }

    pub async fn redact(&self, room_id: &str, event_id: &str) -> Result<(), GatewayError> {
        with_rate_limit(&self.retry, "redaction", || {
            self.gateway.redact_event(room_id, event_id)
        })
        .await
    }

    pub async fn ban(&self, room_id: &str, user_id: &str, reason: &str) -> Result<(), GatewayError> {
        if self.dry_run {
            tracing::warn!(user_id = %user_id, "[DEBUG] Would ban user: {}", reason);
            return Ok(());
        }

        tracing::warn!(user_id = %user_id, "Banning user: {}", reason);
        with_rate_limit(&self.retry, "ban", || {
            self.gateway.ban_user(room_id, user_id, reason)
        })
        .await
    }

    pub async fn send_notice(&self, room_id: &str, notice: &Notice) -> Result<(), GatewayError> {
        with_rate_limit(&self.retry, "notice", || {
            self.gateway.send_notice(room_id, notice)
        })
        .await
    }

    pub async fn room_timeline(&self, room_id: &str) -> Result<Vec<TimelineEvent>, GatewayError> {
        with_rate_limit(&self.retry, "timeline fetch", || {
            self.gateway.room_timeline(room_id)
        })
        .await
    }

    /// Redact an event unless it has already been redacted (or is being redacted).
    ///
    /// Returns `Ok(true)` if this call performed the redaction.
    pub async fn redact_once<S: VerdictStore>(
        &self,
        state: &ModerationState<S>,
        room_id: &str,
        event_id: &str,
    ) -> Result<bool, GatewayError> {
        match state.claim_deletion(event_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Message was already deleted, skipping: {}", event_id);
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not check deletion record for {}, redacting anyway: {}",
                    event_id,
                    e
                );
            }
        }

        match self.redact(room_id, event_id).await {
            Ok(()) => Ok(true),
            Err(e) => {
                if let Err(release_err) = state.release_deletion(event_id).await {
                    tracing::warn!(
                        "Failed to release deletion claim for {}: {}",
                        event_id,
                        release_err
                    );
                }
                Err(e)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infra::moderation::InMemoryVerdictStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Room double that records every call and can be told to throttle.
    #[derive(Default)]
    pub(crate) struct MockRoom {
        pub redactions: Mutex<Vec<String>>,
        pub bans: Mutex<Vec<(String, String)>>,
        pub notices: Mutex<Vec<Notice>>,
        pub timeline: Mutex<Vec<TimelineEvent>>,
        pub redact_attempts: AtomicU32,
        /// Redactions answered with a rate-limit error before succeeding.
        pub throttled_redactions: AtomicU32,
        /// Event ids whose redaction fails with `NotFound`.
        pub missing_events: Mutex<Vec<String>>,
    }

    impl MockRoom {
        pub(crate) fn redactions(&self) -> Vec<String> {
            self.redactions.lock().unwrap().clone()
        }

        pub(crate) fn bans(&self) -> Vec<(String, String)> {
            self.bans.lock().unwrap().clone()
        }

        pub(crate) fn notices(&self) -> Vec<Notice> {
            self.notices.lock().unwrap().clone()
        }

        pub(crate) fn throttle_redactions(&self, times: u32) {
            self.throttled_redactions.store(times, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RoomGateway for MockRoom {
        async fn redact_event(&self, _room_id: &str, event_id: &str) -> Result<(), GatewayError> {
            self.redact_attempts.fetch_add(1, Ordering::SeqCst);
            let throttled = self
                .throttled_redactions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if throttled {
                return Err(GatewayError::RateLimited { retry_after: None });
            }
            if self
                .missing_events
                .lock()
                .unwrap()
                .iter()
                .any(|id| id == event_id)
            {
                return Err(GatewayError::NotFound(event_id.to_string()));
            }
            self.redactions.lock().unwrap().push(event_id.to_string());
            Ok(())
        }

        async fn ban_user(
            &self,
            _room_id: &str,
            user_id: &str,
            reason: &str,
        ) -> Result<(), GatewayError> {
            self.bans
                .lock()
                .unwrap()
                .push((user_id.to_string(), reason.to_string()));
            Ok(())
        }

        async fn send_notice(&self, _room_id: &str, notice: &Notice) -> Result<(), GatewayError> {
            self.notices.lock().unwrap().push(notice.clone());
            Ok(())
        }

        async fn room_timeline(&self, _room_id: &str) -> Result<Vec<TimelineEvent>, GatewayError> {
            Ok(self.timeline.lock().unwrap().clone())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_retries: 3,
        }
    }

    #[test]
    fn test_backoff_doubles_and_respects_server_hint() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, None), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(4000));
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_millis(3000))),
            Duration::from_millis(3000)
        );
        assert_eq!(
            policy.delay_for(2, Some(Duration::from_millis(10))),
            Duration::from_millis(4000)
        );
    }

    #[tokio::test]
    async fn test_rate_limited_call_is_retried_until_success() {
        let room = Arc::new(MockRoom::default());
        room.throttle_redactions(2);
        let gateway = ActionGateway::new(Arc::clone(&room), fast_retry(), false);

        gateway.redact("!r:x", "$e").await.unwrap();

        assert_eq!(room.redact_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(room.redactions(), vec!["$e"]);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let room = Arc::new(MockRoom::default());
        room.throttle_redactions(100);
        let gateway = ActionGateway::new(Arc::clone(&room), fast_retry(), false);

        let result = gateway.redact("!r:x", "$e").await;

        assert!(matches!(result, Err(GatewayError::RateLimited { .. })));
        // One initial attempt plus three retries.
        assert_eq!(room.redact_attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let room = Arc::new(MockRoom::default());
        room.missing_events.lock().unwrap().push("$gone".to_string());
        let gateway = ActionGateway::new(Arc::clone(&room), fast_retry(), false);

        let result = gateway.redact("!r:x", "$gone").await;

        assert!(matches!(result, Err(GatewayError::NotFound(_))));
        assert_eq!(room.redact_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redact_once_is_idempotent() {
        let room = Arc::new(MockRoom::default());
        let gateway = ActionGateway::new(Arc::clone(&room), fast_retry(), false);
        let state = ModerationState::new(Arc::new(InMemoryVerdictStore::new()));

        assert!(gateway.redact_once(&state, "!r:x", "$e").await.unwrap());
        assert!(!gateway.redact_once(&state, "!r:x", "$e").await.unwrap());

        assert_eq!(room.redactions(), vec!["$e"]);
        assert!(state.is_deleted("$e").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_redaction_can_be_retried_later() {
        let room = Arc::new(MockRoom::default());
        room.throttle_redactions(4);
        let gateway = ActionGateway::new(Arc::clone(&room), fast_retry(), false);
        let state = ModerationState::new(Arc::new(InMemoryVerdictStore::new()));

        assert!(gateway.redact_once(&state, "!r:x", "$e").await.is_err());
        assert!(!state.is_deleted("$e").await.unwrap());

        assert!(gateway.redact_once(&state, "!r:x", "$e").await.unwrap());
        assert_eq!(room.redactions(), vec!["$e"]);
    }

    #[tokio::test]
    async fn test_dry_run_skips_ban() {
        let room = Arc::new(MockRoom::default());
        let gateway = ActionGateway::new(Arc::clone(&room), fast_retry(), true);

        gateway
            .ban("!r:x", "@spam:x", "Automoderator: Inappropriate username")
            .await
            .unwrap();

        assert!(room.bans().is_empty());
    }
}
