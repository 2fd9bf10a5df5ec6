// Sync dispatcher - pulls events from the homeserver and hands them to the engine.
//
// Every moderation check runs in its own task; a slow classifier call for one
// message must never hold up the next one.

use super::events::{timeline_entry, translate, Inbound};
use crate::core::ai::AiProvider;
use crate::core::moderation::{GatewayError, ModerationService, VerdictStore};
use crate::infra::matrix::{MatrixHttpClient, SyncBatch};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Double the backoff, up to [`MAX_BACKOFF`].
pub fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_BACKOFF)
}

pub struct SyncDispatcher<S: VerdictStore, P: AiProvider> {
    client: Arc<MatrixHttpClient>,
    engine: Arc<ModerationService<S, P, Arc<MatrixHttpClient>>>,
    room_id: String,
}

impl<S, P> SyncDispatcher<S, P>
where
    S: VerdictStore + 'static,
    P: AiProvider + 'static,
{
    pub fn new(
        client: Arc<MatrixHttpClient>,
        engine: Arc<ModerationService<S, P, Arc<MatrixHttpClient>>>,
        room_id: String,
    ) -> Self {
        Self {
            client,
            engine,
            room_id,
        }
    }

    /// Sync until `shutdown` resolves. Only a rejected access token ends the loop early.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), GatewayError> {
        tokio::pin!(shutdown);
        let mut since: Option<String> = None;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let batch = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Stopping sync loop");
                    return Ok(());
                }
                result = self.client.sync(since.as_deref(), &self.room_id) => result,
            };

            match batch {
                Ok(batch) => {
                    backoff = INITIAL_BACKOFF;
                    since = Some(batch.next_batch.clone());
                    self.dispatch(batch);
                }
                Err(GatewayError::Unauthorized(e)) => {
                    tracing::error!("Homeserver rejected our session: {}", e);
                    return Err(GatewayError::Unauthorized(e));
                }
                Err(e) => {
                    let delay = match &e {
                        GatewayError::RateLimited {
                            retry_after: Some(hint),
                        } => (*hint).max(backoff),
                        _ => backoff,
                    };
                    tracing::warn!("Sync failed, retrying in {}s: {}", delay.as_secs(), e);
                    tokio::select! {
                        _ = &mut shutdown => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }
    }

    fn dispatch(&self, mut batch: SyncBatch) {
        let Some(events) = batch.timelines.remove(&self.room_id) else {
            return;
        };

        for raw in events {
            // Buffer first so a cleanup triggered by this very event can see it.
            if let Some(entry) = timeline_entry(&raw) {
                self.client.remember_event(&self.room_id, entry);
            }

            match translate(&self.room_id, &raw) {
                Some(Inbound::Redaction { redacts }) => {
                    self.client.forget_event(&self.room_id, &redacts);
                }
                Some(Inbound::Membership(event)) => {
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move {
                        let outcome = engine.handle_membership(&event).await;
                        tracing::debug!(user_id = %event.user_id, ?outcome, "Membership handled");
                    });
                }
                Some(Inbound::Room(event)) => {
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move {
                        let outcome = engine.handle_room_event(&event).await;
                        tracing::debug!(event_id = %event.event_id, ?outcome, "Event handled");
                    });
                }
                None => {}
            }
        }
    }
}
