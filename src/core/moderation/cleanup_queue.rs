// Cleanup queue - bulk removal of a user's recent messages.
//
// Exactly one worker consumes the queue, so jobs run one at a time in the
// order they were queued. Bulk redaction is itself a long run of
// rate-limited calls; two of them in parallel would only provoke the
// homeserver's limiter and race on the same events.

use super::action_gateway::{ActionGateway, RoomGateway};
use super::verdict_store::{ModerationState, VerdictStore};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CleanupJob {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub redacted: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum QueueMessage {
    Cleanup(CleanupJob),
    Flush(oneshot::Sender<()>),
}

/// Handle for queueing cleanup jobs. Cheap to clone.
#[derive(Clone)]
pub struct CleanupQueue {
    sender: mpsc::UnboundedSender<QueueMessage>,
    /// Jobs queued but not started yet.
    pending: Arc<DashSet<CleanupJob>>,
}

impl CleanupQueue {
    /// Start the single worker and return a handle to feed it.
    pub fn spawn<S, G>(
        actions: Arc<ActionGateway<G>>,
        state: ModerationState<S>,
        inter_deletion_delay: Duration,
    ) -> (Self, JoinHandle<()>)
    where
        S: VerdictStore + 'static,
        G: RoomGateway + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(DashSet::new());

        let worker = CleanupWorker {
            actions,
            state,
            inter_deletion_delay,
            pending: Arc::clone(&pending),
        };
        let handle = tokio::spawn(worker.run(receiver));

        (Self { sender, pending }, handle)
    }

    /// Queue a job and return immediately.
    ///
    /// Returns `false` if an identical job is already waiting or the worker is gone.
    pub fn enqueue(&self, job: CleanupJob) -> bool {
        if !self.pending.insert(job.clone()) {
            tracing::debug!(user_id = %job.user_id, "Cleanup already queued");
            return false;
        }

        if self.sender.send(QueueMessage::Cleanup(job.clone())).is_err() {
            self.pending.remove(&job);
            tracing::error!(user_id = %job.user_id, "Cleanup worker has stopped, job dropped");
            return false;
        }

        tracing::debug!(user_id = %job.user_id, "Queued message cleanup");
        true
    }

    /// Wait until every job queued before this call has finished.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(QueueMessage::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

struct CleanupWorker<S: VerdictStore, G: RoomGateway> {
    actions: Arc<ActionGateway<G>>,
    state: ModerationState<S>,
    inter_deletion_delay: Duration,
    pending: Arc<DashSet<CleanupJob>>,
}

impl<S: VerdictStore, G: RoomGateway> CleanupWorker<S, G> {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<QueueMessage>) {
        while let Some(message) = receiver.recv().await {
            match message {
                QueueMessage::Cleanup(job) => {
                    self.pending.remove(&job);
                    let report = self.run_job(&job).await;
                    tracing::info!(
                        user_id = %job.user_id,
                        redacted = report.redacted,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Message cleanup finished"
                    );
                }
                QueueMessage::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        tracing::debug!("Cleanup worker stopped");
    }

    async fn run_job(&self, job: &CleanupJob) -> CleanupReport {
        let mut report = CleanupReport::default();

        let timeline = match self.actions.room_timeline(&job.room_id).await {
            Ok(timeline) => timeline,
            Err(e) => {
                tracing::error!("Error deleting user messages, timeline unavailable: {}", e);
                return report;
            }
        };

        let targets: Vec<_> = timeline
            .into_iter()
            .filter(|event| event.sender == job.user_id && event.is_user_content())
            .collect();

        // Newest first.
        for event in targets.iter().rev() {
            match self
                .actions
                .redact_once(&self.state, &job.room_id, &event.event_id)
                .await
            {
                Ok(true) => {
                    report.redacted += 1;
                    let sent_at = chrono::DateTime::from_timestamp_millis(event.timestamp_ms)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default();
                    tracing::info!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        sent_at = %sent_at,
                        "Deleted message from user"
                    );
                    if !self.inter_deletion_delay.is_zero() {
                        tokio::time::sleep(self.inter_deletion_delay).await;
                    }
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("Failed to delete message {}: {}", event.event_id, e);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::action_gateway::tests::MockRoom;
    use crate::core::moderation::action_gateway::RetryPolicy;
    use crate::core::moderation::TimelineEvent;
    use crate::infra::moderation::InMemoryVerdictStore;

    fn event(id: &str, sender: &str, event_type: &str) -> TimelineEvent {
        TimelineEvent {
            event_id: id.to_string(),
            sender: sender.to_string(),
            event_type: event_type.to_string(),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    fn setup(
        timeline: Vec<TimelineEvent>,
    ) -> (
        CleanupQueue,
        Arc<MockRoom>,
        ModerationState<InMemoryVerdictStore>,
    ) {
        let room = Arc::new(MockRoom::default());
        *room.timeline.lock().unwrap() = timeline;
        let actions = Arc::new(ActionGateway::new(
            Arc::clone(&room),
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_retries: 1,
            },
            false,
        ));
        let state = ModerationState::new(Arc::new(InMemoryVerdictStore::new()));
        let (queue, _worker) = CleanupQueue::spawn(actions, state.clone(), Duration::ZERO);
        (queue, room, state)
    }

    fn job(user: &str) -> CleanupJob {
        CleanupJob {
            room_id: "!room:example.org".to_string(),
            user_id: user.to_string(),
        }
    }

    #[tokio::test]
    async fn test_redacts_only_target_content_newest_first() {
        let (queue, room, _) = setup(vec![
            event("$1", "@spam:x", "m.room.message"),
            event("$2", "@ok:x", "m.room.message"),
            event("$3", "@spam:x", "m.room.member"),
            event("$4", "@spam:x", "m.sticker"),
            event("$5", "@spam:x", "m.room.message"),
        ]);

        assert!(queue.enqueue(job("@spam:x")));
        queue.flush().await;

        assert_eq!(room.redactions(), vec!["$5", "$4", "$1"]);
    }

    #[tokio::test]
    async fn test_already_deleted_events_are_skipped() {
        let (queue, room, state) = setup(vec![
            event("$1", "@spam:x", "m.room.message"),
            event("$2", "@spam:x", "m.room.message"),
        ]);
        assert!(state.claim_deletion("$2").await.unwrap());

        queue.enqueue(job("@spam:x"));
        queue.flush().await;

        assert_eq!(room.redactions(), vec!["$1"]);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_job() {
        let (queue, room, state) = setup(vec![
            event("$1", "@spam:x", "m.room.message"),
            event("$2", "@spam:x", "m.room.message"),
            event("$3", "@spam:x", "m.room.message"),
        ]);
        room.missing_events.lock().unwrap().push("$2".to_string());

        queue.enqueue(job("@spam:x"));
        queue.flush().await;

        assert_eq!(room.redactions(), vec!["$3", "$1"]);
        assert!(!state.is_deleted("$2").await.unwrap());
    }

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let (queue, room, _) = setup(vec![
            event("$a", "@first:x", "m.room.message"),
            event("$b", "@second:x", "m.room.message"),
        ]);

        queue.enqueue(job("@second:x"));
        queue.enqueue(job("@first:x"));
        queue.flush().await;

        assert_eq!(room.redactions(), vec!["$b", "$a"]);
    }

    #[tokio::test]
    async fn test_enqueue_fails_once_worker_is_gone() {
        let room = Arc::new(MockRoom::default());
        let actions = Arc::new(ActionGateway::new(
            Arc::clone(&room),
            RetryPolicy::default(),
            false,
        ));
        let state = ModerationState::new(Arc::new(InMemoryVerdictStore::new()));
        let (queue, worker) = CleanupQueue::spawn(actions, state, Duration::ZERO);
        // Stop the worker so nothing leaves the queue.
        worker.abort();
        let _ = worker.await;

        // With the receiver gone the job cannot be queued at all, and the
        // pending marker is rolled back.
        assert!(!queue.enqueue(job("@spam:x")));
        assert!(queue.pending.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_while_pending_is_ignored() {
        let (queue, room, _) = setup(vec![event("$1", "@spam:x", "m.room.message")]);

        queue.pending.insert(job("@spam:x"));
        assert!(!queue.enqueue(job("@spam:x")));
        queue.pending.clear();

        assert!(queue.enqueue(job("@spam:x")));
        queue.flush().await;
        assert_eq!(room.redactions(), vec!["$1"]);
    }
}
