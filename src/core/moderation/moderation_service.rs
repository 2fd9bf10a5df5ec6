// Moderation service - the probation state machine.
//
// This service handles:
// - New member checks (username, avatar) and the start of probation
// - Content checks for members on probation (text, polls, images, room avatars)
// - Strike escalation (warn, then ban) and early release after good behaviour
//
// Every decision re-reads the verdict store; nothing about a user is cached
// between events. NO Matrix dependencies here - just domain logic.

use super::action_gateway::{ActionGateway, RoomGateway};
use super::classifier::{ContentClassifier, ContentItem};
use super::cleanup_queue::{CleanupJob, CleanupQueue};
use super::fallback::FallbackFilter;
use super::moderation_models::{
    BanCause, IgnoreReason, Membership, MembershipEvent, ModerationConfig, ModerationOutcome,
    Notice, Pacing, ProbationState, ProcessEpoch, RoomEvent, RoomEventKind,
};
use super::polls::extract_poll;
use super::verdict_store::{ModerationState, VerdictStore};
use crate::core::ai::AiProvider;
use std::sync::Arc;
use std::time::Duration;

/// Last line of every warning notice.
const WARNING_MARKER: &str = "This is your last warning before being banned.";

/// Immutable facts fixed at start-up.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub epoch: ProcessEpoch,
    pub bot_user_id: String,
    pub config: ModerationConfig,
    pub pacing: Pacing,
}

pub struct ModerationService<S: VerdictStore, P: AiProvider, G: RoomGateway> {
    context: EngineContext,
    state: ModerationState<S>,
    classifier: ContentClassifier<P>,
    actions: Arc<ActionGateway<G>>,
    cleanup: CleanupQueue,
    filter: FallbackFilter,
}

impl<S: VerdictStore, P: AiProvider, G: RoomGateway> ModerationService<S, P, G> {
    pub fn new(
        context: EngineContext,
        state: ModerationState<S>,
        classifier: ContentClassifier<P>,
        actions: Arc<ActionGateway<G>>,
        cleanup: CleanupQueue,
        filter: FallbackFilter,
    ) -> Self {
        Self {
            context,
            state,
            classifier,
            actions,
            cleanup,
            filter,
        }
    }

    // ========================================================================
    // MEMBERSHIP
    // ========================================================================

    /// Check a member who joined during this run, or a member on probation who
    /// edited their profile.
    pub async fn handle_membership(&self, event: &MembershipEvent) -> ModerationOutcome {
        let user_id = event.user_id.as_str();

        if !self.context.epoch.observed(event.timestamp_ms) {
            tracing::debug!("Skipping old member event: {}", user_id);
            return ModerationOutcome::Ignored(IgnoreReason::BeforeStart);
        }
        if event.membership != Membership::Join {
            return ModerationOutcome::Ignored(IgnoreReason::NotAJoin);
        }
        if user_id == self.context.bot_user_id {
            return ModerationOutcome::Ignored(IgnoreReason::OwnMessage);
        }
        if event.is_profile_change && self.read_state(user_id).await == ProbationState::Unmonitored
        {
            tracing::debug!("Ignoring profile change of unmonitored member: {}", user_id);
            return ModerationOutcome::Ignored(IgnoreReason::NotMonitored);
        }

        let username = self
            .classifier
            .classify(ContentItem::Username(&event.display_name))
            .await;
        if username.unsafe_content {
            tracing::warn!(
                user_id = %user_id,
                "Inappropriate username: {}",
                event.display_name
            );
            return self.ban_member(event, BanCause::Username).await;
        }

        if let Some(avatar_url) = &event.avatar_url {
            tracing::debug!("Checking avatar for user: {}", user_id);
            let avatar = self.classifier.classify(ContentItem::Avatar(avatar_url)).await;
            if avatar.unsafe_content {
                tracing::warn!(user_id = %user_id, "Inappropriate avatar");
                return self.ban_member(event, BanCause::Avatar).await;
            }
        }

        if event.is_profile_change {
            tracing::debug!("Profile change passed checks: {}", user_id);
            return ModerationOutcome::ProfileChecked;
        }

        if let Err(e) = self
            .state
            .start_probation(user_id, self.context.config.probation)
            .await
        {
            tracing::error!("Failed to start probation for {}: {}", user_id, e);
        } else {
            tracing::info!(user_id = %user_id, "New member is on probation");
        }
        ModerationOutcome::ProbationStarted
    }

    async fn ban_member(&self, event: &MembershipEvent, cause: BanCause) -> ModerationOutcome {
        if let Err(e) = self
            .actions
            .ban(&event.room_id, &event.user_id, cause.reason())
            .await
        {
            tracing::error!("Failed to ban {}: {}", event.user_id, e);
        }
        self.clear_state(&event.user_id).await;
        ModerationOutcome::Banned(cause)
    }

    // ========================================================================
    // ROOM CONTENT
    // ========================================================================

    /// Check one piece of room content.
    pub async fn handle_room_event(&self, event: &RoomEvent) -> ModerationOutcome {
        let sender = event.sender.as_str();

        if sender == self.context.bot_user_id {
            tracing::debug!("Skipping bot message");
            return ModerationOutcome::Ignored(IgnoreReason::OwnMessage);
        }
        if !self.context.epoch.observed(event.timestamp_ms) {
            tracing::debug!("Skipping old message from: {}", sender);
            return ModerationOutcome::Ignored(IgnoreReason::BeforeStart);
        }
        if let RoomEventKind::Unsupported { event_type } = &event.kind {
            tracing::debug!("Not moderating {} from {}", event_type, sender);
            return ModerationOutcome::Ignored(IgnoreReason::Unsupported);
        }

        let state = self.read_state(sender).await;
        if state == ProbationState::Unmonitored && !self.context.config.check_all_members {
            return ModerationOutcome::Ignored(IgnoreReason::NotMonitored);
        }

        match &event.kind {
            RoomEventKind::Text { body } => {
                if body.chars().count() < self.context.config.min_message_length {
                    tracing::debug!("Skipping short message from: {}", sender);
                    return ModerationOutcome::Ignored(IgnoreReason::TooShort);
                }
                if self.already_deleted(&event.event_id).await {
                    return ModerationOutcome::Ignored(IgnoreReason::AlreadyDeleted);
                }

                let verdict = self.classifier.classify(ContentItem::Text(body)).await;
                let flagged = verdict.unsafe_content || self.fallback_flags(event, body);
                self.apply_strike_policy(event, flagged).await
            }
            RoomEventKind::PollStart { content } => {
                let Some(poll) = extract_poll(content) else {
                    tracing::warn!("Could not parse poll content structure");
                    return ModerationOutcome::Ignored(IgnoreReason::NoContent);
                };
                let text = poll.to_text();
                if text.chars().count() < self.context.config.min_message_length {
                    tracing::debug!("Skipping short poll from: {}", sender);
                    return ModerationOutcome::Ignored(IgnoreReason::TooShort);
                }
                if self.already_deleted(&event.event_id).await {
                    return ModerationOutcome::Ignored(IgnoreReason::AlreadyDeleted);
                }

                tracing::debug!("Checking poll content: {}", text);
                let verdict = self.classifier.classify(ContentItem::Poll(&poll)).await;
                let flagged = verdict.unsafe_content || self.fallback_flags(event, &text);
                self.apply_strike_policy(event, flagged).await
            }
            RoomEventKind::Image { url } | RoomEventKind::Sticker { url } => {
                self.check_media(event, url.as_deref(), BanCause::Image)
                    .await
            }
            RoomEventKind::RoomAvatar { url } => {
                self.check_media(event, url.as_deref(), BanCause::RoomAvatar)
                    .await
            }
            RoomEventKind::Unsupported { .. } => {
                ModerationOutcome::Ignored(IgnoreReason::Unsupported)
            }
        }
    }

    /// Images, stickers and room avatars: one strike and you're out.
    async fn check_media(
        &self,
        event: &RoomEvent,
        url: Option<&str>,
        cause: BanCause,
    ) -> ModerationOutcome {
        let Some(url) = url else {
            return ModerationOutcome::Ignored(IgnoreReason::NoContent);
        };
        if self.already_deleted(&event.event_id).await {
            return ModerationOutcome::Ignored(IgnoreReason::AlreadyDeleted);
        }

        let verdict = self.classifier.classify(ContentItem::Image(url)).await;
        if !verdict.unsafe_content {
            return self.credit_safe_content(&event.sender).await;
        }

        tracing::warn!(user_id = %event.sender, event_id = %event.event_id, "Explicit media posted");
        if let Err(e) = self
            .actions
            .ban(&event.room_id, &event.sender, cause.reason())
            .await
        {
            tracing::error!("Failed to ban {}: {}", event.sender, e);
        }
        self.clear_state(&event.sender).await;
        self.redact(event).await;
        self.schedule_cleanup(event, self.context.pacing.severe_settle_delay)
            .await;
        ModerationOutcome::Banned(cause)
    }

    /// Text and polls: first strike warns, second strike bans.
    async fn apply_strike_policy(&self, event: &RoomEvent, flagged: bool) -> ModerationOutcome {
        if !flagged {
            return self.credit_safe_content(&event.sender).await;
        }

        self.redact(event).await;

        // The check took a while; decide on the state as it is now.
        match self.read_state(&event.sender).await {
            ProbationState::Unmonitored => {
                tracing::debug!(
                    "User is no longer being monitored, skipping warning: {}",
                    event.sender
                );
                ModerationOutcome::Redacted
            }
            ProbationState::Clean => self.warn(event).await,
            ProbationState::Warned => self.ban_repeat_offender(event).await,
        }
    }

    async fn warn(&self, event: &RoomEvent) -> ModerationOutcome {
        let sender = event.sender.as_str();
        tracing::warn!(user_id = %sender, event_id = %event.event_id, "Warning user for inappropriate content");

        if let Err(e) = self
            .actions
            .send_notice(&event.room_id, &warning_notice(sender))
            .await
        {
            tracing::error!("Failed to send warning to {}: {}", sender, e);
        }
        if let Err(e) = self.state.record_warning(sender).await {
            tracing::error!("Failed to record warning for {}: {}", sender, e);
        }

        self.schedule_cleanup(event, self.context.pacing.settle_delay)
            .await;
        ModerationOutcome::Warned
    }

    async fn ban_repeat_offender(&self, event: &RoomEvent) -> ModerationOutcome {
        let sender = event.sender.as_str();
        tracing::warn!(user_id = %sender, "Banning user for inappropriate message after warning");

        self.clear_state(sender).await;
        if let Err(e) = self
            .actions
            .ban(&event.room_id, sender, BanCause::RepeatOffense.reason())
            .await
        {
            tracing::error!("Failed to ban {}: {}", sender, e);
        }

        self.schedule_cleanup(event, self.context.pacing.settle_delay)
            .await;
        ModerationOutcome::Banned(BanCause::RepeatOffense)
    }

    /// Count safe content towards release, unless the user is on notice.
    async fn credit_safe_content(&self, user_id: &str) -> ModerationOutcome {
        if self.read_state(user_id).await != ProbationState::Clean {
            return ModerationOutcome::Passed;
        }

        let count = match self.state.count_valid_message(user_id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Failed to count valid message for {}: {}", user_id, e);
                return ModerationOutcome::Passed;
            }
        };

        if count >= i64::from(self.context.config.required_valid_messages) {
            if let Err(e) = self.state.release(user_id).await {
                tracing::error!("Failed to release {} from probation: {}", user_id, e);
                return ModerationOutcome::Counted {
                    valid_messages: count,
                };
            }
            tracing::info!(
                user_id = %user_id,
                "User has passed required valid messages threshold, removing from monitoring"
            );
            return ModerationOutcome::Released;
        }

        ModerationOutcome::Counted {
            valid_messages: count,
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Current state of a user. Unreadable state counts as unmonitored.
    async fn read_state(&self, user_id: &str) -> ProbationState {
        self.state
            .probation_state(user_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read probation state for {}: {}", user_id, e);
                ProbationState::Unmonitored
            })
    }

    async fn already_deleted(&self, event_id: &str) -> bool {
        match self.state.is_deleted(event_id).await {
            Ok(deleted) => {
                if deleted {
                    tracing::debug!("Event was already deleted, skipping: {}", event_id);
                }
                deleted
            }
            Err(e) => {
                tracing::warn!("Failed to read deletion record for {}: {}", event_id, e);
                false
            }
        }
    }

    fn fallback_flags(&self, event: &RoomEvent, text: &str) -> bool {
        let flagged = self.filter.is_unsafe(text);
        if flagged {
            tracing::warn!(
                user_id = %event.sender,
                event_id = %event.event_id,
                "Fallback filter flagged content despite classifier approval"
            );
        }
        flagged
    }

    async fn redact(&self, event: &RoomEvent) {
        if let Err(e) = self
            .actions
            .redact_once(&self.state, &event.room_id, &event.event_id)
            .await
        {
            tracing::error!("Failed to delete message {}: {}", event.event_id, e);
        }
    }

    async fn clear_state(&self, user_id: &str) {
        if let Err(e) = self.state.clear(user_id).await {
            tracing::error!("Failed to clear moderation state for {}: {}", user_id, e);
        }
    }

    async fn schedule_cleanup(&self, event: &RoomEvent, settle: Duration) {
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        self.cleanup.enqueue(CleanupJob {
            room_id: event.room_id.clone(),
            user_id: event.sender.clone(),
        });
    }
}

/// Warning addressed to a user, mentioning them by localpart.
pub fn warning_notice(user_id: &str) -> Notice {
    let username = user_id
        .trim_start_matches('@')
        .split(':')
        .next()
        .unwrap_or(user_id);

    Notice {
        body: format!(
            "@{}:\nPlease refrain from sending such content in the future.\n{}",
            username, WARNING_MARKER
        ),
        formatted_body: format!(
            "<a href=\"https://matrix.to/#/{}\">@{}</a>:<br>Please refrain from sending such content in the future.<br>{}",
            user_id, username, WARNING_MARKER
        ),
    }
}

// ============================================================================
// TESTS
// ============================================================================
