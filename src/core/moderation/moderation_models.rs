// Moderation domain models - data structures for the probation engine.
//
// These are pure domain types with no Matrix dependencies.
// The Matrix layer translates raw sync events into these.

use serde_json::Value;
use std::time::Duration;

/// Wall-clock time (epoch millis) at which this process started.
///
/// Anything that happened before it belongs to a previous run and is never acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEpoch(i64);

impl ProcessEpoch {
    pub fn new(started_at_ms: i64) -> Self {
        Self(started_at_ms)
    }

    pub fn now() -> Self {
        Self::new(chrono::Utc::now().timestamp_millis())
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Whether an event with this timestamp was observed during this run.
    pub fn observed(&self, timestamp_ms: i64) -> bool {
        timestamp_ms > self.0
    }
}

/// Where a user currently stands, derived from the verdict store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbationState {
    /// No probation entry. Content is not checked.
    Unmonitored,
    /// On probation without an active warning.
    Clean,
    /// On probation with one strike. The next unsafe text or poll bans.
    Warned,
}

impl ProbationState {
    pub fn derive(on_probation: bool, warnings: Option<i64>) -> Self {
        match (on_probation, warnings) {
            (false, _) => ProbationState::Unmonitored,
            (true, Some(count)) if count >= 1 => ProbationState::Warned,
            (true, _) => ProbationState::Clean,
        }
    }
}

/// Output of a single content check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub unsafe_content: bool,
    /// Whether the classifier answered in the expected shape.
    pub valid: bool,
}

impl Verdict {
    pub fn safe() -> Self {
        Self {
            unsafe_content: false,
            valid: true,
        }
    }

    pub fn flagged() -> Self {
        Self {
            unsafe_content: true,
            valid: true,
        }
    }

    /// Verdict used whenever the check could not be completed. Always passes the content.
    pub fn failed() -> Self {
        Self {
            unsafe_content: false,
            valid: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Join,
    Other(String),
}

impl Membership {
    pub fn parse(value: &str) -> Self {
        match value {
            "join" => Membership::Join,
            other => Membership::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    pub membership: Membership,
    /// Media reference of the member's avatar, if they have one.
    pub avatar_url: Option<String>,
    pub timestamp_ms: i64,
    /// A join that follows a join: display name or avatar edit, not a new arrival.
    pub is_profile_change: bool,
}

#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub timestamp_ms: i64,
    pub kind: RoomEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEventKind {
    Text { body: String },
    Image { url: Option<String> },
    Sticker { url: Option<String> },
    /// Raw poll content, either the stable or the legacy schema.
    PollStart { content: Value },
    RoomAvatar { url: Option<String> },
    Unsupported { event_type: String },
}

/// An event as seen in the room's buffered timeline, used by bulk cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEvent {
    pub event_id: String,
    pub sender: String,
    pub event_type: String,
    pub timestamp_ms: i64,
}

impl TimelineEvent {
    /// Content a user authored and that bulk cleanup should remove.
    pub fn is_user_content(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "m.room.message" | "m.sticker" | "m.poll.start" | "org.matrix.msc3381.poll.start"
        )
    }
}

/// A notice sent to the room, with plain and HTML bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub body: String,
    pub formatted_body: String,
}

/// Tunables of the probation policy.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// How long a new member stays on probation.
    pub probation: Duration,
    /// Consecutive safe messages needed to leave probation early.
    pub required_valid_messages: u32,
    /// Text shorter than this (in characters) is not checked at all.
    pub min_message_length: usize,
    /// Check every sender, not only members on probation.
    pub check_all_members: bool,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            probation: Duration::from_secs(60 * 60 * 60), // 60 hours
            required_valid_messages: 5,
            min_message_length: 10,
            check_all_members: false,
        }
    }
}

/// Deliberate pauses around destructive operations, keeping us under the
/// homeserver's abuse limits.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Wait before queueing cleanup after a warning or a repeat-offense ban.
    pub settle_delay: Duration,
    /// Wait before queueing cleanup after a ban for explicit media.
    pub severe_settle_delay: Duration,
    /// Wait between two redactions of the same cleanup job.
    pub inter_deletion_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(5),
            severe_settle_delay: Duration::from_secs(10),
            inter_deletion_delay: Duration::from_secs(5),
        }
    }
}

impl Pacing {
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            severe_settle_delay: Duration::ZERO,
            inter_deletion_delay: Duration::ZERO,
        }
    }
}

/// Why a ban happened. Doubles as the reason string shown in the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanCause {
    Username,
    Avatar,
    Image,
    RoomAvatar,
    RepeatOffense,
}

impl BanCause {
    pub fn reason(&self) -> &'static str {
        match self {
            BanCause::Username => "Automoderator: Inappropriate username",
            BanCause::Avatar => "Automoderator: Inappropriate avatar",
            BanCause::Image => "Automoderator: Explicit image content",
            BanCause::RoomAvatar => "Automoderator: Inappropriate room avatar",
            BanCause::RepeatOffense => "Automoderator: Inappropriate content after warning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    BeforeStart,
    NotAJoin,
    OwnMessage,
    NotMonitored,
    TooShort,
    AlreadyDeleted,
    NoContent,
    Unsupported,
}

/// What the engine decided for one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationOutcome {
    Ignored(IgnoreReason),
    /// Join passed the username and avatar checks; probation started.
    ProbationStarted,
    /// Profile edit passed the checks; probation left as it was.
    ProfileChecked,
    /// Safe content that earned no credit (user is warned or not monitored).
    Passed,
    /// Safe content counted towards release.
    Counted { valid_messages: i64 },
    /// The user reached the threshold and left probation.
    Released,
    /// Unsafe content from a user who is not monitored; only removed.
    Redacted,
    Warned,
    Banned(BanCause),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_derivation() {
        assert_eq!(
            ProbationState::derive(false, None),
            ProbationState::Unmonitored
        );
        assert_eq!(
            ProbationState::derive(false, Some(1)),
            ProbationState::Unmonitored
        );
        assert_eq!(ProbationState::derive(true, None), ProbationState::Clean);
        assert_eq!(ProbationState::derive(true, Some(0)), ProbationState::Clean);
        assert_eq!(ProbationState::derive(true, Some(1)), ProbationState::Warned);
    }

    #[test]
    fn test_epoch_is_strict() {
        let epoch = ProcessEpoch::new(1_000);
        assert!(!epoch.observed(999));
        assert!(!epoch.observed(1_000));
        assert!(epoch.observed(1_001));
    }

    #[test]
    fn test_cleanup_covers_user_content_only() {
        let event = |event_type: &str| TimelineEvent {
            event_id: "$e".to_string(),
            sender: "@u:example.org".to_string(),
            event_type: event_type.to_string(),
            timestamp_ms: 0,
        };
        assert!(event("m.room.message").is_user_content());
        assert!(event("m.sticker").is_user_content());
        assert!(event("org.matrix.msc3381.poll.start").is_user_content());
        assert!(!event("m.room.member").is_user_content());
        assert!(!event("m.reaction").is_user_content());
    }
}
