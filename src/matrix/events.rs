// Translation of raw sync events into core event types.

use crate::core::moderation::{
    Membership, MembershipEvent, RoomEvent, RoomEventKind, TimelineEvent,
};
use serde::Deserialize;
use serde_json::Value;

/// What a raw timeline event means to the moderation engine.
#[derive(Debug, Clone)]
pub enum Inbound {
    Membership(MembershipEvent),
    Room(RoomEvent),
    /// Someone (often us) redacted an earlier event.
    Redaction { redacts: String },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    event_id: Option<String>,
    sender: String,
    #[serde(default)]
    origin_server_ts: i64,
    #[serde(default)]
    content: Value,
    state_key: Option<String>,
    #[serde(default)]
    unsigned: Value,
    redacts: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MemberContent {
    membership: Option<String>,
    displayname: Option<String>,
    avatar_url: Option<String>,
}

/// Entry for the room's cleanup buffer.
pub fn timeline_entry(raw: &Value) -> Option<TimelineEvent> {
    let event = RawEvent::deserialize(raw).ok()?;
    Some(TimelineEvent {
        event_id: event.event_id?,
        sender: event.sender,
        event_type: event.event_type,
        timestamp_ms: event.origin_server_ts,
    })
}

/// Translate a raw event. Events the engine has no interest in give `None`.
pub fn translate(room_id: &str, raw: &Value) -> Option<Inbound> {
    let event = match RawEvent::deserialize(raw) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!("Skipping malformed event: {}", e);
            return None;
        }
    };

    match event.event_type.as_str() {
        "m.room.redaction" => {
            let redacts = event.redacts.or_else(|| {
                event
                    .content
                    .get("redacts")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })?;
            Some(Inbound::Redaction { redacts })
        }
        "m.room.member" => Some(Inbound::Membership(membership_event(room_id, event)?)),
        _ => {
            let kind = content_kind(&event.event_type, &event.content)?;
            Some(Inbound::Room(RoomEvent {
                event_id: event.event_id?,
                room_id: room_id.to_string(),
                sender: event.sender,
                timestamp_ms: event.origin_server_ts,
                kind,
            }))
        }
    }
}

fn membership_event(room_id: &str, event: RawEvent) -> Option<MembershipEvent> {
    let user_id = event.state_key?;
    let content = MemberContent::deserialize(&event.content).unwrap_or_default();
    let membership = Membership::parse(content.membership.as_deref().unwrap_or_default());

    let previous = event
        .unsigned
        .get("prev_content")
        .and_then(|prev| prev.get("membership"))
        .and_then(Value::as_str);
    let is_profile_change = membership == Membership::Join && previous == Some("join");

    let display_name = content
        .displayname
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| localpart(&user_id).to_string());

    Some(MembershipEvent {
        room_id: room_id.to_string(),
        user_id,
        display_name,
        membership,
        avatar_url: content.avatar_url.filter(|url| !url.is_empty()),
        timestamp_ms: event.origin_server_ts,
        is_profile_change,
    })
}

fn content_kind(event_type: &str, content: &Value) -> Option<RoomEventKind> {
    let url = || media_url(content);

    let kind = match event_type {
        "m.room.message" => {
            let msgtype = content.get("msgtype").and_then(Value::as_str).unwrap_or("");
            match msgtype {
                "m.text" | "m.emote" | "m.notice" => RoomEventKind::Text {
                    body: content
                        .get("body")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
                "m.image" => RoomEventKind::Image { url: url() },
                "" => RoomEventKind::Unsupported {
                    event_type: event_type.to_string(),
                },
                other => RoomEventKind::Unsupported {
                    event_type: format!("{}/{}", event_type, other),
                },
            }
        }
        "m.sticker" => RoomEventKind::Sticker { url: url() },
        "m.poll.start" | "org.matrix.msc3381.poll.start" => RoomEventKind::PollStart {
            content: content.clone(),
        },
        "m.room.avatar" => RoomEventKind::RoomAvatar { url: url() },
        _ => return None,
    };
    Some(kind)
}

/// Media reference of an image-like event, plain or encrypted.
fn media_url(content: &Value) -> Option<String> {
    content
        .get("url")
        .or_else(|| content.get("file").and_then(|f| f.get("url")))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

fn localpart(user_id: &str) -> &str {
    user_id
        .trim_start_matches('@')
        .split(':')
        .next()
        .unwrap_or(user_id)
}
