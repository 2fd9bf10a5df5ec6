// Matrix client-server API client.
//
// Implements the room and media ports of the core over plain HTTP, and keeps
// a bounded copy of each room's timeline so bulk cleanup can find a user's
// recent events without paginating history.

use crate::core::moderation::classifier::parse_mxc;
use crate::core::moderation::{GatewayError, MediaSource, Notice, RoomGateway, TimelineEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Events kept per room for cleanup.
pub const TIMELINE_LIMIT: usize = 1000;

/// Long-poll window of a sync request.
const SYNC_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
    device_id: Option<String>,
    well_known: Option<WellKnown>,
}

#[derive(Debug, Deserialize)]
struct WellKnown {
    #[serde(rename = "m.homeserver")]
    homeserver: Option<HomeserverInfo>,
}

#[derive(Debug, Deserialize)]
struct HomeserverInfo {
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: Option<SyncRooms>,
}

#[derive(Debug, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Option<RoomTimeline>,
}

#[derive(Debug, Deserialize)]
struct RoomTimeline {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    errcode: Option<String>,
    error: Option<String>,
    retry_after_ms: Option<u64>,
}

/// One sync response, reduced to what the dispatcher needs.
#[derive(Debug, Default)]
pub struct SyncBatch {
    pub next_batch: String,
    /// Raw timeline events per joined room, oldest first.
    pub timelines: HashMap<String, Vec<Value>>,
}

pub struct MatrixHttpClient {
    client: Client,
    homeserver_url: String,
    user_id: String,
    access_token: String,
    /// Base URL advertised by the homeserver at login, used for media downloads.
    media_base_url: Option<String>,
    timelines: DashMap<String, VecDeque<TimelineEvent>>,
}

impl MatrixHttpClient {
    /// Log in with a password and return a ready client.
    pub async fn login(
        homeserver_url: &str,
        username: &str,
        password: &str,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(SYNC_TIMEOUT_MS + 30_000))
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        let homeserver_url = homeserver_url.trim_end_matches('/').to_string();

        let response = client
            .post(format!("{}/_matrix/client/v3/login", homeserver_url))
            .json(&json!({
                "type": "m.login.password",
                "identifier": { "type": "m.id.user", "user": username },
                "password": password,
                "initial_device_display_name": "Matrix moderation bot",
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let login: LoginResponse = read_json(response).await?;
        tracing::info!(
            user_id = %login.user_id,
            device_id = login.device_id.as_deref().unwrap_or("unknown"),
            "Logged in to Matrix"
        );

        Ok(Self {
            client,
            homeserver_url,
            user_id: login.user_id,
            access_token: login.access_token,
            media_base_url: login
                .well_known
                .and_then(|w| w.homeserver)
                .map(|h| h.base_url.trim_end_matches('/').to_string()),
            timelines: DashMap::new(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn homeserver_url(&self) -> &str {
        &self.homeserver_url
    }

    /// Long-poll for new events, restricted to `room_id`.
    pub async fn sync(&self, since: Option<&str>, room_id: &str) -> Result<SyncBatch, GatewayError> {
        let filter = json!({
            "room": {
                "rooms": [room_id],
                "timeline": { "limit": 50 },
                "state": { "lazy_load_members": true },
            },
            "presence": { "not_types": ["*"] },
            "account_data": { "not_types": ["*"] },
        })
        .to_string();

        let timeout = SYNC_TIMEOUT_MS.to_string();
        let mut query: Vec<(&str, &str)> =
            vec![("timeout", timeout.as_str()), ("filter", filter.as_str())];
        if let Some(since) = since {
            query.push(("since", since));
        }

        let response = self
            .client
            .get(format!("{}/_matrix/client/v3/sync", self.homeserver_url))
            .bearer_auth(&self.access_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let sync: SyncResponse = read_json(response).await?;
        let timelines = sync
            .rooms
            .map(|rooms| {
                rooms
                    .join
                    .into_iter()
                    .map(|(room, joined)| {
                        (room, joined.timeline.map(|t| t.events).unwrap_or_default())
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(SyncBatch {
            next_batch: sync.next_batch,
            timelines,
        })
    }

    /// Add an event to the room's buffered timeline, dropping the oldest past the limit.
    pub fn remember_event(&self, room_id: &str, event: TimelineEvent) {
        let mut timeline = self.timelines.entry(room_id.to_string()).or_default();
        if timeline.iter().any(|e| e.event_id == event.event_id) {
            return;
        }
        timeline.push_back(event);
        while timeline.len() > TIMELINE_LIMIT {
            timeline.pop_front();
        }
    }

    /// Drop a redacted event from the buffer.
    pub fn forget_event(&self, room_id: &str, event_id: &str) {
        if let Some(mut timeline) = self.timelines.get_mut(room_id) {
            timeline.retain(|e| e.event_id != event_id);
        }
    }

    async fn send_authed(&self, method: Method, path: &str, body: Value) -> Result<(), GatewayError> {
        let response = self
            .client
            .request(method, format!("{}{}", self.homeserver_url, path))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let _: Value = read_json(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RoomGateway for MatrixHttpClient {
    async fn redact_event(&self, room_id: &str, event_id: &str) -> Result<(), GatewayError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/redact/{}/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(event_id),
            transaction_id()
        );
        self.send_authed(Method::PUT, &path, json!({})).await?;
        self.forget_event(room_id, event_id);
        Ok(())
    }

    async fn ban_user(&self, room_id: &str, user_id: &str, reason: &str) -> Result<(), GatewayError> {
        let path = format!("/_matrix/client/v3/rooms/{}/ban", urlencoding::encode(room_id));
        self.send_authed(
            Method::POST,
            &path,
            json!({ "user_id": user_id, "reason": reason }),
        )
        .await
    }

    async fn send_notice(&self, room_id: &str, notice: &Notice) -> Result<(), GatewayError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/send/m.room.message/{}",
            urlencoding::encode(room_id),
            transaction_id()
        );
        self.send_authed(Method::PUT, &path, notice_content(notice)).await
    }

    async fn room_timeline(&self, room_id: &str) -> Result<Vec<TimelineEvent>, GatewayError> {
        Ok(self
            .timelines
            .get(room_id)
            .map(|timeline| timeline.iter().cloned().collect())
            .unwrap_or_default())
    }
}

impl MediaSource for MatrixHttpClient {
    fn resolve_media(&self, reference: &str) -> Option<String> {
        let base = self.media_base_url.as_deref()?;
        let (server, media_id) = parse_mxc(reference)?;
        Some(format!(
            "{}/_matrix/client/v1/media/download/{}/{}",
            base, server, media_id
        ))
    }

    fn access_token(&self) -> Option<String> {
        Some(self.access_token.clone())
    }
}

fn notice_content(notice: &Notice) -> Value {
    json!({
        "msgtype": "m.text",
        "body": notice.body,
        "format": "org.matrix.custom.html",
        "formatted_body": notice.formatted_body,
    })
}

fn transaction_id() -> String {
    format!(
        "mod{}.{}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, GatewayError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| GatewayError::Http(e.to_string()))?;

    if !status.is_success() {
        return Err(map_error(status, &text));
    }

    serde_json::from_str(&text).map_err(|e| GatewayError::Protocol(e.to_string()))
}

/// Turn a failed response into a gateway error.
fn map_error(status: StatusCode, body: &str) -> GatewayError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let errcode = parsed.as_ref().and_then(|b| b.errcode.clone()).unwrap_or_default();
    let message = parsed
        .as_ref()
        .and_then(|b| b.error.clone())
        .unwrap_or_else(|| body.to_string());

    if status == StatusCode::TOO_MANY_REQUESTS || errcode == "M_LIMIT_EXCEEDED" {
        return GatewayError::RateLimited {
            retry_after: parsed
                .and_then(|b| b.retry_after_ms)
                .map(Duration::from_millis),
        };
    }

    match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GatewayError::Unauthorized(format!("{} {}", errcode, message).trim().to_string())
        }
        _ => GatewayError::Http(format!("{}: {}", status, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client(media_base_url: Option<&str>) -> MatrixHttpClient {
        MatrixHttpClient {
            client: Client::new(),
            homeserver_url: "https://matrix.example.org".to_string(),
            user_id: "@automod:example.org".to_string(),
            access_token: "token".to_string(),
            media_base_url: media_base_url.map(str::to_string),
            timelines: DashMap::new(),
        }
    }

    fn event(id: &str) -> TimelineEvent {
        TimelineEvent {
            event_id: id.to_string(),
            sender: "@u:example.org".to_string(),
            event_type: "m.room.message".to_string(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_rate_limit_errors() {
        let err = map_error(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"errcode":"M_LIMIT_EXCEEDED","error":"Too many requests","retry_after_ms":2500}"#,
        );
        assert!(matches!(
            err,
            GatewayError::RateLimited { retry_after: Some(d) } if d == Duration::from_millis(2500)
        ));

        // Some homeservers send the errcode with a different status.
        let err = map_error(StatusCode::BAD_REQUEST, r#"{"errcode":"M_LIMIT_EXCEEDED"}"#);
        assert!(matches!(err, GatewayError::RateLimited { retry_after: None }));

        let err = map_error(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, GatewayError::RateLimited { retry_after: None }));
    }

    #[test]
    fn test_other_errors() {
        assert!(matches!(
            map_error(StatusCode::NOT_FOUND, r#"{"errcode":"M_NOT_FOUND","error":"Event not found"}"#),
            GatewayError::NotFound(msg) if msg == "Event not found"
        ));
        assert!(matches!(
            map_error(StatusCode::FORBIDDEN, r#"{"errcode":"M_FORBIDDEN","error":"no power"}"#),
            GatewayError::Unauthorized(_)
        ));
        assert!(matches!(
            map_error(StatusCode::BAD_GATEWAY, "<html>"),
            GatewayError::Http(_)
        ));
    }

    #[tokio::test]
    async fn test_timeline_buffer_is_bounded_and_forgets_redactions() {
        let client = offline_client(None);
        for n in 0..TIMELINE_LIMIT + 5 {
            client.remember_event("!r:x", event(&format!("$e{n}")));
        }
        client.remember_event("!r:x", event("$e1004"));

        let timeline = client.room_timeline("!r:x").await.unwrap();
        assert_eq!(timeline.len(), TIMELINE_LIMIT);
        assert_eq!(timeline[0].event_id, "$e5");

        client.forget_event("!r:x", "$e5");
        let timeline = client.room_timeline("!r:x").await.unwrap();
        assert_eq!(timeline[0].event_id, "$e6");
        assert!(client.room_timeline("!other:x").await.unwrap().is_empty());
    }

    #[test]
    fn test_media_resolution_needs_well_known_base() {
        let client = offline_client(Some("https://hs.example.org"));
        assert_eq!(
            client.resolve_media("mxc://example.org/abc").as_deref(),
            Some("https://hs.example.org/_matrix/client/v1/media/download/example.org/abc")
        );
        assert_eq!(client.resolve_media("not-mxc"), None);
        assert_eq!(offline_client(None).resolve_media("mxc://example.org/abc"), None);
        assert_eq!(client.access_token().as_deref(), Some("token"));
    }

    #[test]
    fn test_notice_is_html_formatted() {
        let content = notice_content(&Notice {
            body: "plain".to_string(),
            formatted_body: "<b>html</b>".to_string(),
        });
        assert_eq!(content["msgtype"], "m.text");
        assert_eq!(content["format"], "org.matrix.custom.html");
        assert_eq!(content["formatted_body"], "<b>html</b>");
    }

    #[test]
    fn test_transaction_ids_differ() {
        assert_ne!(transaction_id(), transaction_id());
    }
}
