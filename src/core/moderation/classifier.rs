// Content classifier - turns a typed content item into a Verdict.
//
// All content types share one call path into the AI provider; they differ
// only in policy text and payload shape. Nothing in here ever returns an
// error to the caller: failures become `Verdict::failed()`, which passes the
// content.

use super::action_gateway::MediaSource;
use super::moderation_models::Verdict;
use super::polls::PollText;
use super::prompt::{
    build_json_user_prompt, build_system_prompt, moderation_response_format,
    parse_moderation_response,
};
use crate::core::ai::{AiConfig, AiContentPart, AiMessage, AiProvider};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

const MAX_OUTPUT_TOKENS: u32 = 300;

const TEXT_POLICY: &str = "Decide whether a chat message is unsafe: offensive, harassing, doxxing, a scam or phishing attempt, marketing or spam, or otherwise harmful.";
const POLL_POLICY: &str = "Decide whether a poll is unsafe: explicit, offensive, a scam, marketing or spam.";
const IMAGE_POLICY: &str = "Decide whether an image is unsafe: explicit content, nudity, a scam or marketing.";
const AVATAR_POLICY: &str = "Decide whether a profile picture is unsafe: explicit content, nudity, a scam or marketing.";

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Invalid media reference: {0}")]
    InvalidMedia(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

/// A piece of content to judge.
#[derive(Debug, Clone, Copy)]
pub enum ContentItem<'a> {
    Text(&'a str),
    Username(&'a str),
    Poll(&'a PollText),
    /// Media reference of a posted image, sticker or room avatar.
    Image(&'a str),
    /// Media reference of a member's avatar.
    Avatar(&'a str),
}

impl ContentItem<'_> {
    fn label(&self) -> &'static str {
        match self {
            ContentItem::Text(_) => "text",
            ContentItem::Username(_) => "username",
            ContentItem::Poll(_) => "poll",
            ContentItem::Image(_) => "image",
            ContentItem::Avatar(_) => "avatar",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierModels {
    pub text: String,
    pub vision: String,
}

pub struct ContentClassifier<P: AiProvider> {
    provider: P,
    models: ClassifierModels,
    media: Arc<dyn MediaSource>,
    homeserver_url: String,
    room_language: String,
}

impl<P: AiProvider> ContentClassifier<P> {
    pub fn new(
        provider: P,
        models: ClassifierModels,
        media: Arc<dyn MediaSource>,
        homeserver_url: impl Into<String>,
        room_language: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            models,
            media,
            homeserver_url: homeserver_url.into(),
            room_language: room_language.into(),
        }
    }

    /// Judge one item. Never fails: errors are logged and the item passes.
    pub async fn classify(&self, item: ContentItem<'_>) -> Verdict {
        match self.try_classify(item).await {
            Ok(verdict) => {
                if !verdict.valid {
                    tracing::warn!(
                        "Classifier returned an unparseable {} verdict, treating as safe",
                        item.label()
                    );
                }
                verdict
            }
            Err(e) => {
                tracing::error!("Error checking {}: {}", item.label(), e);
                Verdict::failed()
            }
        }
    }

    async fn try_classify(&self, item: ContentItem<'_>) -> Result<Verdict, ClassifierError> {
        let (messages, model) = match item {
            ContentItem::Text(text) => (
                text_messages(
                    TEXT_POLICY,
                    "Classify the chat message below.",
                    json!({ "message": text }),
                ),
                &self.models.text,
            ),
            ContentItem::Username(name) => (
                text_messages(
                    &self.username_policy(),
                    "Classify the display name below.",
                    json!({ "username": name }),
                ),
                &self.models.text,
            ),
            ContentItem::Poll(poll) => (
                text_messages(
                    POLL_POLICY,
                    "Classify the poll below.",
                    json!({ "question": poll.question, "answers": poll.answers }),
                ),
                &self.models.text,
            ),
            ContentItem::Image(reference) => (
                vision_messages(
                    IMAGE_POLICY,
                    "Classify the attached image.",
                    self.resolve_media_url(reference)?,
                ),
                &self.models.vision,
            ),
            ContentItem::Avatar(reference) => (
                vision_messages(
                    AVATAR_POLICY,
                    "Classify the attached profile picture.",
                    self.resolve_media_url(reference)?,
                ),
                &self.models.vision,
            ),
        };

        let config = AiConfig {
            model: model.clone(),
            temperature: 0.0,
            max_tokens: Some(MAX_OUTPUT_TOKENS),
            response_format: Some(moderation_response_format()),
        };

        let raw = self
            .provider
            .chat_complete(&messages, &config)
            .await
            .map_err(|e| ClassifierError::Provider(e.to_string()))?;

        tracing::debug!("Classifier answered for {}: {}", item.label(), raw);
        Ok(parse_moderation_response(&raw))
    }

    fn username_policy(&self) -> String {
        format!(
            "Only judge usernames written in {}. Decide whether a username contains offensive or sexual content.",
            self.room_language
        )
    }

    /// Turn a media reference into a URL the classifier provider can fetch.
    ///
    /// `mxc://server/media` references are translated by the protocol client
    /// when it can, otherwise built from the homeserver URL. The access token
    /// is appended either way. Plain http(s) URLs pass through unchanged.
    pub fn resolve_media_url(&self, reference: &str) -> Result<String, ClassifierError> {
        if reference.starts_with("https://") || reference.starts_with("http://") {
            return Ok(reference.to_string());
        }

        let (server, media_id) = parse_mxc(reference)
            .ok_or_else(|| ClassifierError::InvalidMedia(reference.to_string()))?;

        let http_url = self.media.resolve_media(reference).unwrap_or_else(|| {
            format!(
                "{}/_matrix/client/v1/media/download/{}/{}",
                self.homeserver_url.trim_end_matches('/'),
                server,
                media_id
            )
        });

        Ok(match self.media.access_token() {
            Some(token) => {
                let separator = if http_url.contains('?') { '&' } else { '?' };
                format!(
                    "{}{}access_token={}",
                    http_url,
                    separator,
                    urlencoding::encode(&token)
                )
            }
            None => http_url,
        })
    }
}

/// Split `mxc://server/media_id` into its parts.
pub fn parse_mxc(reference: &str) -> Option<(&str, &str)> {
    let rest = reference.strip_prefix("mxc://")?;
    let (server, media_id) = rest.split_once('/')?;
    if server.is_empty() || media_id.is_empty() || media_id.contains('/') {
        return None;
    }
    Some((server, media_id))
}

fn text_messages(policy: &str, instructions: &str, payload: serde_json::Value) -> Vec<AiMessage> {
    vec![
        AiMessage::system(build_system_prompt(policy)),
        AiMessage::user(build_json_user_prompt(instructions, &payload)),
    ]
}

fn vision_messages(policy: &str, instructions: &str, url: String) -> Vec<AiMessage> {
    vec![
        AiMessage::system(build_system_prompt(policy)),
        AiMessage::user_parts(vec![
            AiContentPart::text(instructions),
            AiContentPart::image(url),
        ]),
    ]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::error::Error;
    use std::sync::Mutex;

    /// Provider double: flags any request whose text or image URL contains a trigger word.
    pub(crate) struct MockProvider {
        pub triggers: Vec<String>,
        /// Reply verbatim instead of judging.
        pub canned_reply: Option<String>,
        pub fail: bool,
        pub requests: Mutex<Vec<(Vec<AiMessage>, AiConfig)>>,
    }

    impl MockProvider {
        pub(crate) fn flagging(triggers: &[&str]) -> Self {
            Self {
                triggers: triggers.iter().map(|t| t.to_string()).collect(),
                canned_reply: None,
                fail: false,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::flagging(&[])
            }
        }

        pub(crate) fn replying(reply: &str) -> Self {
            Self {
                canned_reply: Some(reply.to_string()),
                ..Self::flagging(&[])
            }
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AiProvider for MockProvider {
        async fn chat_complete(
            &self,
            messages: &[AiMessage],
            config: &AiConfig,
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.requests
                .lock()
                .unwrap()
                .push((messages.to_vec(), config.clone()));

            if self.fail {
                return Err("connection reset by peer".into());
            }
            if let Some(reply) = &self.canned_reply {
                return Ok(reply.clone());
            }

            let user = messages.last().ok_or("no messages")?;
            let haystack = format!("{} {}", user.text(), user.image_urls().join(" "));
            let flagged = self.triggers.iter().any(|t| haystack.contains(t.as_str()));
            Ok(json!({ "unsafe": flagged, "reasoning": "test" }).to_string())
        }
    }

    pub(crate) struct MockMedia {
        pub translated: Option<String>,
        pub token: Option<String>,
    }

    impl MediaSource for MockMedia {
        fn resolve_media(&self, _reference: &str) -> Option<String> {
            self.translated.clone()
        }

        fn access_token(&self) -> Option<String> {
            self.token.clone()
        }
    }

    pub(crate) fn untranslated_media() -> Arc<dyn MediaSource> {
        Arc::new(MockMedia {
            translated: None,
            token: Some("secret token".to_string()),
        })
    }

    pub(crate) fn models() -> ClassifierModels {
        ClassifierModels {
            text: "text-model".to_string(),
            vision: "vision-model".to_string(),
        }
    }

    fn classifier(provider: MockProvider) -> ContentClassifier<MockProvider> {
        ContentClassifier::new(
            provider,
            models(),
            untranslated_media(),
            "https://matrix.example.org/",
            "English",
        )
    }

    #[tokio::test]
    async fn test_text_is_sent_as_json_data() {
        let classifier = classifier(MockProvider::flagging(&["buy crypto"]));

        let verdict = classifier
            .classify(ContentItem::Text("buy crypto here now"))
            .await;
        assert_eq!(verdict, Verdict::flagged());

        let requests = classifier.provider.requests.lock().unwrap();
        let (messages, config) = &requests[0];
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].text().contains("inert evidence"));
        assert!(messages[1]
            .text()
            .contains(r#""message": "buy crypto here now""#));
        assert_eq!(config.model, "text-model");
        assert_eq!(config.max_tokens, Some(300));
        assert!(config.response_format.is_some());
    }

    #[tokio::test]
    async fn test_username_policy_names_room_language() {
        let classifier = classifier(MockProvider::flagging(&[]));

        let verdict = classifier.classify(ContentItem::Username("alice")).await;
        assert_eq!(verdict, Verdict::safe());

        let requests = classifier.provider.requests.lock().unwrap();
        assert!(requests[0].0[0].text().contains("written in English"));
    }

    #[tokio::test]
    async fn test_poll_payload_carries_question_and_answers() {
        let classifier = classifier(MockProvider::flagging(&["casino"]));
        let poll = PollText {
            question: "Where should we go?".to_string(),
            answers: vec!["park".to_string(), "casino bonus link".to_string()],
        };

        assert!(classifier.classify(ContentItem::Poll(&poll)).await.unsafe_content);
    }

    #[tokio::test]
    async fn test_image_uses_vision_model_and_fallback_url() {
        let classifier = classifier(MockProvider::flagging(&["nsfw"]));

        let verdict = classifier
            .classify(ContentItem::Image("mxc://example.org/nsfwMedia"))
            .await;
        assert!(verdict.unsafe_content);

        let requests = classifier.provider.requests.lock().unwrap();
        let (messages, config) = &requests[0];
        assert_eq!(config.model, "vision-model");
        assert_eq!(
            messages[1].image_urls(),
            vec!["https://matrix.example.org/_matrix/client/v1/media/download/example.org/nsfwMedia?access_token=secret%20token"]
        );
    }

    #[test]
    fn test_client_translation_is_preferred() {
        let classifier = ContentClassifier::new(
            MockProvider::flagging(&[]),
            models(),
            Arc::new(MockMedia {
                translated: Some("https://media.example.org/dl/abc".to_string()),
                token: Some("t".to_string()),
            }),
            "https://matrix.example.org",
            "English",
        );

        assert_eq!(
            classifier.resolve_media_url("mxc://example.org/abc").unwrap(),
            "https://media.example.org/dl/abc?access_token=t"
        );
        assert_eq!(
            classifier
                .resolve_media_url("https://cdn.example.org/a.png")
                .unwrap(),
            "https://cdn.example.org/a.png"
        );
    }

    #[tokio::test]
    async fn test_bad_media_reference_fails_open_without_calling_provider() {
        let classifier = classifier(MockProvider::flagging(&["mxc"]));

        let verdict = classifier.classify(ContentItem::Avatar("mxc://broken")).await;

        assert_eq!(verdict, Verdict::failed());
        assert_eq!(classifier.provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_errors_fail_open() {
        let classifier = classifier(MockProvider::failing());
        assert_eq!(
            classifier.classify(ContentItem::Text("anything at all")).await,
            Verdict::failed()
        );
    }

    #[tokio::test]
    async fn test_free_form_reply_is_invalid_and_safe() {
        let classifier = classifier(MockProvider::replying("true"));
        assert_eq!(
            classifier.classify(ContentItem::Text("anything at all")).await,
            Verdict::failed()
        );
    }

    #[test]
    fn test_parse_mxc() {
        assert_eq!(
            parse_mxc("mxc://example.org/abc123"),
            Some(("example.org", "abc123"))
        );
        assert_eq!(parse_mxc("mxc://example.org/"), None);
        assert_eq!(parse_mxc("mxc://example.org"), None);
        assert_eq!(parse_mxc("https://example.org/abc"), None);
    }
}
