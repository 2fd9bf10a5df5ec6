use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One role-tagged message sent to the classification provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiMessage {
    pub role: String,
    pub content: AiContent,
}

/// Message body. Plain text for chat models, a list of parts when an image
/// has to travel alongside the instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AiContent {
    Text(String),
    Parts(Vec<AiContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AiContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl AiMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: AiContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: AiContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<AiContentPart>) -> Self {
        Self {
            role: "user".to_string(),
            content: AiContent::Parts(parts),
        }
    }

    /// Concatenated text of the message, ignoring image parts.
    pub fn text(&self) -> String {
        match &self.content {
            AiContent::Text(text) => text.clone(),
            AiContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    AiContentPart::Text { text } => Some(text.as_str()),
                    AiContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match &self.content {
            AiContent::Text(_) => Vec::new(),
            AiContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    AiContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                    AiContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

impl AiContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        AiContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        AiContentPart::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Structured-output schema passed through as the `response_format` field.
    pub response_format: Option<Value>,
}
