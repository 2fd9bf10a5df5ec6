use crate::core::ai::{
    models::{AiConfig, AiMessage},
    AiProvider,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::error::Error;
use std::time::Duration;

/// Client for any OpenAI-compatible chat completions endpoint.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl AiProvider for OpenAiClient {
    async fn chat_complete(
        &self,
        messages: &[AiMessage],
        config: &AiConfig,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut payload = json!({
            "model": config.model,
            "messages": messages,
            "temperature": config.temperature,
        });
        if let Some(max_tokens) = config.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(format) = &config.response_format {
            payload["response_format"] = format.clone();
        }

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(format!("OpenAI API error: {} - {}", status, text).into());
        }

        let response_json: serde_json::Value = response.json().await?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or("Failed to parse response content")?
            .to_string();

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completions_url_ignores_trailing_slash() {
        let client =
            OpenAiClient::new("key".to_string(), "https://api.openai.com/v1/".to_string())
                .unwrap();
        assert_eq!(
            client.completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}
