use super::models::{AiConfig, AiMessage};
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Sends a chat completion request and returns the raw text of the first choice.
    async fn chat_complete(
        &self,
        messages: &[AiMessage],
        config: &AiConfig,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;
}

// Lets a provider be shared between the classifier and whoever else needs it.
#[async_trait]
impl<T: AiProvider + ?Sized> AiProvider for Arc<T> {
    async fn chat_complete(
        &self,
        messages: &[AiMessage],
        config: &AiConfig,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        (**self).chat_complete(messages, config).await
    }
}
