//! Vision model access.
//!
//! We talk to any OpenAI-compatible `/chat/completions` endpoint, which in
//! practice is a LiteLLM proxy in front of Gemini.

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateChatCompletionResponse, FinishReason},
};
use serde_json::json;

use crate::{
    data_url::data_url,
    prelude::*,
    retry::{
        AttemptResult, retry_result_fatal, retry_result_ok, retry_result_transient,
        try_fatal, try_potentially_transient, with_timeout,
    },
};

/// A page image ready to send to a model.
#[derive(Clone, Debug)]
pub struct PageImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A model that can read page images and rewrite text.
#[async_trait]
pub trait VisionModel: Send + Sync + 'static {
    /// The model name recorded in page metadata.
    fn model_id(&self) -> &str;

    /// Transcribe `image` following `prompt`.
    async fn transcribe(&self, prompt: &str, image: &PageImage) -> AttemptResult<String>;

    /// Answer a text-only prompt.
    async fn complete_text(&self, prompt: &str) -> AttemptResult<String>;
}

/// A [`VisionModel`] behind an OpenAI-compatible API.
pub struct OpenAiVisionModel {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Option<Duration>,
}

impl OpenAiVisionModel {
    /// Configure a client from `OPENAI_API_KEY` and `OPENAI_API_BASE`.
    pub fn from_env(model: &str, timeout: Option<Duration>) -> Self {
        let mut config = OpenAIConfig::new();
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            config = config.with_api_key(api_key);
        }
        if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
            config = config.with_api_base(api_base);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_owned(),
            timeout,
        }
    }

    async fn chat(&self, content: Value) -> AttemptResult<String> {
        let request = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
        });
        let chat = self.client.chat();
        let response: Value = try_potentially_transient!(
            with_timeout(self.timeout, chat.create_byot(request)).await
        );
        trace!(%response, "chat completion response");
        let response = try_fatal!(
            serde_json::from_value::<CreateChatCompletionResponse>(response)
                .context("could not parse chat completion response")
        );

        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("no choices in model response"));
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!(
                "content filter triggered (may be a RECITATION error from Gemini)"
            ));
        }
        match choice.message.content.as_deref() {
            Some(text) if !text.trim().is_empty() => retry_result_ok(text.to_owned()),
            _ => retry_result_transient(anyhow!("model returned no text")),
        }
    }
}

#[async_trait]
impl VisionModel for OpenAiVisionModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    #[instrument(level = "trace", skip_all)]
    async fn transcribe(&self, prompt: &str, image: &PageImage) -> AttemptResult<String> {
        let url = data_url(&image.mime_type, &image.data);
        self.chat(json!([
            { "type": "text", "text": prompt },
            { "type": "image_url", "image_url": { "url": url } },
        ]))
        .await
    }

    #[instrument(level = "trace", skip_all)]
    async fn complete_text(&self, prompt: &str) -> AttemptResult<String> {
        self.chat(json!(prompt)).await
    }
}
