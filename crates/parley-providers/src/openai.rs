//! OpenAI-compatible Chat Completions responder.
//!
//! Talks to any `/v1/chat/completions` endpoint (xAI, OpenAI, OpenRouter, ...)
//! with single non-streaming requests. Vision requests append the image as an
//! `image_url` part of the final user message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use parley_core::config::ResponderConfig;

use crate::{ChatMessage, ImagePayload, Responder};

const XAI_BASE_URL: &str = "https://api.x.ai";
const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiResponder {
    pub base_url: String,
    provider_id: String,
    api_key: String,
    model: String,
    vision_model: String,
    temperature: Option<f64>,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiResponder {
    pub fn xai(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self::with_base("xai", XAI_BASE_URL, api_key.into(), base_url)
    }

    pub fn openai(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self::with_base("openai", OPENAI_BASE_URL, api_key.into(), base_url)
    }

    fn with_base(id: &str, default_base: &str, api_key: String, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(default_base)
                .trim_end_matches('/')
                .to_string(),
            provider_id: id.into(),
            api_key,
            model: "grok-2-latest".into(),
            vision_model: "grok-2-vision".into(),
            temperature: Some(0.7),
            max_tokens: 2000,
            client: reqwest::Client::new(),
        }
    }

    /// Build from the `responder` config section. Fails if no API key resolves.
    pub fn from_config(config: &ResponderConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No responder API key configured"))?;
        Ok(Self::xai(api_key, config.base_url.as_deref())
            .with_models(&config.model, &config.vision_model)
            .with_sampling(Some(config.temperature), config.max_tokens))
    }

    pub fn with_models(mut self, model: &str, vision_model: &str) -> Self {
        self.model = model.to_string();
        self.vision_model = vision_model.to_string();
        self
    }

    pub fn with_sampling(mut self, temperature: Option<f64>, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn request_body(&self, model: &str, messages: Vec<serde_json::Value>) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages,
            max_tokens: self.max_tokens,
            stream: false,
            temperature: self.temperature,
        }
    }

    async fn send(&self, body: &ChatRequest) -> anyhow::Result<String> {
        debug!(
            model = %body.model,
            base_url = %self.base_url,
            messages = body.messages.len(),
            "Requesting chat completion"
        );

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Responder API error {status}: {body}");
        }

        let completion: ChatCompletion = response.json().await?;
        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn text_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect()
}

fn vision_message(image: &ImagePayload) -> serde_json::Value {
    json!({
        "role": "user",
        "content": [
            { "type": "text", "text": image.prompt },
            {
                "type": "image_url",
                "image_url": { "url": image.data_url(), "detail": "high" }
            }
        ]
    })
}

#[async_trait]
impl Responder for OpenAiResponder {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let body = self.request_body(&self.model, text_messages(messages));
        self.send(&body).await
    }

    async fn complete_vision(
        &self,
        messages: &[ChatMessage],
        image: &ImagePayload,
    ) -> anyhow::Result<String> {
        let mut parts = text_messages(messages);
        parts.push(vision_message(image));
        let body = self.request_body(&self.vision_model, parts);
        self.send(&body).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_xai_responder_creation() {
        let responder = OpenAiResponder::xai("key", None);
        assert_eq!(responder.id(), "xai");
        assert_eq!(responder.base_url, XAI_BASE_URL);
    }

    #[test]
    fn test_custom_base_url() {
        let responder = OpenAiResponder::openai("key", Some("https://my-proxy.example.com/"));
        assert_eq!(responder.id(), "openai");
        assert_eq!(responder.base_url, "https://my-proxy.example.com");
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = ResponderConfig {
            api_key: None,
            api_key_env: None,
            ..ResponderConfig::default()
        };
        assert!(OpenAiResponder::from_config(&config).is_err());

        let config = ResponderConfig {
            api_key: Some("k".into()),
            model: "grok-3".into(),
            ..ResponderConfig::default()
        };
        let responder = OpenAiResponder::from_config(&config).unwrap();
        assert_eq!(responder.model, "grok-3");
        assert_eq!(responder.vision_model, "grok-2-vision");
    }

    #[test]
    fn test_text_body_shape() {
        let responder = OpenAiResponder::xai("key", None);
        let body = responder.request_body(
            "grok-2-latest",
            text_messages(&[ChatMessage::system("be nice"), ChatMessage::user("hello")]),
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "grok-2-latest");
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hello");
        assert_eq!(json["max_tokens"], 2000);
    }

    #[test]
    fn test_vision_message_carries_image_part() {
        let image = ImagePayload::new("what is this?", "image/png", Bytes::from_static(b"png"));
        let msg = vision_message(&image);
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["content"][0]["text"], "what is this?");
        assert_eq!(msg["content"][1]["type"], "image_url");
        assert_eq!(msg["content"][1]["image_url"]["detail"], "high");
        assert!(
            msg["content"][1]["image_url"]["url"]
                .as_str()
                .unwrap()
                .starts_with("data:image/png;base64,")
        );
    }
}
