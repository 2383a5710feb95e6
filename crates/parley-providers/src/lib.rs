//! AI responder abstraction.
//!
//! A [`Responder`] answers an ordered conversation with a single text reply,
//! either from text alone ([`Responder::complete`]) or with one inline image
//! ([`Responder::complete_vision`]). Implementations make exactly one request
//! per call; retries and fallbacks are the caller's policy.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod format;
pub mod openai;

pub use format::turns_to_messages;

/// Speaker of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl From<parley_core::types::Role> for ChatRole {
    fn from(role: parley_core::types::Role) -> Self {
        match role {
            parley_core::types::Role::User => Self::User,
            parley_core::types::Role::Assistant => Self::Assistant,
        }
    }
}

/// One message in a responder request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// The image-bearing final user message of a vision request.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// Text sent alongside the image.
    pub prompt: String,
    pub media_type: String,
    pub data: Bytes,
}

impl ImagePayload {
    pub fn new(prompt: impl Into<String>, media_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            prompt: prompt.into(),
            media_type: media_type.into(),
            data,
        }
    }

    /// `data:<media_type>;base64,<data>` URL for inline transmission.
    pub fn data_url(&self) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(&self.data);
        format!("data:{};base64,{b64}", self.media_type)
    }
}

/// Chat + vision completion service.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Responder identifier (e.g., "xai").
    fn id(&self) -> &str;

    /// Text-only completion over the ordered messages.
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String>;

    /// Completion where the final user message carries `image`.
    async fn complete_vision(
        &self,
        messages: &[ChatMessage],
        image: &ImagePayload,
    ) -> anyhow::Result<String>;
}
