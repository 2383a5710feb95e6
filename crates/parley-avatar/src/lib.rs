//! Talking-avatar renderers.
//!
//! An [`AvatarRenderer`] owns the remote session lifecycle: `start` opens a
//! session and returns its media stream plus an event channel, `speak` makes
//! the avatar say a reply, `stop` ends the session. The orchestrator only
//! relies on [`AvatarEvent::StoppedTalking`] to decide when to listen again.

pub mod console;
pub mod heygen;
mod talk;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use parley_core::config::AvatarConfig;

pub use heygen::AvatarStartError;

/// Opaque renderer session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Avatar identity and rendering quality for a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub avatar_id: String,
    pub voice_id: String,
    pub quality: String,
}

impl VoiceConfig {
    /// `None` if the avatar or voice id does not resolve.
    pub fn from_config(config: &AvatarConfig) -> Option<Self> {
        Some(Self {
            avatar_id: config.resolve_avatar_id()?,
            voice_id: config.resolve_voice_id()?,
            quality: config.quality.clone(),
        })
    }
}

/// Where a viewer can attach to the avatar's audio/video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStreamInfo {
    pub url: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarEvent {
    StartedTalking,
    StoppedTalking,
}

/// A running renderer session.
#[derive(Debug)]
pub struct AvatarSession {
    pub handle: SessionHandle,
    pub media: Option<MediaStreamInfo>,
    pub events: mpsc::UnboundedReceiver<AvatarEvent>,
}

#[async_trait]
pub trait AvatarRenderer: Send + Sync + 'static {
    fn id(&self) -> &str;

    async fn start(&self, voice: &VoiceConfig) -> anyhow::Result<AvatarSession>;

    async fn speak(&self, session: &SessionHandle, text: &str) -> anyhow::Result<()>;

    async fn stop(&self, session: &SessionHandle) -> anyhow::Result<()>;
}

/// User-facing description of an avatar start failure.
pub fn describe_start_error(error: &anyhow::Error) -> String {
    match error.downcast_ref::<AvatarStartError>() {
        Some(start_error) => start_error.user_message(),
        None => AvatarStartError::GENERIC_MESSAGE.to_string(),
    }
}
