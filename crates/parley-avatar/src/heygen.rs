//! HeyGen streaming avatar client.
//!
//! Session lifecycle over the HeyGen REST API:
//! `streaming.create_token` → `streaming.new` (v2, LiveKit media) →
//! `streaming.start` → `streaming.task`* → `streaming.stop`.
//! Talking state is derived from the `duration_ms` each task reports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use parley_core::config::AvatarConfig;

use crate::talk::{TalkTracker, estimate_duration};
use crate::{AvatarRenderer, AvatarSession, MediaStreamInfo, SessionHandle, VoiceConfig};

const HEYGEN_BASE_URL: &str = "https://api.heygen.com";

/// Failure to open an avatar session.
#[derive(Debug, Error)]
pub enum AvatarStartError {
    #[error("HeyGen API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("HeyGen request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Unexpected HeyGen response: {0}")]
    Protocol(String),
}

impl AvatarStartError {
    pub const GENERIC_MESSAGE: &'static str =
        "Failed to start avatar. Please check your HeyGen configuration.";

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::Protocol(_) => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self.status() {
            Some(400) => "Invalid avatar or voice configuration. Please check your HeyGen avatar and voice IDs.",
            Some(401) => "Invalid HeyGen API key. Please check your authentication.",
            Some(404) => "Avatar or voice not found. Please check your HeyGen configuration.",
            _ => Self::GENERIC_MESSAGE,
        }
        .to_string()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct NewSessionData {
    session_id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskData {
    #[serde(default)]
    duration_ms: Option<f64>,
    #[serde(default)]
    task_id: Option<String>,
}

struct LiveSession {
    token: String,
    talk: TalkTracker,
}

pub struct HeyGenAvatar {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    sessions: Mutex<HashMap<SessionHandle, Arc<LiveSession>>>,
}

impl HeyGenAvatar {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(HEYGEN_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Fails if no API key resolves.
    pub fn from_config(config: &AvatarConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No HeyGen API key configured"))?;
        Ok(Self::new(api_key, config.base_url.as_deref()))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> Result<Option<T>, AvatarStartError> {
        let request = self
            .client
            .post(format!("{}/v1/{endpoint}", self.base_url))
            .json(&body);
        let request = match token {
            Some(token) => request.bearer_auth(token),
            None => request.header("x-api-key", &self.api_key),
        };

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AvatarStartError::Api { status, body });
        }
        let envelope: Envelope<T> = resp.json().await?;
        Ok(envelope.data)
    }

    async fn create_token(&self) -> Result<String, AvatarStartError> {
        let data: Option<TokenData> = self.post("streaming.create_token", None, json!({})).await?;
        data.map(|d| d.token)
            .ok_or_else(|| AvatarStartError::Protocol("missing session token".into()))
    }

    fn session(&self, handle: &SessionHandle) -> Option<Arc<LiveSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(handle)
            .cloned()
    }
}

#[async_trait]
impl AvatarRenderer for HeyGenAvatar {
    fn id(&self) -> &str {
        "heygen"
    }

    async fn start(&self, voice: &VoiceConfig) -> anyhow::Result<AvatarSession> {
        let token = self.create_token().await?;

        let data: Option<NewSessionData> = self
            .post(
                "streaming.new",
                Some(&token),
                json!({
                    "quality": voice.quality,
                    "avatar_name": voice.avatar_id,
                    "voice": { "voice_id": voice.voice_id },
                    "version": "v2",
                }),
            )
            .await?;
        let data = data.ok_or_else(|| AvatarStartError::Protocol("missing session data".into()))?;

        let _: Option<serde_json::Value> = self
            .post(
                "streaming.start",
                Some(&token),
                json!({ "session_id": data.session_id }),
            )
            .await?;

        let handle = SessionHandle(data.session_id);
        let media = match (data.url, data.access_token) {
            (Some(url), Some(access_token)) => Some(MediaStreamInfo { url, access_token }),
            _ => None,
        };
        let (talk, events) = TalkTracker::new();
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.clone(), Arc::new(LiveSession { token, talk }));

        info!(session = %handle, avatar = %voice.avatar_id, "Avatar session started");
        Ok(AvatarSession {
            handle,
            media,
            events,
        })
    }

    async fn speak(&self, session: &SessionHandle, text: &str) -> anyhow::Result<()> {
        let live = self
            .session(session)
            .ok_or_else(|| anyhow::anyhow!("Unknown avatar session {session}"))?;

        let data: Option<TaskData> = self
            .post(
                "streaming.task",
                Some(&live.token),
                json!({ "session_id": session.0, "text": text, "task_type": "repeat" }),
            )
            .await?;

        let duration = match data.as_ref().and_then(|d| d.duration_ms) {
            Some(ms) if ms > 0.0 => Duration::from_millis(ms as u64),
            _ => {
                debug!("Task reported no duration, estimating");
                estimate_duration(text)
            }
        };
        debug!(
            session = %session,
            task_id = data.and_then(|d| d.task_id).as_deref().unwrap_or("-"),
            duration_ms = duration.as_millis() as u64,
            "Avatar task queued"
        );
        live.talk.talk_for(duration);
        Ok(())
    }

    async fn stop(&self, session: &SessionHandle) -> anyhow::Result<()> {
        let live = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session);
        let Some(live) = live else {
            warn!(session = %session, "Stop requested for unknown avatar session");
            return Ok(());
        };
        live.talk.close();

        let _: Option<serde_json::Value> = self
            .post(
                "streaming.stop",
                Some(&live.token),
                json!({ "session_id": session.0 }),
            )
            .await?;
        info!(session = %session, "Avatar session stopped");
        Ok(())
    }
}
