//! Turn orchestrator.
//!
//! Serializes every candidate input (typed text, utterances, media, vision
//! frames) against the AI responder behind a single Pending-Turn gate, routes
//! replies to the conversation log and the avatar, and re-enables listening
//! once the avatar stops talking.

use serde::{Deserialize, Serialize};

use parley_core::types::{MediaAttachment, MediaKind, Turn, UiMode};
use parley_media::vision::EncodedFrame;

pub mod orchestrator;
pub mod request;

pub use orchestrator::{DisplaySnapshot, OrchestratorSettings, TurnOrchestrator};

/// Caption of the user turn recorded for each vision frame.
pub const CAMERA_FRAME_CAPTION: &str = "Camera frame";

/// A candidate input for the next turn.
#[derive(Debug, Clone)]
pub enum UserInput {
    Text(String),
    Utterance(String),
    Media(MediaAttachment),
    VisionFrame(EncodedFrame),
}

impl UserInput {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) | Self::Utterance(text) => text.trim().is_empty(),
            Self::Media(attachment) => attachment.data.is_empty(),
            Self::VisionFrame(frame) => frame.data.is_empty(),
        }
    }

    pub fn kind(&self) -> InputKind {
        match self {
            Self::Text(_) => InputKind::Text,
            Self::Utterance(_) => InputKind::Utterance,
            Self::Media(_) => InputKind::Media,
            Self::VisionFrame(_) => InputKind::VisionFrame,
        }
    }

    /// The user turn recorded when this input is accepted.
    pub fn to_turn(&self) -> Turn {
        match self {
            Self::Text(text) | Self::Utterance(text) => Turn::user_text(text.trim()),
            Self::Media(attachment) => Turn::user_media(
                format!("I uploaded a {}", attachment.kind.label()),
                attachment.clone(),
            ),
            Self::VisionFrame(frame) => Turn::user_media(
                CAMERA_FRAME_CAPTION,
                MediaAttachment::new(
                    MediaKind::Photo,
                    frame.data.clone(),
                    format!("camera-frame-{}.jpg", frame.sequence),
                    frame.media_type.clone(),
                ),
            ),
        }
    }

    /// Presentation mode after this input, if it changes it.
    pub fn mode(&self) -> Option<UiMode> {
        match self {
            Self::Text(_) | Self::Utterance(_) => Some(UiMode::ChatFocus),
            Self::Media(_) => Some(UiMode::MediaFocus),
            Self::VisionFrame(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Text,
    Utterance,
    Media,
    VisionFrame,
}

/// Result of [`TurnOrchestrator::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A turn was started for this input.
    Accepted,
    /// Held as the single pending input; runs when the current turn ends.
    Queued,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    /// A turn is in progress and this input kind is not queued.
    Busy,
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: title.into(),
            description: description.into(),
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.title, self.description)
    }
}
