use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Kind of attached media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// Classify a MIME type. Anything that is not an image or a video is `None`.
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        if mime_type.starts_with("image/") {
            Some(Self::Photo)
        } else if mime_type.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
        }
    }
}

/// Media supplied by the capture UI (file picker or camera).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    #[serde(skip)]
    pub data: Bytes,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl MediaAttachment {
    pub fn new(kind: MediaKind, data: Bytes, name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        let size_bytes = data.len() as u64;
        Self {
            kind,
            data,
            name: name.into(),
            mime_type: mime_type.into(),
            size_bytes,
        }
    }

    /// Size rounded to whole kilobytes, as shown to the responder.
    pub fn size_kb(&self) -> u64 {
        (self.size_bytes + 512) / 1024
    }
}

/// Content of a turn: plain text or a reference to attached media.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    Media {
        caption: String,
        attachment: MediaAttachment,
    },
}

impl TurnContent {
    /// Text used when the turn is sent to a text-only responder.
    ///
    /// Media turns render as `"<caption> [PHOTO: <name>]"`.
    pub fn placeholder(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Media {
                caption,
                attachment,
            } => format!(
                "{caption} [{}: {}]",
                attachment.kind.label().to_uppercase(),
                attachment.name
            ),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Media { .. } => None,
        }
    }
}

/// One message in the conversation record. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    content: TurnContent,
    timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, TurnContent::Text { text: text.into() })
    }

    pub fn user_media(caption: impl Into<String>, attachment: MediaAttachment) -> Self {
        Self::new(
            Role::User,
            TurnContent::Media {
                caption: caption.into(),
                attachment,
            },
        )
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, TurnContent::Text { text: text.into() })
    }

    fn new(role: Role, content: TurnContent) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &TurnContent {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Presentation hint derived from the most recent input kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiMode {
    #[default]
    AvatarFocus,
    ChatFocus,
    MediaFocus,
}
