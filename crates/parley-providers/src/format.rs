//! Convert the conversation log to responder messages.

use parley_core::types::Turn;

use crate::ChatMessage;

/// Translate turns to text messages, in log order.
///
/// Media turns are flattened to their placeholder (`"<caption> [PHOTO: name]"`),
/// so the result is valid for text-only requests.
pub fn turns_to_messages(turns: &[Turn]) -> Vec<ChatMessage> {
    turns
        .iter()
        .map(|turn| ChatMessage {
            role: turn.role().into(),
            content: turn.content().placeholder(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parley_core::types::{MediaAttachment, MediaKind};

    use super::*;
    use crate::ChatRole;

    #[test]
    fn test_media_turns_flatten_to_placeholder() {
        let video = MediaAttachment::new(
            MediaKind::Video,
            Bytes::from_static(b"...."),
            "clip.mp4",
            "video/mp4",
        );
        let turns = vec![
            Turn::user_text("hello"),
            Turn::assistant("hi there"),
            Turn::user_media("I captured a video", video),
        ];

        let messages = turns_to_messages(&turns);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], ChatMessage::user("hello"));
        assert_eq!(messages[1].role, ChatRole::Assistant);
        assert_eq!(messages[2].content, "I captured a video [VIDEO: clip.mp4]");
    }

    #[test]
    fn test_empty_log() {
        assert!(turns_to_messages(&[]).is_empty());
    }
}
