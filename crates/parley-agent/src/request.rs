//! Responder request building.

use parley_core::types::{MediaAttachment, MediaKind, Turn};
use parley_providers::{ChatMessage, ImagePayload, turns_to_messages};

use crate::UserInput;

pub const CAMERA_PROMPT: &str = "I'm showing you what I can see through my camera. Please analyze the current scene and provide helpful insights or solutions to any problems you notice. Respond naturally as if we're having a conversation.";

/// What to send to the responder for one turn.
#[derive(Debug, Clone)]
pub enum TurnRequest {
    Text {
        messages: Vec<ChatMessage>,
    },
    Vision {
        messages: Vec<ChatMessage>,
        image: ImagePayload,
        /// Text-only request to try once if the vision request fails.
        fallback: Option<Vec<ChatMessage>>,
    },
}

/// Build the request for `input`, given the log as it was before the input's
/// own turn was appended.
///
/// Text and utterances get the system prompt followed by the whole log and the
/// new message. Media and frames send the prior log as placeholders followed by
/// a prompt describing the new item, with the image attached inline when the
/// item is a still.
pub fn build_request(history: &[Turn], input: &UserInput, system_prompt: &str) -> TurnRequest {
    let mut messages = turns_to_messages(history);
    match input {
        UserInput::Text(text) | UserInput::Utterance(text) => {
            if !system_prompt.is_empty() {
                messages.insert(0, ChatMessage::system(system_prompt));
            }
            messages.push(ChatMessage::user(text.trim()));
            TurnRequest::Text { messages }
        }
        UserInput::Media(attachment) => match attachment.kind {
            MediaKind::Photo => {
                let mut fallback = messages.clone();
                fallback.push(ChatMessage::user(photo_fallback_prompt(attachment)));
                TurnRequest::Vision {
                    messages,
                    image: ImagePayload::new(
                        photo_prompt(attachment),
                        attachment.mime_type.clone(),
                        attachment.data.clone(),
                    ),
                    fallback: Some(fallback),
                }
            }
            MediaKind::Video => {
                messages.push(ChatMessage::user(video_prompt(attachment)));
                TurnRequest::Text { messages }
            }
        },
        UserInput::VisionFrame(frame) => TurnRequest::Vision {
            messages,
            image: ImagePayload::new(CAMERA_PROMPT, frame.media_type.clone(), frame.data.clone()),
            fallback: None,
        },
    }
}

fn photo_prompt(photo: &MediaAttachment) -> String {
    format!(
        "I've shared an image named \"{}\". Please analyze what you can see and provide helpful insights about the content.",
        photo.name
    )
}

fn photo_fallback_prompt(photo: &MediaAttachment) -> String {
    format!(
        "I've shared an image file named \"{}\" ({}, {}KB). Since I cannot directly analyze the image content, could you please describe what's in the image or what you'd like help with? I'm here to assist with any questions or analysis you need.",
        photo.name,
        photo.mime_type,
        photo.size_kb()
    )
}

fn video_prompt(video: &MediaAttachment) -> String {
    format!(
        "I've shared a video file named \"{}\" ({}, {}KB). Could you please describe what's in the video or what you'd like help with? I'm here to assist with any questions or analysis you need.",
        video.name,
        video.mime_type,
        video.size_kb()
    )
}
