use crate::action::SafetyCheck;
use crate::screen::{EncodedImage, ScreenshotRef};
use nanoid::nanoid;
use serde_json::Value;
use std::sync::Arc;

/// A screenshot as it sits in the conversation: the record reference plus the bytes
/// the model needs to see.
#[derive(Clone, Debug)]
pub struct ImageAttachment {
    pub reference: ScreenshotRef,
    pub image: Arc<EncodedImage>,
}

impl ImageAttachment {
    pub fn new(image: EncodedImage) -> Self {
        let reference = ScreenshotRef {
            id: nanoid!(),
            format: image.format,
            width: image.width,
            height: image.height,
        };
        Self { reference, image: Arc::new(image) }
    }
}

#[derive(Clone, Debug)]
pub enum Message {
    System { text: String },
    User { text: String, image: Option<ImageAttachment> },
    Assistant { text: String },
    ToolCall { call_id: String, name: String, arguments: Value },
    ToolResult { call_id: String, output: String, acknowledged_safety_checks: Vec<SafetyCheck> },
}

impl Message {
    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } | Message::ToolCall { .. } => "assistant",
            Message::ToolResult { .. } => "tool",
        }
    }
}

/// Append-only message history for one run.
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(text: impl Into<String>) -> Self {
        let mut c = Self::new();
        c.push(Message::System { text: text.into() });
        c
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Number of user messages carrying a screenshot.
    pub fn image_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m, Message::User { image: Some(_), .. }))
            .count()
    }
}
