//! Typed events of the chat stream (`POST /v3/chat` with `"stream": true`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CozeError, StreamError};
use crate::http::RequestDescriptor;
use crate::stream::{Frame, StreamEvent};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Chat {
    pub id: String,
    pub conversation_id: String,
    pub bot_id: String,
    pub status: String,
    pub created_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_error: Option<ChatError>,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatError {
    pub code: i64,
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatUsage {
    pub token_count: i64,
    pub output_count: i64,
    pub input_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub bot_id: String,
    pub chat_id: String,
    pub role: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Created(Chat),
    InProgress(Chat),
    Completed(Chat),
    Failed(Chat),
    RequiresAction(Chat),
    MessageDelta(Message),
    MessageCompleted(Message),
    AudioDelta(Message),
    /// Any event this client does not know yet, passed through unchanged.
    Unknown(Frame),
}

impl StreamEvent for ChatEvent {
    const DONE: &'static str = "done";
    const ERROR: &'static str = "error";

    fn from_frame(frame: Frame, logid: &str) -> Result<Self, CozeError> {
        let event = match frame.event.as_str() {
            "conversation.chat.created" => ChatEvent::Created(payload(&frame, logid)?),
            "conversation.chat.in_progress" => ChatEvent::InProgress(payload(&frame, logid)?),
            "conversation.chat.completed" => ChatEvent::Completed(payload(&frame, logid)?),
            "conversation.chat.failed" => ChatEvent::Failed(payload(&frame, logid)?),
            "conversation.chat.requires_action" => ChatEvent::RequiresAction(payload(&frame, logid)?),
            "conversation.message.delta" => ChatEvent::MessageDelta(payload(&frame, logid)?),
            "conversation.message.completed" => ChatEvent::MessageCompleted(payload(&frame, logid)?),
            "conversation.audio.delta" => ChatEvent::AudioDelta(payload(&frame, logid)?),
            _ => ChatEvent::Unknown(frame),
        };
        Ok(event)
    }
}

/// Parse a frame's `data` as `T`; a mismatch names the event tag.
pub(crate) fn payload<T: DeserializeOwned>(frame: &Frame, logid: &str) -> Result<T, CozeError> {
    serde_json::from_str(&frame.data).map_err(|_| {
        StreamError::InvalidEvent {
            field: frame.event.clone(),
            data: frame.data.clone(),
            logid: logid.to_string(),
        }
        .into()
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub content_type: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            content_type: "text".to_string(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            ..Self::user(content)
        }
    }
}

/// Body of a streaming chat request.
#[derive(Debug, Clone, Serialize)]
pub struct StreamChat {
    pub bot_id: String,
    pub user_id: String,
    pub additional_messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    stream: bool,
}

impl StreamChat {
    pub fn new(bot_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            user_id: user_id.into(),
            additional_messages: Vec::new(),
            conversation_id: None,
            stream: true,
        }
    }

    pub fn message(mut self, message: ChatMessage) -> Self {
        self.additional_messages.push(message);
        self
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

pub fn stream_request(chat: &StreamChat) -> Result<RequestDescriptor, CozeError> {
    let desc = RequestDescriptor::post("/v3/chat");
    match &chat.conversation_id {
        Some(id) => desc.query("conversation_id", id),
        None => desc,
    }
    .json(chat)
}
