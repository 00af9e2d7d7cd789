//! Wire codec for the push channel and REST payloads
//!
//! Inbound frames are JSON envelopes `{ "type": ..., "message": ... }`. They are
//! decoded into a closed set of variants; unknown kinds become
//! [`InboundEvent::Unhandled`] so newer servers do not break older clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::types::error::InboxError;
use crate::types::{Conversation, Message};

/// A decoded inbound push event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewConversation {
        conversation: Conversation,
    },
    NewMessage {
        message: Message,
        /// Owning conversation, when the server includes it in the envelope
        conversation: Option<Conversation>,
    },
    ConversationUpdated {
        conversation: Conversation,
    },
    /// Recognised envelope with a `type` this client does not handle
    Unhandled {
        kind: String,
    },
}

impl InboundEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::NewConversation { .. } => "new_conversation",
            Self::NewMessage { .. } => "new_message",
            Self::ConversationUpdated { .. } => "conversation_updated",
            Self::Unhandled { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),

    #[error("envelope has no string `type` field")]
    MissingType,

    #[error("`{kind}` envelope has no `message` payload")]
    MissingPayload { kind: String },

    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl From<DecodeError> for InboxError {
    fn from(err: DecodeError) -> Self {
        InboxError::Decode(err.to_string())
    }
}

/// Decode one raw text frame
pub fn decode(raw: &str) -> Result<InboundEvent, DecodeError> {
    let envelope: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;

    let kind = envelope
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();

    match kind.as_str() {
        "new_conversation" => Ok(InboundEvent::NewConversation {
            conversation: payload(&envelope, &kind)?,
        }),
        "new_message" => {
            let message: Message = payload(&envelope, &kind)?;
            let conversation: Option<Conversation> = match envelope.get("conversation") {
                None | Some(Value::Null) => None,
                Some(value) => Some(typed(value.clone(), &kind)?),
            };
            if let Some(conv) = &conversation {
                if conv.thread_id != message.thread_id {
                    return Err(DecodeError::InvalidPayload {
                        kind,
                        reason: format!(
                            "message thread {} does not match conversation thread {}",
                            message.thread_id, conv.thread_id
                        ),
                    });
                }
            }
            Ok(InboundEvent::NewMessage {
                message,
                conversation,
            })
        }
        "conversation_updated" => Ok(InboundEvent::ConversationUpdated {
            conversation: payload(&envelope, &kind)?,
        }),
        _ => Ok(InboundEvent::Unhandled { kind }),
    }
}

fn payload<T: serde::de::DeserializeOwned>(envelope: &Value, kind: &str) -> Result<T, DecodeError> {
    let value = envelope
        .get("message")
        .filter(|v| !v.is_null())
        .ok_or_else(|| DecodeError::MissingPayload {
            kind: kind.to_string(),
        })?;
    typed(value.clone(), kind)
}

fn typed<T: serde::de::DeserializeOwned>(value: Value, kind: &str) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Client -> server frames on the push channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum OutboundFrame {
    Handshake { tenant: String, user_id: String },
}

pub fn encode_frame(frame: &OutboundFrame) -> Result<String, InboxError> {
    Ok(serde_json::to_string(frame)?)
}

/// Body for the create-message endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub thread_id: String,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    pub subject: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

/// Response of the create-message endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedMessage {
    pub message: Message,
    #[serde(default)]
    pub conversation: Option<Conversation>,
}

/// Body for the create-comment endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCommentRequest {
    pub message_id: String,
    pub content: String,
    #[serde(default)]
    pub mentions: BTreeSet<String>,
}

/// PATCH body for the update-conversation endpoint
///
/// `assigned_to` is always serialised so that `null` clears the assignee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPatch {
    pub assigned_to: Option<String>,
}

/// Outbound REST command, mapped to its wire body without side effects
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    CreateMessage(CreateMessageRequest),
    CreateComment(CreateCommentRequest),
    UpdateConversation {
        conversation_id: String,
        patch: ConversationPatch,
    },
}

pub fn encode(command: &OutboundCommand) -> Result<Value, InboxError> {
    let value = match command {
        OutboundCommand::CreateMessage(req) => serde_json::to_value(req)?,
        OutboundCommand::CreateComment(req) => serde_json::to_value(req)?,
        OutboundCommand::UpdateConversation { patch, .. } => serde_json::to_value(patch)?,
    };
    Ok(value)
}
