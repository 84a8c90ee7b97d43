#![forbid(unsafe_code)]

use parley_domain::{ChatId, EnvelopeKind, Username};
use serde::{Deserialize, Serialize};

/// First frame a client sends after opening its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
	pub auth_token: String,

	#[serde(default)]
	pub client_name: String,
}

/// Error codes carried by `HandshakeReply::Error`.
pub struct ErrorCode;

impl ErrorCode {
	pub const UNAUTHORIZED: &'static str = "UNAUTHORIZED";
	pub const BAD_HANDSHAKE: &'static str = "BAD_HANDSHAKE";
}

/// Server answer to `Hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeReply {
	Welcome {
		username: Username,
		server_name: String,
		max_frame_bytes: u32,
	},
	Error {
		code: String,
		message: String,
	},
}

/// Envelope as sent by a client.
///
/// `sender` and `recipients` are not part of this type: anything a client puts there is
/// dropped during decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
	#[serde(rename = "type")]
	pub kind: EnvelopeKind,

	#[serde(default)]
	pub content: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub chat_id: Option<ChatId>,
}

impl InboundFrame {
	/// Wire kind of keepalive frames. They only reset the idle timer.
	pub const HEARTBEAT_KIND: &'static str = "heartbeat";

	pub fn chat_message(chat_id: ChatId, content: impl Into<String>) -> Self {
		Self {
			kind: EnvelopeKind::ChatMessage,
			content: content.into(),
			chat_id: Some(chat_id),
		}
	}

	pub fn notification(chat_id: ChatId, content: impl Into<String>) -> Self {
		Self {
			kind: EnvelopeKind::Notification,
			content: content.into(),
			chat_id: Some(chat_id),
		}
	}

	pub fn heartbeat() -> Self {
		Self {
			kind: EnvelopeKind::Other(Self::HEARTBEAT_KIND.to_string()),
			content: String::new(),
			chat_id: None,
		}
	}

	pub fn is_heartbeat(&self) -> bool {
		self.kind.as_str() == Self::HEARTBEAT_KIND
	}
}

/// Envelope as delivered to recipients, enriched server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
	#[serde(rename = "type")]
	pub kind: EnvelopeKind,

	pub sender: Username,

	pub content: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub chat_id: Option<ChatId>,
}
