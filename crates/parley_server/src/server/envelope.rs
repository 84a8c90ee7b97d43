#![forbid(unsafe_code)]

use parley_domain::{ChatId, ConnectionId, EnvelopeKind, Username};
use parley_protocol::{InboundFrame, OutboundFrame};

/// Where an envelope entered the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
	/// Decoded from a client's stream; recipients are derived server-side.
	Client(ConnectionId),
	/// Submitted in-process through `HubHandle::notify`; recipients are trusted.
	Internal,
}

/// Unit of communication routed by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
	pub kind: EnvelopeKind,
	pub sender: Username,
	pub chat_id: Option<ChatId>,
	pub recipients: Vec<Username>,
	pub content: String,
	pub origin: Origin,
}

impl Envelope {
	/// Build from a decoded client frame. The sender comes from the authenticated connection.
	pub fn from_client(frame: InboundFrame, sender: Username, conn_id: ConnectionId) -> Self {
		Self {
			kind: frame.kind,
			sender,
			chat_id: frame.chat_id,
			recipients: Vec::new(),
			content: frame.content,
			origin: Origin::Client(conn_id),
		}
	}

	pub fn internal_notification(
		sender: Username,
		recipients: Vec<Username>,
		content: impl Into<String>,
		chat_id: Option<ChatId>,
	) -> Self {
		Self {
			kind: EnvelopeKind::Notification,
			sender,
			chat_id,
			recipients,
			content: content.into(),
			origin: Origin::Internal,
		}
	}

	pub fn is_from_client(&self) -> bool {
		matches!(self.origin, Origin::Client(_))
	}

	/// Wire form delivered to recipients.
	pub fn to_outbound(&self) -> OutboundFrame {
		OutboundFrame {
			kind: self.kind.clone(),
			sender: self.sender.clone(),
			content: self.content.clone(),
			chat_id: self.chat_id,
		}
	}
}
