#![forbid(unsafe_code)]

//! Dispatch policy: who receives an envelope and whether it must be persisted.

use std::collections::HashSet;

use parley_domain::{EnvelopeKind, Username};

use crate::server::envelope::Envelope;

/// Outcome of the dispatch policy for one envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchPlan {
	pub recipients: Vec<Username>,
	pub requires_persistence: bool,
}

impl DispatchPlan {
	pub fn is_noop(&self) -> bool {
		self.recipients.is_empty() && !self.requires_persistence
	}
}

/// Whether the hub must fetch chat membership before planning `envelope`.
///
/// Chat messages always need it. Client notifications need it because their recipients
/// are scoped to the chat; internal notifications carry a trusted list.
pub fn needs_membership(envelope: &Envelope) -> bool {
	match envelope.kind {
		EnvelopeKind::ChatMessage => true,
		EnvelopeKind::Notification => envelope.is_from_client(),
		EnvelopeKind::Other(_) => false,
	}
}

/// `members` minus `sender`, de-duplicated, first occurrence wins.
pub fn chat_recipients(members: &[Username], sender: &Username) -> Vec<Username> {
	dedup(members.iter().filter(|m| *m != sender))
}

/// Compute recipients and the persistence obligation.
///
/// - `chat-message`: every member except the sender, persisted.
/// - `notification`: the envelope's own recipient list, not persisted.
/// - anything else: nothing.
pub fn plan(envelope: &Envelope, sender: &Username, members: &[Username]) -> DispatchPlan {
	match envelope.kind {
		EnvelopeKind::ChatMessage => DispatchPlan {
			recipients: chat_recipients(members, sender),
			requires_persistence: true,
		},
		EnvelopeKind::Notification => DispatchPlan {
			recipients: dedup(envelope.recipients.iter()),
			requires_persistence: false,
		},
		EnvelopeKind::Other(_) => DispatchPlan::default(),
	}
}

fn dedup<'a>(names: impl Iterator<Item = &'a Username>) -> Vec<Username> {
	let mut seen = HashSet::new();
	names.filter(|n| seen.insert(*n)).cloned().collect()
}

#[cfg(test)]
mod tests {
	use parley_domain::{ChatId, ConnectionId};
	use parley_protocol::InboundFrame;

	use super::*;

	fn user(name: &str) -> Username {
		Username::new(name).unwrap()
	}

	fn users(names: &[&str]) -> Vec<Username> {
		names.iter().map(|n| user(n)).collect()
	}

	fn from_client(frame: InboundFrame, sender: &str) -> Envelope {
		Envelope::from_client(frame, user(sender), ConnectionId(1))
	}

	#[test]
	fn chat_message_excludes_sender_and_persists() {
		let env = from_client(InboundFrame::chat_message(ChatId(5), "hi"), "alice");
		let plan = plan(&env, &user("alice"), &users(&["alice", "bob", "carol"]));

		assert_eq!(plan.recipients, users(&["bob", "carol"]));
		assert!(plan.requires_persistence);
	}

	#[test]
	fn chat_message_to_solo_chat_still_persists() {
		let env = from_client(InboundFrame::chat_message(ChatId(5), "note to self"), "alice");
		let plan = plan(&env, &user("alice"), &users(&["alice"]));

		assert!(plan.recipients.is_empty());
		assert!(plan.requires_persistence);
		assert!(!plan.is_noop());
	}

	#[test]
	fn notification_uses_envelope_recipients_without_persistence() {
		let env = Envelope::internal_notification(user("carol"), users(&["dave"]), "ping", None);
		let plan = plan(&env, &user("carol"), &[]);

		assert_eq!(plan.recipients, users(&["dave"]));
		assert!(!plan.requires_persistence);
	}

	#[test]
	fn recipients_are_deduplicated() {
		let env = Envelope::internal_notification(user("sys"), users(&["bob", "bob", "dave", "bob"]), "x", None);
		assert_eq!(plan(&env, &user("sys"), &[]).recipients, users(&["bob", "dave"]));

		let chat = from_client(InboundFrame::chat_message(ChatId(1), "x"), "alice");
		let plan = plan(&chat, &user("alice"), &users(&["bob", "alice", "bob"]));
		assert_eq!(plan.recipients, users(&["bob"]));
	}

	#[test]
	fn unknown_kind_is_ignored() {
		let frame = InboundFrame {
			kind: EnvelopeKind::parse("typing"),
			content: String::new(),
			chat_id: Some(ChatId(5)),
		};
		let env = from_client(frame, "alice");

		assert!(!needs_membership(&env));
		assert!(plan(&env, &user("alice"), &users(&["alice", "bob"])).is_noop());
	}

	#[test]
	fn membership_needed_for_chat_messages_and_client_notifications() {
		let chat = from_client(InboundFrame::chat_message(ChatId(1), "x"), "alice");
		let client_note = from_client(InboundFrame::notification(ChatId(1), "x"), "alice");
		let internal_note = Envelope::internal_notification(user("sys"), users(&["bob"]), "x", None);

		assert!(needs_membership(&chat));
		assert!(needs_membership(&client_note));
		assert!(!needs_membership(&internal_note));
	}
}
