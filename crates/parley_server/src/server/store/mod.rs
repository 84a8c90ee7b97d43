#![forbid(unsafe_code)]

//! Membership and message persistence used by the hub.

mod memory;
mod seed;
mod sql;

use async_trait::async_trait;
use parley_domain::{ChatId, MessageId, Username};
use thiserror::Error;

pub use memory::InMemoryStore;
pub use seed::{SeedTarget, apply_seed_chats};
pub use sql::SqlStore;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("chat {0} not found")]
	ChatNotFound(ChatId),

	#[error("user {0} not found")]
	UserNotFound(Username),

	#[error("invalid message: {0}")]
	InvalidMessage(String),

	#[error("invalid chat: {0}")]
	InvalidChat(String),

	#[error("unsupported database_url (use sqlite:, postgres:, mysql:): {0}")]
	UnsupportedUrl(String),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, StoreError::ChatNotFound(_) | StoreError::UserNotFound(_))
	}
}

/// A chat message about to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub chat_id: ChatId,
	pub sender: Username,
	pub content: String,
}

/// A message as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub chat_id: ChatId,
	pub sender: Username,
	pub content: String,
	pub created_at_unix_ms: i64,
}

/// Request to create a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChat {
	pub name: String,
	pub is_group: bool,
	pub members: Vec<Username>,
}

/// Resolves the current members of a chat.
#[async_trait]
pub trait MembershipStore: Send + Sync {
	/// Fails with `StoreError::ChatNotFound` when the chat does not exist.
	async fn members(&self, chat_id: ChatId) -> Result<Vec<Username>, StoreError>;
}

/// Durably stores chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
	async fn store(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;
}

/// Rejects empty or whitespace-only content.
pub(crate) fn validate_message(message: &NewMessage) -> Result<(), StoreError> {
	if message.content.trim().is_empty() {
		return Err(StoreError::InvalidMessage("empty content".to_string()));
	}
	Ok(())
}

/// Checks shared by every `create_chat`: at least two distinct members, exactly two for
/// private chats. Returns the de-duplicated member list.
pub(crate) fn validate_new_chat(chat: &NewChat) -> Result<Vec<Username>, StoreError> {
	let mut members = Vec::with_capacity(chat.members.len());
	for m in &chat.members {
		if !members.contains(m) {
			members.push(m.clone());
		}
	}

	if members.len() < 2 {
		return Err(StoreError::InvalidChat("a chat needs at least two members".to_string()));
	}
	if !chat.is_group && members.len() != 2 {
		return Err(StoreError::InvalidChat("a private chat has exactly two members".to_string()));
	}
	Ok(members)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(name: &str) -> Username {
		Username::new(name).unwrap()
	}

	#[test]
	fn whitespace_only_content_is_invalid() {
		let msg = NewMessage {
			chat_id: ChatId(1),
			sender: user("alice"),
			content: " \n\t".to_string(),
		};
		assert!(matches!(validate_message(&msg), Err(StoreError::InvalidMessage(_))));
	}

	#[test]
	fn new_chat_member_rules() {
		let solo = NewChat {
			name: "solo".to_string(),
			is_group: true,
			members: vec![user("alice"), user("alice")],
		};
		assert!(matches!(validate_new_chat(&solo), Err(StoreError::InvalidChat(_))));

		let crowded_private = NewChat {
			name: "dm".to_string(),
			is_group: false,
			members: vec![user("alice"), user("bob"), user("carol")],
		};
		assert!(matches!(validate_new_chat(&crowded_private), Err(StoreError::InvalidChat(_))));

		let group = NewChat {
			name: "team".to_string(),
			is_group: true,
			members: vec![user("alice"), user("bob"), user("alice"), user("carol")],
		};
		assert_eq!(
			validate_new_chat(&group).unwrap(),
			vec![user("alice"), user("bob"), user("carol")]
		);
	}
}
