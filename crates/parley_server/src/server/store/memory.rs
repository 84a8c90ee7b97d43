#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use parley_domain::{ChatId, MessageId, Username};
use tokio::sync::Mutex;

use super::{MembershipStore, MessageStore, NewChat, NewMessage, StoreError, StoredMessage, validate_message, validate_new_chat};
use crate::util::time::unix_ms_now;

/// Process-local store used in dev mode and tests. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	users: HashSet<Username>,
	chats: BTreeMap<ChatId, ChatRecord>,
	messages: Vec<StoredMessage>,
	next_chat_id: u64,
}

#[derive(Debug)]
struct ChatRecord {
	is_group: bool,
	members: Vec<Username>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Create the user if it does not exist yet.
	pub async fn ensure_user(&self, username: &Username) {
		self.inner.lock().await.users.insert(username.clone());
	}

	/// Create a chat between existing users.
	pub async fn create_chat(&self, chat: NewChat) -> Result<ChatId, StoreError> {
		let members = validate_new_chat(&chat)?;

		let mut inner = self.inner.lock().await;
		if let Some(missing) = members.iter().find(|m| !inner.users.contains(*m)) {
			return Err(StoreError::UserNotFound(missing.clone()));
		}

		if !chat.is_group
			&& inner
				.chats
				.values()
				.any(|c| !c.is_group && members.iter().all(|m| c.members.contains(m)))
		{
			return Err(StoreError::InvalidChat(
				"private chat between these users already exists".to_string(),
			));
		}

		inner.next_chat_id += 1;
		let id = ChatId(inner.next_chat_id);
		inner.chats.insert(
			id,
			ChatRecord {
				is_group: chat.is_group,
				members,
			},
		);
		Ok(id)
	}

	/// Stored messages of a chat, oldest first.
	pub async fn messages(&self, chat_id: ChatId) -> Vec<StoredMessage> {
		let inner = self.inner.lock().await;
		inner.messages.iter().filter(|m| m.chat_id == chat_id).cloned().collect()
	}

	pub async fn message_count(&self) -> usize {
		self.inner.lock().await.messages.len()
	}
}

#[async_trait]
impl MembershipStore for InMemoryStore {
	async fn members(&self, chat_id: ChatId) -> Result<Vec<Username>, StoreError> {
		let inner = self.inner.lock().await;
		inner
			.chats
			.get(&chat_id)
			.map(|c| c.members.clone())
			.ok_or(StoreError::ChatNotFound(chat_id))
	}
}

#[async_trait]
impl MessageStore for InMemoryStore {
	async fn store(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
		validate_message(&message)?;

		let mut inner = self.inner.lock().await;
		if !inner.chats.contains_key(&message.chat_id) {
			return Err(StoreError::ChatNotFound(message.chat_id));
		}
		if !inner.users.contains(&message.sender) {
			return Err(StoreError::UserNotFound(message.sender));
		}

		let stored = StoredMessage {
			id: MessageId::new_v4(),
			chat_id: message.chat_id,
			sender: message.sender,
			content: message.content,
			created_at_unix_ms: unix_ms_now(),
		};
		inner.messages.push(stored.clone());
		Ok(stored)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(name: &str) -> Username {
		Username::new(name).unwrap()
	}

	async fn store_with_users(names: &[&str]) -> InMemoryStore {
		let store = InMemoryStore::new();
		for n in names {
			store.ensure_user(&user(n)).await;
		}
		store
	}

	#[tokio::test]
	async fn create_chat_then_resolve_members() {
		let store = store_with_users(&["alice", "bob"]).await;
		let id = store
			.create_chat(NewChat {
				name: "dm".to_string(),
				is_group: false,
				members: vec![user("alice"), user("bob")],
			})
			.await
			.unwrap();

		assert_eq!(store.members(id).await.unwrap(), vec![user("alice"), user("bob")]);
		assert!(matches!(
			store.members(ChatId(999)).await,
			Err(StoreError::ChatNotFound(ChatId(999)))
		));
	}

	#[tokio::test]
	async fn create_chat_requires_existing_users() {
		let store = store_with_users(&["alice"]).await;
		let err = store
			.create_chat(NewChat {
				name: "dm".to_string(),
				is_group: false,
				members: vec![user("alice"), user("ghost")],
			})
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::UserNotFound(u) if u.as_str() == "ghost"));
	}

	#[tokio::test]
	async fn duplicate_private_chat_is_rejected() {
		let store = store_with_users(&["alice", "bob"]).await;
		let dm = NewChat {
			name: "dm".to_string(),
			is_group: false,
			members: vec![user("alice"), user("bob")],
		};
		store.create_chat(dm.clone()).await.unwrap();

		let reversed = NewChat {
			members: vec![user("bob"), user("alice")],
			..dm
		};
		assert!(matches!(store.create_chat(reversed).await, Err(StoreError::InvalidChat(_))));
	}

	#[tokio::test]
	async fn store_validates_and_records() {
		let store = store_with_users(&["alice", "bob"]).await;
		let id = store
			.create_chat(NewChat {
				name: "team".to_string(),
				is_group: true,
				members: vec![user("alice"), user("bob")],
			})
			.await
			.unwrap();

		let empty = NewMessage {
			chat_id: id,
			sender: user("alice"),
			content: String::new(),
		};
		assert!(matches!(store.store(empty).await, Err(StoreError::InvalidMessage(_))));

		let stored = store
			.store(NewMessage {
				chat_id: id,
				sender: user("alice"),
				content: "hi".to_string(),
			})
			.await
			.unwrap();
		assert_eq!(stored.content, "hi");
		assert_eq!(store.messages(id).await, vec![stored]);
	}
}
