#![forbid(unsafe_code)]

//! Startup seeding of users and chats from `[[seed_chats]]`.

use async_trait::async_trait;
use parley_domain::{ChatId, Username};
use tracing::{info, warn};

use super::{InMemoryStore, NewChat, SqlStore, StoreError};
use crate::config::SeedChat;

/// A store that accounts and chats can be created in.
#[async_trait]
pub trait SeedTarget: Send + Sync {
	async fn ensure_user(&self, username: &Username) -> Result<(), StoreError>;

	async fn create_chat(&self, chat: NewChat) -> Result<ChatId, StoreError>;
}

#[async_trait]
impl SeedTarget for InMemoryStore {
	async fn ensure_user(&self, username: &Username) -> Result<(), StoreError> {
		InMemoryStore::ensure_user(self, username).await;
		Ok(())
	}

	async fn create_chat(&self, chat: NewChat) -> Result<ChatId, StoreError> {
		InMemoryStore::create_chat(self, chat).await
	}
}

#[async_trait]
impl SeedTarget for SqlStore {
	async fn ensure_user(&self, username: &Username) -> Result<(), StoreError> {
		SqlStore::ensure_user(self, username).await
	}

	async fn create_chat(&self, chat: NewChat) -> Result<ChatId, StoreError> {
		SqlStore::create_chat(self, chat).await
	}
}

/// Create every seed's members and chat. A failing seed is logged and skipped.
///
/// Returns how many chats were created.
pub async fn apply_seed_chats<S>(store: &S, seeds: &[SeedChat]) -> usize
where
	S: SeedTarget + ?Sized,
{
	let mut created = 0;
	for seed in seeds {
		match seed_one(store, seed).await {
			Ok(chat_id) => {
				created += 1;
				info!(%chat_id, name = %seed.name, "seed chat created");
			}
			Err(e) => warn!(error = %e, name = %seed.name, "seed chat skipped"),
		}
	}
	created
}

async fn seed_one<S>(store: &S, seed: &SeedChat) -> Result<ChatId, StoreError>
where
	S: SeedTarget + ?Sized,
{
	for member in &seed.members {
		store.ensure_user(member).await?;
	}
	store
		.create_chat(NewChat {
			name: seed.name.clone(),
			is_group: seed.is_group,
			members: seed.members.clone(),
		})
		.await
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::store::MembershipStore;

	fn seed(name: &str, is_group: bool, members: &[&str]) -> SeedChat {
		SeedChat {
			name: name.to_string(),
			is_group,
			members: members.iter().map(|m| Username::new(*m).unwrap()).collect(),
		}
	}

	#[tokio::test]
	async fn bad_seeds_are_skipped_and_the_rest_applied() {
		let store = InMemoryStore::new();
		let seeds = vec![
			seed("lobby", true, &["alice", "bob", "carol"]),
			seed("lonely", true, &["alice"]),
			seed("dm", false, &["alice", "bob"]),
			seed("dm-again", false, &["bob", "alice"]),
		];

		assert_eq!(apply_seed_chats(&store, &seeds).await, 2);
		assert_eq!(store.members(ChatId(1)).await.unwrap().len(), 3);
		assert_eq!(store.members(ChatId(2)).await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn failing_user_creation_skips_the_seed_without_aborting() {
		let store = SqlStore::connect("sqlite::memory:", 1).await.unwrap();
		store.close().await;

		let seeds = vec![seed("lobby", true, &["alice", "bob"])];
		assert_eq!(apply_seed_chats(&store, &seeds).await, 0);
	}
}
