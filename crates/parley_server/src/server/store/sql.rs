#![forbid(unsafe_code)]

use async_trait::async_trait;
use parley_domain::{ChatId, MessageId, Username};
use tracing::{info, warn};

use super::{MembershipStore, MessageStore, NewChat, NewMessage, StoreError, StoredMessage, validate_message, validate_new_chat};
use crate::util::time::unix_ms_now;

/// SQL-backed membership and message store (SQLite, Postgres or MySQL).
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlStore {
	/// Connect by URL scheme and run the embedded migrations.
	pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
		let max_connections = max_connections.max(1);

		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::sqlite::SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await?;
			sqlx::migrate!("migrations/sqlite").run(&pool).await?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::postgres::PgPoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await?;
			sqlx::migrate!("migrations/postgres").run(&pool).await?;
			SqlBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::mysql::MySqlPoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await?;
			sqlx::migrate!("migrations/mysql").run(&pool).await?;
			SqlBackend::Mysql(pool)
		} else {
			return Err(StoreError::UnsupportedUrl(redact_url(database_url)));
		};

		let store = Self { backend };
		info!(backend = store.backend_name(), "sql store ready");
		Ok(store)
	}

	/// Close the pool. Later queries fail with `sqlx::Error::PoolClosed`.
	pub async fn close(&self) {
		match &self.backend {
			SqlBackend::Sqlite(pool) => pool.close().await,
			SqlBackend::Postgres(pool) => pool.close().await,
			SqlBackend::Mysql(pool) => pool.close().await,
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match self.backend {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
			SqlBackend::Mysql(_) => "mysql",
		}
	}

	/// Create the user if it does not exist yet.
	pub async fn ensure_user(&self, username: &Username) -> Result<(), StoreError> {
		let now = unix_ms_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT OR IGNORE INTO users (username, created_at) VALUES (?, ?)")
					.bind(username.as_str())
					.bind(now)
					.execute(pool)
					.await?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO users (username, created_at) VALUES ($1, $2) ON CONFLICT (username) DO NOTHING")
					.bind(username.as_str())
					.bind(now)
					.execute(pool)
					.await?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("INSERT IGNORE INTO users (username, created_at) VALUES (?, ?)")
					.bind(username.as_str())
					.bind(now)
					.execute(pool)
					.await?;
			}
		}
		Ok(())
	}

	/// Create a chat between existing users. Private chats are unique per pair.
	pub async fn create_chat(&self, chat: NewChat) -> Result<ChatId, StoreError> {
		let members = validate_new_chat(&chat)?;
		let now = unix_ms_now();

		let id = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				for m in &members {
					let row: Option<(String,)> = sqlx::query_as("SELECT username FROM users WHERE username = ?")
						.bind(m.as_str())
						.fetch_optional(&mut *tx)
						.await?;
					if row.is_none() {
						return Err(StoreError::UserNotFound(m.clone()));
					}
				}

				if !chat.is_group {
					let existing: Option<(i64,)> = sqlx::query_as(
						"SELECT cm.chat_id FROM chat_members cm JOIN chats c ON c.id = cm.chat_id \
						WHERE c.is_group = ? AND cm.username IN (?, ?) \
						GROUP BY cm.chat_id HAVING COUNT(DISTINCT cm.username) = 2 LIMIT 1",
					)
					.bind(false)
					.bind(members[0].as_str())
					.bind(members[1].as_str())
					.fetch_optional(&mut *tx)
					.await?;
					if existing.is_some() {
						return Err(duplicate_private_chat());
					}
				}

				let id = sqlx::query("INSERT INTO chats (name, is_group, created_at) VALUES (?, ?, ?)")
					.bind(&chat.name)
					.bind(chat.is_group)
					.bind(now)
					.execute(&mut *tx)
					.await?
					.last_insert_rowid();

				for m in &members {
					sqlx::query("INSERT INTO chat_members (chat_id, username) VALUES (?, ?)")
						.bind(id)
						.bind(m.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
				id
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				for m in &members {
					let row: Option<(String,)> = sqlx::query_as("SELECT username FROM users WHERE username = $1")
						.bind(m.as_str())
						.fetch_optional(&mut *tx)
						.await?;
					if row.is_none() {
						return Err(StoreError::UserNotFound(m.clone()));
					}
				}

				if !chat.is_group {
					let existing: Option<(i64,)> = sqlx::query_as(
						"SELECT cm.chat_id FROM chat_members cm JOIN chats c ON c.id = cm.chat_id \
						WHERE c.is_group = $1 AND cm.username IN ($2, $3) \
						GROUP BY cm.chat_id HAVING COUNT(DISTINCT cm.username) = 2 LIMIT 1",
					)
					.bind(false)
					.bind(members[0].as_str())
					.bind(members[1].as_str())
					.fetch_optional(&mut *tx)
					.await?;
					if existing.is_some() {
						return Err(duplicate_private_chat());
					}
				}

				let (id,): (i64,) =
					sqlx::query_as("INSERT INTO chats (name, is_group, created_at) VALUES ($1, $2, $3) RETURNING id")
						.bind(&chat.name)
						.bind(chat.is_group)
						.bind(now)
						.fetch_one(&mut *tx)
						.await?;

				for m in &members {
					sqlx::query("INSERT INTO chat_members (chat_id, username) VALUES ($1, $2)")
						.bind(id)
						.bind(m.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
				id
			}
			SqlBackend::Mysql(pool) => {
				let mut tx = pool.begin().await?;
				for m in &members {
					let row: Option<(String,)> = sqlx::query_as("SELECT username FROM users WHERE username = ?")
						.bind(m.as_str())
						.fetch_optional(&mut *tx)
						.await?;
					if row.is_none() {
						return Err(StoreError::UserNotFound(m.clone()));
					}
				}

				if !chat.is_group {
					let existing: Option<(i64,)> = sqlx::query_as(
						"SELECT cm.chat_id FROM chat_members cm JOIN chats c ON c.id = cm.chat_id \
						WHERE c.is_group = ? AND cm.username IN (?, ?) \
						GROUP BY cm.chat_id HAVING COUNT(DISTINCT cm.username) = 2 LIMIT 1",
					)
					.bind(false)
					.bind(members[0].as_str())
					.bind(members[1].as_str())
					.fetch_optional(&mut *tx)
					.await?;
					if existing.is_some() {
						return Err(duplicate_private_chat());
					}
				}

				let id = sqlx::query("INSERT INTO chats (name, is_group, created_at) VALUES (?, ?, ?)")
					.bind(&chat.name)
					.bind(chat.is_group)
					.bind(now)
					.execute(&mut *tx)
					.await?
					.last_insert_id() as i64;

				for m in &members {
					sqlx::query("INSERT INTO chat_members (chat_id, username) VALUES (?, ?)")
						.bind(id)
						.bind(m.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
				id
			}
		};

		Ok(ChatId(id as u64))
	}

	async fn chat_exists(&self, chat_id: ChatId) -> Result<bool, StoreError> {
		let chat = chat_key(chat_id)?;
		let row: Option<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id FROM chats WHERE id = ?")
					.bind(chat)
					.fetch_optional(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id FROM chats WHERE id = $1")
					.bind(chat)
					.fetch_optional(pool)
					.await?
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query_as("SELECT id FROM chats WHERE id = ?")
					.bind(chat)
					.fetch_optional(pool)
					.await?
			}
		};
		Ok(row.is_some())
	}

	async fn user_exists(&self, username: &Username) -> Result<bool, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE username = ?")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE username = $1")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE username = ?")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
			}
		};
		Ok(row.is_some())
	}
}

#[async_trait]
impl MembershipStore for SqlStore {
	async fn members(&self, chat_id: ChatId) -> Result<Vec<Username>, StoreError> {
		if !self.chat_exists(chat_id).await? {
			return Err(StoreError::ChatNotFound(chat_id));
		}

		let chat = chat_key(chat_id)?;
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT username FROM chat_members WHERE chat_id = ? ORDER BY username")
					.bind(chat)
					.fetch_all(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT username FROM chat_members WHERE chat_id = $1 ORDER BY username")
					.bind(chat)
					.fetch_all(pool)
					.await?
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query_as("SELECT username FROM chat_members WHERE chat_id = ? ORDER BY username")
					.bind(chat)
					.fetch_all(pool)
					.await?
			}
		};

		let mut members = Vec::with_capacity(rows.len());
		for (name,) in rows {
			match Username::new(name) {
				Ok(u) => members.push(u),
				Err(e) => warn!(chat_id = %chat_id, error = %e, "skipping malformed member username"),
			}
		}
		Ok(members)
	}
}

#[async_trait]
impl MessageStore for SqlStore {
	async fn store(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
		validate_message(&message)?;

		if !self.chat_exists(message.chat_id).await? {
			return Err(StoreError::ChatNotFound(message.chat_id));
		}
		if !self.user_exists(&message.sender).await? {
			return Err(StoreError::UserNotFound(message.sender));
		}

		let stored = StoredMessage {
			id: MessageId::new_v4(),
			chat_id: message.chat_id,
			sender: message.sender,
			content: message.content,
			created_at_unix_ms: unix_ms_now(),
		};
		let id = stored.id.to_string();
		let chat = chat_key(stored.chat_id)?;

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO messages (id, chat_id, sender, content, created_at) VALUES (?, ?, ?, ?, ?)")
					.bind(&id)
					.bind(chat)
					.bind(stored.sender.as_str())
					.bind(&stored.content)
					.bind(stored.created_at_unix_ms)
					.execute(pool)
					.await?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO messages (id, chat_id, sender, content, created_at) VALUES ($1, $2, $3, $4, $5)")
					.bind(&id)
					.bind(chat)
					.bind(stored.sender.as_str())
					.bind(&stored.content)
					.bind(stored.created_at_unix_ms)
					.execute(pool)
					.await?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("INSERT INTO messages (id, chat_id, sender, content, created_at) VALUES (?, ?, ?, ?, ?)")
					.bind(&id)
					.bind(chat)
					.bind(stored.sender.as_str())
					.bind(&stored.content)
					.bind(stored.created_at_unix_ms)
					.execute(pool)
					.await?;
			}
		}

		Ok(stored)
	}
}

/// Ids past `i64::MAX` cannot name a stored chat.
fn chat_key(chat_id: ChatId) -> Result<i64, StoreError> {
	i64::try_from(chat_id.get()).map_err(|_| StoreError::ChatNotFound(chat_id))
}

fn duplicate_private_chat() -> StoreError {
	StoreError::InvalidChat("private chat between these users already exists".to_string())
}

/// Strip credentials before a URL ends up in an error message.
fn redact_url(url: &str) -> String {
	match (url.find("://"), url.rfind('@')) {
		(Some(scheme_end), Some(at)) if at > scheme_end => format!("{}<redacted>{}", &url[..scheme_end + 3], &url[at..]),
		_ => url.to_string(),
	}
}
