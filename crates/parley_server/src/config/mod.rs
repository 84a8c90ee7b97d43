#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_domain::Username;
use parley_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::connection::ConnectionSettings;
use crate::server::hub::{HubConfig, PersistFailurePolicy};
use crate::util::secret::SecretString;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides. A missing file means defaults.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub hub: HubSettings,
	pub persistence: PersistenceSettings,
	/// Chats created at startup; see `SeedChat`.
	pub seed_chats: Vec<SeedChat>,
}

/// Listener, TLS, auth and framing settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,
	pub max_frame_bytes: usize,
	pub handshake_timeout: Duration,
	/// How long a released connection may spend flushing what is still queued.
	pub drain_timeout: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			handshake_timeout: Duration::from_secs(10),
			drain_timeout: Duration::from_secs(2),
		}
	}
}

/// Hub sizing and failure policy.
#[derive(Debug, Clone)]
pub struct HubSettings {
	pub event_channel_capacity: usize,
	pub outbound_queue_capacity: usize,
	pub persist_failure: PersistFailurePolicy,
	/// Drop chat traffic from senders outside the chat's membership.
	pub reject_non_members: bool,
	/// `None` disables the read-side idle timer.
	pub idle_timeout: Option<Duration>,
	pub debug_logs: bool,
}

impl Default for HubSettings {
	fn default() -> Self {
		let hub = HubConfig::default();
		Self {
			event_channel_capacity: hub.event_channel_capacity,
			outbound_queue_capacity: hub.outbound_queue_capacity,
			persist_failure: hub.persist_failure,
			reject_non_members: hub.reject_non_members,
			idle_timeout: Some(Duration::from_secs(90)),
			debug_logs: hub.debug_logs,
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Enable persistence. When off, chats and messages live in memory.
	pub enabled: bool,
	/// Database URL (`sqlite:`, `postgres:` or `mysql:`).
	pub database_url: Option<String>,
	pub max_connections: u32,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			database_url: None,
			max_connections: 8,
		}
	}
}

/// A chat to create at startup, together with its member accounts.
///
/// Creation errors (e.g. the private chat already exists) are logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedChat {
	pub name: String,
	pub is_group: bool,
	pub members: Vec<Username>,
}

impl ServerConfig {
	pub fn hub_config(&self) -> HubConfig {
		HubConfig {
			event_channel_capacity: self.hub.event_channel_capacity,
			outbound_queue_capacity: self.hub.outbound_queue_capacity,
			persist_failure: self.hub.persist_failure,
			reject_non_members: self.hub.reject_non_members,
			debug_logs: self.hub.debug_logs,
		}
	}

	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			max_frame_bytes: self.server.max_frame_bytes,
			idle_timeout: self.hub.idle_timeout,
			handshake_timeout: self.server.handshake_timeout,
			drain_timeout: self.server.drain_timeout,
			..ConnectionSettings::default()
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	hub: FileHubSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	seed_chats: Vec<FileSeedChat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	max_frame_bytes: Option<usize>,
	handshake_timeout_ms: Option<u64>,
	drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	event_channel_capacity: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	persist_failure: Option<String>,
	reject_non_members: Option<bool>,
	idle_timeout_secs: Option<u64>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileSeedChat {
	name: String,
	#[serde(default)]
	group: bool,
	members: Vec<String>,
}

fn idle_timeout_from_secs(secs: u64) -> Option<Duration> {
	(secs > 0).then(|| Duration::from_secs(secs))
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = Self::default();

		let persist_failure = match file.hub.persist_failure.as_deref().map(str::trim) {
			None | Some("") => defaults.hub.persist_failure,
			Some(v) => v.parse().map_err(|e| anyhow!("hub.persist_failure: {e}"))?,
		};

		let seed_chats = file
			.seed_chats
			.into_iter()
			.map(|chat| {
				let members = chat
					.members
					.iter()
					.map(|m| Username::new(m.as_str()))
					.collect::<Result<Vec<_>, _>>()
					.with_context(|| format!("seed chat {:?}: invalid member", chat.name))?;
				Ok(SeedChat {
					name: chat.name,
					is_group: chat.group,
					members,
				})
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		Ok(Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.max_frame_bytes),
				handshake_timeout: file
					.server
					.handshake_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.server.handshake_timeout),
				drain_timeout: file
					.server
					.drain_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.server.drain_timeout),
			},
			hub: HubSettings {
				event_channel_capacity: file
					.hub
					.event_channel_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.hub.event_channel_capacity),
				outbound_queue_capacity: file
					.hub
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.hub.outbound_queue_capacity),
				persist_failure,
				reject_non_members: file.hub.reject_non_members.unwrap_or(defaults.hub.reject_non_members),
				idle_timeout: match file.hub.idle_timeout_secs {
					Some(secs) => idle_timeout_from_secs(secs),
					None => defaults.hub.idle_timeout,
				},
				debug_logs: file.hub.debug_logs.unwrap_or(defaults.hub.debug_logs),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				max_connections: file
					.persistence
					.max_connections
					.filter(|v| *v > 0)
					.unwrap_or(defaults.persistence.max_connections),
			},
			seed_chats,
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `PARLEY_*` overrides. `get` is the variable lookup (`std::env::var` in production).
fn apply_env_overrides(cfg: &mut ServerConfig, get: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("PARLEY_SERVER_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_SERVER_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_SERVER_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_MAX_FRAME_BYTES")
		&& let Ok(max) = v.parse::<usize>()
		&& max > 0
	{
		cfg.server.max_frame_bytes = max;
		info!(max, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_HUB_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.hub.outbound_queue_capacity = capacity;
		info!(capacity, "hub config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_HUB_PERSIST_FAILURE") {
		match v.parse::<PersistFailurePolicy>() {
			Ok(policy) => {
				cfg.hub.persist_failure = policy;
				info!(policy = policy.as_str(), "hub config: persist_failure overridden by env");
			}
			Err(e) => warn!(error = %e, "hub config: ignoring PARLEY_HUB_PERSIST_FAILURE"),
		}
	}

	if let Some(v) = non_empty("PARLEY_HUB_REJECT_NON_MEMBERS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.hub.reject_non_members = enabled;
		info!(enabled, "hub config: reject_non_members overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_HUB_IDLE_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.hub.idle_timeout = idle_timeout_from_secs(secs);
		info!(secs, "hub config: idle_timeout overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_HUB_DEBUG_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.hub.debug_logs = enabled;
		info!(enabled, "hub config: debug_logs overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.persistence.enabled && cfg.persistence.database_url.is_none() {
		warn!("persistence: enabled without database_url; startup will fail");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> anyhow::Result<ServerConfig> {
		let file: FileConfig = toml::from_str(toml_src)?;
		ServerConfig::from_file(file)
	}

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = parse("").unwrap();
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(cfg.server.handshake_timeout, Duration::from_secs(10));
		assert_eq!(cfg.hub.event_channel_capacity, 1024);
		assert_eq!(cfg.hub.outbound_queue_capacity, 64);
		assert_eq!(cfg.hub.persist_failure, PersistFailurePolicy::Proceed);
		assert_eq!(cfg.hub.idle_timeout, Some(Duration::from_secs(90)));
		assert!(cfg.hub.reject_non_members);
		assert_eq!(cfg.server.drain_timeout, Duration::from_secs(2));
		assert!(!cfg.persistence.enabled);
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert!(cfg.seed_chats.is_empty());
	}

	#[test]
	fn file_values_are_normalised() {
		let cfg = parse(
			r#"
			[server]
			auth_hmac_secret = "  "
			health_bind = "127.0.0.1:9101"
			handshake_timeout_ms = 2500
			drain_timeout_ms = 500

			[hub]
			outbound_queue_capacity = 0
			persist_failure = "abort"
			idle_timeout_secs = 0
			reject_non_members = false

			[persistence]
			enabled = true
			database_url = "sqlite://parley.db"

			[[seed_chats]]
			name = "lobby"
			group = true
			members = ["alice", "bob", "carol"]
			"#,
		)
		.unwrap();

		assert!(cfg.server.auth_hmac_secret.is_none());
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9101"));
		assert_eq!(cfg.server.handshake_timeout, Duration::from_millis(2500));
		assert_eq!(cfg.hub.outbound_queue_capacity, 64);
		assert_eq!(cfg.hub.persist_failure, PersistFailurePolicy::Abort);
		assert_eq!(cfg.hub.idle_timeout, None);
		assert!(!cfg.hub.reject_non_members);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.seed_chats.len(), 1);
		assert!(cfg.seed_chats[0].is_group);
		assert_eq!(cfg.seed_chats[0].members.len(), 3);

		let conn = cfg.connection_settings();
		assert_eq!(conn.idle_timeout, None);
		assert_eq!(conn.drain_timeout, Duration::from_millis(500));
		assert_eq!(cfg.hub_config().persist_failure, PersistFailurePolicy::Abort);
		assert!(!cfg.hub_config().reject_non_members);
	}

	#[test]
	fn unknown_persist_policy_is_an_error() {
		assert!(parse("[hub]\npersist_failure = \"retry\"").is_err());
	}

	#[test]
	fn invalid_seed_member_is_an_error() {
		let err = parse("[[seed_chats]]\nname = \"x\"\nmembers = [\"has space\", \"bob\"]").unwrap_err();
		assert!(format!("{err:#}").contains("seed chat"));
	}

	#[test]
	fn env_overrides_win_and_bad_values_are_ignored() {
		let env: HashMap<&str, &str> = HashMap::from([
			("PARLEY_SERVER_AUTH_HMAC_SECRET", "from-env"),
			("PARLEY_HUB_OUTBOUND_QUEUE_CAPACITY", "8"),
			("PARLEY_HUB_PERSIST_FAILURE", "sometimes"),
			("PARLEY_HUB_IDLE_TIMEOUT_SECS", "30"),
			("PARLEY_HUB_REJECT_NON_MEMBERS", "off"),
			("PARLEY_PERSISTENCE_ENABLED", "yes"),
			("PARLEY_MAX_FRAME_BYTES", "not-a-number"),
		]);

		let mut cfg = parse("").unwrap();
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(
			cfg.server.auth_hmac_secret.as_ref().map(SecretString::expose),
			Some("from-env")
		);
		assert_eq!(cfg.hub.outbound_queue_capacity, 8);
		assert_eq!(cfg.hub.persist_failure, PersistFailurePolicy::Proceed);
		assert_eq!(cfg.hub.idle_timeout, Some(Duration::from_secs(30)));
		assert!(!cfg.hub.reject_non_members);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
	}

	#[test]
	fn missing_file_means_defaults() {
		let path = std::env::temp_dir().join("parley-config-does-not-exist.toml");
		assert!(read_toml_if_exists(&path).unwrap().is_none());
	}

	#[test]
	fn parse_env_bool_accepts_common_spellings() {
		assert_eq!(parse_env_bool(" ON "), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
