#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context as _;
use parley_client::{ClientConfig, ClientError, Session};
use parley_domain::{ChatId, EnvelopeKind, Username};
use parley_protocol::{ErrorCode, OutboundFrame};
use parley_server::quic::config::QuicServerConfig;
use parley_server::server::auth::HmacIdentityProvider;
use parley_server::server::connection::ConnectionSettings;
use parley_server::server::context::ServerContext;
use parley_server::server::hub::{HubConfig, HubHandle, spawn_hub};
use parley_server::server::store::{InMemoryStore, NewChat};
use parley_server::server::transport::accept_loop;
use parley_server::util::secret::SecretString;

const SECRET: &str = "smoke-test-secret";

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("PARLEY_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

fn user(name: &str) -> Username {
	Username::new(name).expect("valid username")
}

struct TestServer {
	addr: SocketAddr,
	hub: HubHandle,
	store: Arc<InMemoryStore>,
	chat_id: ChatId,
	endpoint: quinn::Endpoint,
}

impl TestServer {
	async fn start() -> anyhow::Result<Self> {
		init_test_logging();
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

		let store = Arc::new(InMemoryStore::new());
		for name in ["alice", "bob", "carol"] {
			store.ensure_user(&user(name)).await;
		}
		let chat_id = store
			.create_chat(NewChat {
				name: "alice-bob".to_string(),
				is_group: false,
				members: vec![user("alice"), user("bob")],
			})
			.await
			.context("create chat")?;

		let (hub, _hub_task) = spawn_hub(HubConfig::default(), store.clone(), store.clone());

		let quic_cfg = QuicServerConfig::dev(SocketAddr::from(([127, 0, 0, 1], 0)));
		let (endpoint, _cert_der) = quic_cfg.bind_dev_endpoint()?;
		let addr = endpoint.local_addr().context("endpoint local addr")?;

		let identity = Arc::new(HmacIdentityProvider::new(SecretString::new(SECRET)));
		let ctx = ServerContext::new(hub.clone(), identity, ConnectionSettings::default());
		tokio::spawn(accept_loop(endpoint.clone(), ctx));

		Ok(Self {
			addr,
			hub,
			store,
			chat_id,
			endpoint,
		})
	}

	fn token(&self, name: &str) -> String {
		HmacIdentityProvider::new(SecretString::new(SECRET)).issue(&user(name), Duration::from_secs(60))
	}

	fn client_config(&self, token: String) -> ClientConfig {
		ClientConfig {
			server_host: "localhost".to_string(),
			server_port: self.addr.port(),
			server_addr: Some(self.addr),
			connect_timeout: Duration::from_secs(5),
			..ClientConfig::default()
		}
		.with_token(token)
	}

	async fn connect(&self, name: &str) -> anyhow::Result<Session> {
		let session = Session::connect(self.client_config(self.token(name))).await?;
		assert_eq!(session.username(), &user(name));
		Ok(session)
	}

	/// Wait until the hub has registered `n` connections for `name`.
	async fn wait_online(&self, name: &str, n: usize) -> anyhow::Result<()> {
		let name = user(name);
		tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				if let Some(snapshot) = self.hub.snapshot().await
					&& snapshot.connections_of(&name) == n
				{
					return;
				}
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.context("registration timed out")
	}
}

async fn next(session: &mut Session) -> anyhow::Result<OutboundFrame> {
	tokio::time::timeout(Duration::from_secs(5), session.next_envelope())
		.await
		.context("timed out waiting for an envelope")??
		.context("session closed")
}

async fn expect_silence(session: &mut Session) {
	let res = tokio::time::timeout(Duration::from_millis(200), session.next_envelope()).await;
	assert!(res.is_err(), "expected no delivery, got {res:?}");
}

#[tokio::test]
async fn quic_chat_message_reaches_every_recipient_device() -> anyhow::Result<()> {
	let server = TestServer::start().await?;

	let mut alice = server.connect("alice").await?;
	let mut bob_phone = server.connect("bob").await?;
	let mut bob_laptop = server.connect("bob").await?;
	let mut carol = server.connect("carol").await?;
	server.wait_online("bob", 2).await?;
	server.wait_online("alice", 1).await?;
	server.wait_online("carol", 1).await?;

	alice.heartbeat().await?;
	alice.send_chat_message(server.chat_id, "hello over quic").await?;

	for device in [&mut bob_phone, &mut bob_laptop] {
		let got = next(device).await?;
		assert_eq!(got.kind, EnvelopeKind::ChatMessage);
		assert_eq!(got.sender, user("alice"));
		assert_eq!(got.content, "hello over quic");
		assert_eq!(got.chat_id, Some(server.chat_id));
	}

	expect_silence(&mut alice).await;
	expect_silence(&mut carol).await;

	let stored = server.store.messages(server.chat_id).await;
	assert_eq!(stored.len(), 1);
	assert_eq!(stored[0].content, "hello over quic");

	server.endpoint.close(0u32.into(), b"done");
	Ok(())
}

#[tokio::test]
async fn quic_notification_is_delivered_but_not_stored() -> anyhow::Result<()> {
	let server = TestServer::start().await?;

	let mut alice = server.connect("alice").await?;
	let mut bob = server.connect("bob").await?;
	server.wait_online("alice", 1).await?;
	server.wait_online("bob", 1).await?;

	alice.send_notification(server.chat_id, "typing").await?;

	let got = next(&mut bob).await?;
	assert_eq!(got.kind, EnvelopeKind::Notification);
	assert_eq!(got.content, "typing");
	assert_eq!(server.store.message_count().await, 0);

	server.endpoint.close(0u32.into(), b"done");
	Ok(())
}

#[tokio::test]
async fn quic_bad_token_is_rejected_before_registration() -> anyhow::Result<()> {
	let server = TestServer::start().await?;

	let forged = HmacIdentityProvider::new(SecretString::new("wrong-secret")).issue(&user("alice"), Duration::from_secs(60));
	let result = Session::connect(server.client_config(forged)).await;

	match result {
		Err(ClientError::Rejected { code, .. }) => assert_eq!(code, ErrorCode::UNAUTHORIZED),
		Err(other) => panic!("expected handshake rejection, got {other}"),
		Ok(_) => panic!("forged token was accepted"),
	}

	let snapshot = server.hub.snapshot().await.context("hub running")?;
	assert_eq!(snapshot.connection_count(), 0);

	server.endpoint.close(0u32.into(), b"done");
	Ok(())
}

#[tokio::test]
async fn quic_disconnect_unregisters_session() -> anyhow::Result<()> {
	let server = TestServer::start().await?;

	let alice = server.connect("alice").await?;
	server.wait_online("alice", 1).await?;

	alice.close();
	server.wait_online("alice", 0).await?;

	server.endpoint.close(0u32.into(), b"done");
	Ok(())
}
