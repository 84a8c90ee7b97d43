#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use parley_domain::Username;
use parley_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use parley_server::quic::config::QuicServerConfig;
use parley_server::server::auth::{DEFAULT_TOKEN_TTL, HmacIdentityProvider};
use parley_server::server::context::ServerContext;
use parley_server::server::health::{HealthState, spawn_health_server};
use parley_server::server::hub::spawn_hub;
use parley_server::server::store::{InMemoryStore, MembershipStore, MessageStore, SqlStore, apply_seed_chats};
use parley_server::server::transport::accept_loop;
use parley_util::endpoint::{DEFAULT_LOCAL_ENDPOINT, QuicEndpoint};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind quic://host:port] [--config path] [--issue-token username]\n\
\n\
Options:\n\
\t--bind          Bind endpoint (default: {DEFAULT_LOCAL_ENDPOINT})\n\
\t               Format: quic://host:port\n\
\t--config        Config file (default: ~/.parley/config.toml)\n\
\t--issue-token   Print a signed access token for username and exit\n\
\t--help          Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind_addr: SocketAddr,
	config_path: Option<PathBuf>,
	issue_token_for: Option<Username>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = DEFAULT_LOCAL_ENDPOINT.to_string();
	let mut config_path = None;
	let mut issue_token_for = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			"--issue-token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let username = Username::new(v).unwrap_or_else(|e| {
					eprintln!("invalid username: {e}");
					usage_and_exit();
				});
				issue_token_for = Some(username);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let bind_addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args {
		bind_addr,
		config_path,
		issue_token_for,
	}
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("parley_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

struct Stores {
	membership: Arc<dyn MembershipStore>,
	messages: Arc<dyn MessageStore>,
	sql: Option<SqlStore>,
}

async fn open_stores(cfg: &ServerConfig) -> anyhow::Result<Stores> {
	if cfg.persistence.enabled {
		let Some(database_url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow!("persistence enabled but no database_url configured"));
		};
		let store = SqlStore::connect(database_url, cfg.persistence.max_connections)
			.await
			.context("connect persistence store")?;
		info!(backend = store.backend_name(), "persistence enabled");

		apply_seed_chats(&store, &cfg.seed_chats).await;
		let shared = Arc::new(store.clone());
		Ok(Stores {
			membership: shared.clone(),
			messages: shared,
			sql: Some(store),
		})
	} else {
		let store = Arc::new(InMemoryStore::new());
		warn!("persistence disabled; chats and messages are kept in memory only");

		apply_seed_chats(store.as_ref(), &cfg.seed_chats).await;
		Ok(Stores {
			membership: store.clone(),
			messages: store,
			sql: None,
		})
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => default_config_path()?,
	};
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let Some(secret) = server_cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow!(
			"no auth_hmac_secret configured (set [server].auth_hmac_secret or PARLEY_SERVER_AUTH_HMAC_SECRET)"
		));
	};
	let identity = Arc::new(HmacIdentityProvider::new(secret));

	if let Some(username) = args.issue_token_for {
		println!("{}", identity.issue(&username, DEFAULT_TOKEN_TTL));
		return Ok(());
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let stores = open_stores(&server_cfg).await?;
	let (hub, hub_task) = spawn_hub(server_cfg.hub_config(), stores.membership, stores.messages);

	let health_state = HealthState::new(hub.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::dev(args.bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind_addr,
			cert_der_len = server_cert_der.len(),
			"parley_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let ctx = ServerContext::new(hub.clone(), identity, server_cfg.connection_settings());

	health_state.mark_ready();

	tokio::select! {
		_ = accept_loop(endpoint.clone(), ctx) => {
			warn!("accept loop ended unexpectedly");
		}
		res = tokio::signal::ctrl_c() => {
			if let Err(e) = res {
				warn!(error = %e, "failed to listen for ctrl-c");
			}
			info!("shutdown requested");
		}
	}

	health_state.mark_not_ready();
	endpoint.close(0u32.into(), b"server shutting down");
	hub.shutdown().await;
	if let Err(e) = hub_task.await {
		warn!(error = %e, "hub task failed");
	}
	endpoint.wait_idle().await;
	if let Some(sql) = stores.sql {
		sql.close().await;
	}
	info!("parley_server stopped");

	Ok(())
}
