#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use parley_client::{ClientConfig, DEFAULT_SERVER_ENDPOINT_QUIC, Session, SessionReceiver};
use parley_domain::ChatId;
use tokio::io::AsyncBufReadExt as _;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_client [--connect quic://host:port] [--addr ip:port] [--token token] [--chat id]\n\
\n\
Options:\n\
	--connect     Server endpoint (default: {DEFAULT_SERVER_ENDPOINT_QUIC})\n\
	              Format: quic://host:port\n\
	--addr        Server SocketAddr (overrides DNS resolution from --connect)\n\
	--token       Access token (default: $PARLEY_CLIENT_AUTH_TOKEN)\n\
	--chat        Chat id that stdin lines are sent to\n\
	--heartbeat   Heartbeat interval in seconds (default: 30, 0 disables)\n\
	--help        Show this help\n\
\n\
Input:\n\
	Each stdin line is sent as a chat message to --chat.\n\
	Lines starting with /notify are sent as a notification instead.\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_client=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

struct Args {
	cfg: ClientConfig,
	chat_id: Option<ChatId>,
	heartbeat: Option<Duration>,
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT_QUIC.to_string();
	let mut addr_override: Option<SocketAddr> = None;
	let mut token: Option<String> = std::env::var("PARLEY_CLIENT_AUTH_TOKEN")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let mut chat_id = None;
	let mut heartbeat_secs: u64 = 30;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: SocketAddr = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				});
				addr_override = Some(parsed);
			}
			"--token" => {
				token = Some(it.next().unwrap_or_else(|| usage_and_exit()));
			}
			"--chat" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: ChatId = v.parse().unwrap_or_else(|e| {
					eprintln!("Invalid --chat value {v}: {e}");
					usage_and_exit()
				});
				chat_id = Some(parsed);
			}
			"--heartbeat" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				heartbeat_secs = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --heartbeat value: {v}");
					usage_and_exit()
				});
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(token) = token else {
		eprintln!("an access token is required (--token or PARLEY_CLIENT_AUTH_TOKEN)");
		usage_and_exit();
	};

	let mut cfg = ClientConfig::from_quic_endpoint(&endpoint)
		.unwrap_or_else(|e| {
			eprintln!("Invalid --connect value: {endpoint}\n{e}");
			usage_and_exit();
		})
		.with_token(token);
	cfg.client_name = format!("parley-client-cli/{}", env!("CARGO_PKG_VERSION"));
	if addr_override.is_some() {
		cfg.server_addr = addr_override;
	}

	Args {
		cfg,
		chat_id,
		heartbeat: (heartbeat_secs > 0).then(|| Duration::from_secs(heartbeat_secs)),
	}
}

async fn print_envelopes(mut receiver: SessionReceiver) {
	loop {
		match receiver.next_envelope().await {
			Ok(Some(env)) => match env.chat_id {
				Some(chat_id) => println!("[{} #{}] {}: {}", env.kind, chat_id, env.sender, env.content),
				None => println!("[{}] {}: {}", env.kind, env.sender, env.content),
			},
			Ok(None) => {
				info!("server closed the session");
				return;
			}
			Err(e) => {
				warn!(error = %e, "receive failed");
				return;
			}
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let resolved = args
		.cfg
		.server_addr
		.map(|a| a.to_string())
		.unwrap_or_else(|| "<dns>".to_string());
	info!(server = %resolved, sni = %args.cfg.server_host, "connecting");

	let session = Session::connect(args.cfg).await?;
	info!(username = %session.username(), server_name = %session.welcome().server_name, "session established");

	let (mut sender, receiver) = session.split();
	let mut printer = tokio::spawn(print_envelopes(receiver));

	let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
	let mut heartbeat = tokio::time::interval(args.heartbeat.unwrap_or(Duration::from_secs(3600)));
	heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	heartbeat.tick().await;

	loop {
		tokio::select! {
			_ = &mut printer => break,
			_ = heartbeat.tick(), if args.heartbeat.is_some() => {
				sender.heartbeat().await?;
			}
			line = lines.next_line() => {
				let Some(line) = line? else {
					break;
				};
				let line = line.trim();
				if line.is_empty() {
					continue;
				}
				let Some(chat_id) = args.chat_id else {
					warn!("no --chat given; input ignored");
					continue;
				};
				match line.strip_prefix("/notify ") {
					Some(text) => sender.send_notification(chat_id, text).await?,
					None => sender.send_chat_message(chat_id, line).await?,
				}
			}
		}
	}

	sender.close();
	Ok(())
}
