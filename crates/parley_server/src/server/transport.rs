#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use parley_domain::Username;
use parley_protocol::{ErrorCode, HandshakeReply, Hello};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::server::connection::{ConnectionSettings, FrameReader, run_connection, write_frame};
use crate::server::context::ServerContext;

/// QUIC application close codes.
pub mod close_code {
	pub const NORMAL: u32 = 0;
	pub const UNAUTHORIZED: u32 = 1;
	pub const BAD_HANDSHAKE: u32 = 2;
}

/// Result of the Hello exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
	Accepted(Username),
	/// An error reply was sent; the caller closes the transport with `close_code`.
	Rejected { close_code: u32, reason: String },
}

/// Read the client's Hello, authenticate it and write the reply.
///
/// Rejected clients get an error frame and never reach the hub.
pub async fn handshake<R, W>(
	reader: &mut FrameReader<R>,
	writer: &mut W,
	ctx: &ServerContext,
) -> anyhow::Result<HandshakeOutcome>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let settings = &ctx.connection;

	let hello = match tokio::time::timeout(settings.handshake_timeout, reader.next_frame::<Hello>()).await {
		Ok(Ok(Some(hello))) => hello,
		Ok(Ok(None)) => {
			return Ok(HandshakeOutcome::Rejected {
				close_code: close_code::BAD_HANDSHAKE,
				reason: "closed before hello".to_string(),
			});
		}
		Ok(Err(e)) => {
			let reason = format!("invalid hello: {e}");
			reject(writer, settings, ErrorCode::BAD_HANDSHAKE, &reason).await;
			return Ok(HandshakeOutcome::Rejected {
				close_code: close_code::BAD_HANDSHAKE,
				reason,
			});
		}
		Err(_) => {
			let reason = "handshake timed out".to_string();
			reject(writer, settings, ErrorCode::BAD_HANDSHAKE, &reason).await;
			return Ok(HandshakeOutcome::Rejected {
				close_code: close_code::BAD_HANDSHAKE,
				reason,
			});
		}
	};

	let username = match ctx.identity.resolve(&hello.auth_token).await {
		Ok(u) => u,
		Err(e) => {
			metrics::counter!("parley_server_auth_failures_total").increment(1);
			let reason = e.to_string();
			reject(writer, settings, ErrorCode::UNAUTHORIZED, &reason).await;
			return Ok(HandshakeOutcome::Rejected {
				close_code: close_code::UNAUTHORIZED,
				reason,
			});
		}
	};

	let welcome = HandshakeReply::Welcome {
		username: username.clone(),
		server_name: settings.server_name.clone(),
		max_frame_bytes: u32::try_from(settings.max_frame_bytes).unwrap_or(u32::MAX),
	};
	write_frame(writer, &welcome, settings.max_frame_bytes)
		.await
		.context("send welcome")?;

	debug!(%username, client_name = %hello.client_name, "handshake accepted");
	Ok(HandshakeOutcome::Accepted(username))
}

async fn reject<W>(writer: &mut W, settings: &ConnectionSettings, code: &str, message: &str)
where
	W: AsyncWrite + Unpin,
{
	let reply = HandshakeReply::Error {
		code: code.to_string(),
		message: message.to_string(),
	};
	if let Err(e) = write_frame(writer, &reply, settings.max_frame_bytes).await {
		debug!(error = %e, "failed to send handshake error");
	}
}

/// Serve one QUIC connection: one bidirectional stream, handshake, then the session.
pub async fn handle_quic_connection(conn_seq: u64, connection: quinn::Connection, ctx: ServerContext) -> anyhow::Result<()> {
	let (mut send, recv) = connection.accept_bi().await.context("accept bidirectional stream")?;
	let mut reader = FrameReader::new(recv, ctx.connection.max_frame_bytes);

	match handshake(&mut reader, &mut send, &ctx).await? {
		HandshakeOutcome::Accepted(username) => {
			let result = run_connection(ctx.hub.clone(), username, reader, send, ctx.connection.clone()).await;
			connection.close(close_code::NORMAL.into(), b"bye");
			result
		}
		HandshakeOutcome::Rejected { close_code, reason } => {
			info!(conn_seq, remote = %connection.remote_address(), %reason, "handshake rejected");
			let _ = send.finish();
			// Give the error frame a moment to reach the peer before tearing down.
			let _ = tokio::time::timeout(Duration::from_millis(250), send.stopped()).await;
			connection.close(close_code.into(), reason.as_bytes());
			Ok(())
		}
	}
}

/// Accept QUIC connections until the endpoint is closed.
pub async fn accept_loop(endpoint: quinn::Endpoint, ctx: ServerContext) {
	let mut next_seq: u64 = 1;

	while let Some(incoming) = endpoint.accept().await {
		let conn_seq = next_seq;
		next_seq += 1;
		metrics::counter!("parley_server_connections_total").increment(1);

		let ctx = ctx.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					debug!(conn_seq, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_quic_connection(conn_seq, connection, ctx).await {
						warn!(conn_seq, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_seq, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	debug!("accept loop stopped");
}
