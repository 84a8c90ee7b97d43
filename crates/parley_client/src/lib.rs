#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use parley_domain::{ChatId, Username};
use parley_protocol::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, HandshakeReply, Hello, InboundFrame, OutboundFrame, encode_frame,
	try_decode_frame_from_buffer,
};
use parley_util::endpoint::{DEFAULT_LOCAL_ENDPOINT, QuicEndpoint};
use quinn::{Endpoint, TransportConfig, VarInt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info};

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal). Also used as TLS SNI.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Bearer token presented in the handshake.
	pub auth_token: String,

	pub client_name: String,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientError> {
		let e = QuicEndpoint::parse(endpoint).map_err(|e| ClientError::Connect(e.to_string()))?;
		Ok(Self {
			server_addr: e.to_socket_addr_if_ip_literal().ok(),
			server_host: e.server_name().to_string(),
			server_port: e.port,
			..Self::default()
		})
	}

	pub fn with_token(mut self, token: impl Into<String>) -> Self {
		self.auth_token = token.into();
		self
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18300,
			server_addr: Some(SocketAddr::from(([127, 0, 0, 1], 18300))),
			auth_token: String::new(),
			client_name: format!("parley-client/{}", env!("CARGO_PKG_VERSION")),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Default server endpoint for the CLI.
pub const DEFAULT_SERVER_ENDPOINT_QUIC: &str = DEFAULT_LOCAL_ENDPOINT;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// The server answered the handshake with an error.
	#[error("handshake rejected ({code}): {message}")]
	Rejected { code: String, message: String },

	/// Unexpected message ordering/types.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("io error: {0}")]
	Io(String),
}

/// Accepted handshake details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
	pub username: Username,
	pub server_name: String,
	pub max_frame_bytes: usize,
}

/// Connected, authenticated session over one bidirectional stream.
pub struct Session {
	sender: SessionSender,
	receiver: SessionReceiver,
	welcome: Welcome,
}

/// Sending half of a session.
pub struct SessionSender {
	conn: quinn::Connection,
	send: quinn::SendStream,
	max_frame_bytes: usize,
}

/// Receiving half of a session.
pub struct SessionReceiver {
	reader: FrameReader,
}

impl Session {
	/// Connect, open the session stream and perform the handshake.
	pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();
		let candidates = resolve_candidates(&cfg)?;

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientError::Connect(last_err.unwrap_or_else(|| format!("no addresses attempted (sni={server_name})")))
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (mut send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientError::Io(format!("timeout opening session stream after {connect_timeout:?}")))?
			.map_err(|e| ClientError::Io(format!("open_bi failed: {e}")))?;

		let hello = Hello {
			auth_token: cfg.auth_token,
			client_name: cfg.client_name,
		};
		write_message(&mut send, &hello, cfg.max_frame_bytes).await?;

		let mut reader = FrameReader::new(recv, cfg.max_frame_bytes);
		let reply = tokio::time::timeout(connect_timeout, reader.next::<HandshakeReply>())
			.await
			.map_err(|_| ClientError::Protocol(format!("timeout waiting for handshake reply after {connect_timeout:?}")))??;

		let welcome = match reply {
			Some(HandshakeReply::Welcome {
				username,
				server_name,
				max_frame_bytes,
			}) => Welcome {
				username,
				server_name,
				max_frame_bytes: (max_frame_bytes as usize).min(cfg.max_frame_bytes),
			},
			Some(HandshakeReply::Error { code, message }) => {
				return Err(ClientError::Rejected { code, message });
			}
			None => {
				return Err(ClientError::Protocol("stream closed before handshake reply".to_string()));
			}
		};

		debug!(
			username = %welcome.username,
			server_name = %welcome.server_name,
			max_frame_bytes = welcome.max_frame_bytes,
			"received welcome"
		);

		reader.max_frame_bytes = welcome.max_frame_bytes;
		Ok(Self {
			sender: SessionSender {
				conn,
				send,
				max_frame_bytes: welcome.max_frame_bytes,
			},
			receiver: SessionReceiver { reader },
			welcome,
		})
	}

	pub fn welcome(&self) -> &Welcome {
		&self.welcome
	}

	pub fn username(&self) -> &Username {
		&self.welcome.username
	}

	pub async fn send_chat_message(&mut self, chat_id: ChatId, content: impl Into<String>) -> Result<(), ClientError> {
		self.sender.send_chat_message(chat_id, content).await
	}

	pub async fn send_notification(&mut self, chat_id: ChatId, content: impl Into<String>) -> Result<(), ClientError> {
		self.sender.send_notification(chat_id, content).await
	}

	pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
		self.sender.heartbeat().await
	}

	pub async fn next_envelope(&mut self) -> Result<Option<OutboundFrame>, ClientError> {
		self.receiver.next_envelope().await
	}

	/// Split into halves that can live in separate tasks.
	pub fn split(self) -> (SessionSender, SessionReceiver) {
		(self.sender, self.receiver)
	}

	pub fn close(self) {
		self.sender.close();
	}
}

impl SessionSender {
	pub async fn send_chat_message(&mut self, chat_id: ChatId, content: impl Into<String>) -> Result<(), ClientError> {
		self.send_frame(&InboundFrame::chat_message(chat_id, content)).await
	}

	pub async fn send_notification(&mut self, chat_id: ChatId, content: impl Into<String>) -> Result<(), ClientError> {
		self.send_frame(&InboundFrame::notification(chat_id, content)).await
	}

	/// Keepalive; resets the server's idle timer and is never delivered.
	pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
		self.send_frame(&InboundFrame::heartbeat()).await
	}

	pub async fn send_frame(&mut self, frame: &InboundFrame) -> Result<(), ClientError> {
		write_message(&mut self.send, frame, self.max_frame_bytes).await
	}

	/// Finish the stream and close the connection.
	pub fn close(mut self) {
		let _ = self.send.finish();
		self.conn.close(VarInt::from_u32(0), b"bye");
	}
}

impl SessionReceiver {
	/// Next envelope delivered by the server; `Ok(None)` once the server closed the stream.
	///
	/// Cancel safe.
	pub async fn next_envelope(&mut self) -> Result<Option<OutboundFrame>, ClientError> {
		self.reader.next::<OutboundFrame>().await
	}
}

struct FrameReader {
	recv: quinn::RecvStream,
	buf: BytesMut,
	max_frame_bytes: usize,
}

impl FrameReader {
	fn new(recv: quinn::RecvStream, max_frame_bytes: usize) -> Self {
		Self {
			recv,
			buf: BytesMut::with_capacity(8 * 1024),
			max_frame_bytes,
		}
	}

	async fn next<M: DeserializeOwned>(&mut self) -> Result<Option<M>, ClientError> {
		let mut tmp = [0u8; 8192];

		loop {
			// Try decoding first in case the buffer already has a full frame.
			if let Some(msg) = try_decode_frame_from_buffer::<M>(&mut self.buf, self.max_frame_bytes)? {
				return Ok(Some(msg));
			}

			let n = match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) if self.buf.is_empty() => return Ok(None),
				Ok(None) => {
					return Err(ClientError::Protocol(
						"stream closed before receiving full message".to_string(),
					));
				}
				Err(e) => return Err(ClientError::Io(e.to_string())),
			};

			self.buf.extend_from_slice(&tmp[..n]);
		}
	}
}

async fn write_message<M: Serialize>(
	send: &mut quinn::SendStream,
	msg: &M,
	max_frame_bytes: usize,
) -> Result<(), ClientError> {
	let frame = encode_frame(msg, max_frame_bytes)?;
	send.write_all(&frame).await.map_err(|e| ClientError::Io(e.to_string()))?;
	send.flush().await.map_err(|e| ClientError::Io(e.to_string()))?;
	Ok(())
}

fn resolve_candidates(cfg: &ClientConfig) -> Result<Vec<SocketAddr>, ClientError> {
	if let Some(addr) = cfg.server_addr {
		return Ok(vec![addr]);
	}

	let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
	let addrs: Vec<SocketAddr> = hostport
		.to_socket_addrs()
		.map_err(|e| ClientError::Connect(format!("failed to resolve {hostport}: {e}")))?
		.collect();
	if addrs.is_empty() {
		return Err(ClientError::Connect(format!(
			"DNS resolution returned no addresses for {hostport}"
		)));
	}
	Ok(addrs)
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<quinn::ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![parley_protocol::version::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(1));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	transport.keep_alive_interval(Some(Duration::from_secs(15)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_targets_local_server() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert_eq!(cfg.server_addr, Some(SocketAddr::from(([127, 0, 0, 1], 18300))));
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn config_from_endpoint_resolves_ip_literals() {
		let cfg = ClientConfig::from_quic_endpoint("quic://127.0.0.1:4433")
			.unwrap()
			.with_token("t");
		assert_eq!(cfg.server_port, 4433);
		assert_eq!(cfg.server_addr, Some(SocketAddr::from(([127, 0, 0, 1], 4433))));
		assert_eq!(cfg.auth_token, "t");

		let cfg = ClientConfig::from_quic_endpoint("quic://chat.example.com:443").unwrap();
		assert_eq!(cfg.server_host, "chat.example.com");
		assert_eq!(cfg.server_addr, None);
	}

	#[test]
	fn bad_endpoint_is_a_connect_error() {
		assert!(matches!(
			ClientConfig::from_quic_endpoint("http://nope"),
			Err(ClientError::Connect(_))
		));
	}
}
