#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	use thiserror::Error;

	/// URI scheme accepted for server endpoints.
	pub const SCHEME: &str = "quic://";

	/// Default local endpoint for both the server bind and the client connect.
	pub const DEFAULT_LOCAL_ENDPOINT: &str = "quic://127.0.0.1:18300";

	#[derive(Debug, Clone, PartialEq, Eq, Error)]
	pub enum EndpointError {
		#[error("endpoint must be non-empty (expected quic://host:port)")]
		Empty,
		#[error("invalid endpoint (expected quic://host:port): {0}")]
		Scheme(String),
		#[error("invalid endpoint (expected quic://host:port without path/query/fragment): {0}")]
		Trailing(String),
		#[error("invalid endpoint host: {0}")]
		Host(String),
		#[error("invalid endpoint host (IPv6 must be bracketed like quic://[::1]:18300): {0}")]
		UnbracketedIpv6(String),
		#[error("invalid endpoint port (expected 1..=65535): {0}")]
		Port(String),
		#[error("host must be an IP literal (DNS names not supported here): {0}")]
		NotIpLiteral(String),
	}

	/// Parsed `quic://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct QuicEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl QuicEndpoint {
		/// Parse an endpoint string in the form `quic://host:port`.
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointError::Empty);
			}

			let rest = s.strip_prefix(SCHEME).ok_or_else(|| EndpointError::Scheme(s.to_string()))?;
			if rest.contains(['/', '?', '#']) {
				return Err(EndpointError::Trailing(s.to_string()));
			}

			let (host, port) = rest.rsplit_once(':').ok_or_else(|| EndpointError::Port(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(EndpointError::Host(s.to_string()));
			}
			let bracketed = host.starts_with('[') && host.ends_with(']');
			if host.contains(':') && !bracketed {
				return Err(EndpointError::UnbracketedIpv6(s.to_string()));
			}

			let port = match port.trim().parse::<u16>() {
				Ok(p) if p != 0 => p,
				_ => return Err(EndpointError::Port(s.to_string())),
			};

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}

		/// `host:port`, IPv6 hosts stay bracketed.
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Host suitable for TLS SNI (brackets stripped).
		pub fn server_name(&self) -> &str {
			self.host.trim_start_matches('[').trim_end_matches(']')
		}

		/// Convert to `SocketAddr` when the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointError> {
			self.hostport()
				.parse()
				.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
		}
	}

	impl std::fmt::Display for QuicEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "{SCHEME}{}", self.hostport())
		}
	}

}
