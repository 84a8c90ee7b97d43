#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::Username;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::secret::SecretString;
use crate::util::time::unix_secs_now;

/// Lifetime of tokens minted by `issue_hmac_token` unless told otherwise.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
	#[error("missing auth token")]
	Missing,
	#[error("invalid token format")]
	Format,
	#[error("invalid token signature")]
	Signature,
	#[error("token expired")]
	Expired,
	#[error("invalid token claims: {0}")]
	Claims(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Maps a bearer token to the account it was issued for.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
	async fn resolve(&self, token: &str) -> Result<Username, AuthError>;
}

/// Stateless `v1.<payload>.<sig>` tokens signed with HMAC-SHA256.
#[derive(Debug, Clone)]
pub struct HmacIdentityProvider {
	secret: SecretString,
}

impl HmacIdentityProvider {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	pub fn issue(&self, username: &Username, ttl: Duration) -> String {
		issue_hmac_token(username, self.secret.expose(), ttl)
	}
}

#[async_trait]
impl IdentityProvider for HmacIdentityProvider {
	async fn resolve(&self, token: &str) -> Result<Username, AuthError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(AuthError::Missing);
		}
		let claims = verify_hmac_token(token, self.secret.expose())?;
		Username::new(claims.sub).map_err(|e| AuthError::Claims(e.to_string()))
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	verify_hmac_token_at(token, secret, unix_secs_now())
}

fn verify_hmac_token_at(token: &str, secret: &str, now: u64) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::Format);
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::Format)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Format)?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::Signature);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|e| AuthError::Claims(e.to_string()))?;
	if claims.exp <= now {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Mint a token for `username` valid for `ttl`.
pub fn issue_hmac_token(username: &Username, secret: &str, ttl: Duration) -> String {
	let claims = AuthClaims {
		sub: username.as_str().to_string(),
		exp: unix_secs_now().saturating_add(ttl.as_secs()),
	};
	encode_claims(&claims, secret)
}

fn encode_claims(claims: &AuthClaims, secret: &str) -> String {
	let payload = serde_json::to_vec(claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	// HMAC accepts keys of any length.
	let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
		return Vec::new();
	};
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
