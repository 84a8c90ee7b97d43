#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted username length (bytes).
pub const MAX_USERNAME_LEN: usize = 64;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value too long: len={len} max={max}")]
	TooLong { len: usize, max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Authenticated account name. Registry buckets are keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
	/// Create a validated `Username`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if name.len() > MAX_USERNAME_LEN {
			return Err(ParseIdError::TooLong {
				len: name.len(),
				max: MAX_USERNAME_LEN,
			});
		}
		if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
			return Err(ParseIdError::InvalidFormat(
				"username must not contain whitespace or control characters".into(),
			));
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s.to_string())
	}
}

impl TryFrom<String> for Username {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Username::new(value)
	}
}

impl From<Username> for String {
	fn from(value: Username) -> Self {
		value.0
	}
}

/// Chat identifier (database row id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub u64);

impl ChatId {
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ChatId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ChatId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<u64>()
			.map(ChatId)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected unsigned integer chat id, got {s:?}")))
	}
}

/// Process-unique identity of one live connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Server-assigned identifier of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		uuid::Uuid::parse_str(s.trim())
			.map(MessageId)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Envelope kind as declared on the wire.
///
/// Unrecognised kinds are kept verbatim in `Other` so the dispatcher can ignore them
/// explicitly instead of failing the decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeKind {
	ChatMessage,
	Notification,
	Other(String),
}

impl EnvelopeKind {
	pub const CHAT_MESSAGE: &'static str = "chat-message";
	pub const NOTIFICATION: &'static str = "notification";

	/// Parse a wire kind. `"message"` is accepted as a legacy alias for `chat-message`.
	pub fn parse(s: &str) -> Self {
		match s.trim() {
			Self::CHAT_MESSAGE | "message" => EnvelopeKind::ChatMessage,
			Self::NOTIFICATION => EnvelopeKind::Notification,
			other => EnvelopeKind::Other(other.to_string()),
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			EnvelopeKind::ChatMessage => Self::CHAT_MESSAGE,
			EnvelopeKind::Notification => Self::NOTIFICATION,
			EnvelopeKind::Other(s) => s,
		}
	}

	pub fn is_known(&self) -> bool {
		!matches!(self, EnvelopeKind::Other(_))
	}
}

impl fmt::Display for EnvelopeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl From<String> for EnvelopeKind {
	fn from(value: String) -> Self {
		EnvelopeKind::parse(&value)
	}
}

impl From<EnvelopeKind> for String {
	fn from(value: EnvelopeKind) -> Self {
		match value {
			EnvelopeKind::Other(s) => s,
			known => known.as_str().to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn username_validation() {
		assert_eq!(Username::new("alice").unwrap().as_str(), "alice");
		assert_eq!(Username::new("").unwrap_err(), ParseIdError::Empty);
		assert_eq!(Username::new("   ").unwrap_err(), ParseIdError::Empty);
		assert!(matches!(Username::new("al ice"), Err(ParseIdError::InvalidFormat(_))));
		assert!(matches!(Username::new("a".repeat(65)), Err(ParseIdError::TooLong { .. })));
	}

	#[test]
	fn username_deserialize_validates() {
		let ok: Username = serde_json::from_str("\"bob\"").unwrap();
		assert_eq!(ok.as_str(), "bob");
		assert!(serde_json::from_str::<Username>("\"\"").is_err());
	}

	#[test]
	fn chat_id_parse_and_display() {
		assert_eq!("5".parse::<ChatId>().unwrap(), ChatId(5));
		assert_eq!(ChatId(42).to_string(), "42");
		assert!("-1".parse::<ChatId>().is_err());
		assert_eq!("".parse::<ChatId>().unwrap_err(), ParseIdError::Empty);
	}

	#[test]
	fn envelope_kind_parse() {
		assert_eq!(EnvelopeKind::parse("chat-message"), EnvelopeKind::ChatMessage);
		assert_eq!(EnvelopeKind::parse("message"), EnvelopeKind::ChatMessage);
		assert_eq!(EnvelopeKind::parse("notification"), EnvelopeKind::Notification);
		let other = EnvelopeKind::parse("typing");
		assert_eq!(other, EnvelopeKind::Other("typing".to_string()));
		assert!(!other.is_known());
		assert_eq!(other.as_str(), "typing");
	}

	#[test]
	fn envelope_kind_serializes_as_wire_string() {
		let s = serde_json::to_string(&EnvelopeKind::ChatMessage).unwrap();
		assert_eq!(s, "\"chat-message\"");
		let k: EnvelopeKind = serde_json::from_str("\"notification\"").unwrap();
		assert_eq!(k, EnvelopeKind::Notification);
	}

	#[test]
	fn connection_id_display() {
		assert_eq!(ConnectionId(7).to_string(), "conn-7");
	}
}
