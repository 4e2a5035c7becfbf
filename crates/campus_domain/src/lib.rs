#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Numeric chat identifier as stored by the chat backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl ChatId {
	pub const fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for ChatId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Authenticated user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Process-local identifier of one live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Broadcast room key, derived from a chat id as `chat_<id>`.
///
/// Publishers and subscribers both derive the key from the numeric chat id, so
/// no naming service is needed to agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
	/// Prefix for chat rooms.
	pub const CHAT_PREFIX: &'static str = "chat_";

	/// Room for the given chat.
	pub fn for_chat(chat_id: ChatId) -> Self {
		Self(format!("{}{}", Self::CHAT_PREFIX, chat_id.0))
	}

	/// Parse a `chat_<id>` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let id = s
			.strip_prefix(Self::CHAT_PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat("expected chat_<id>".into()))?;

		let id: i64 = id
			.parse()
			.map_err(|_| ParseIdError::InvalidFormat(format!("chat id is not an integer: {id}")))?;

		Ok(Self::for_chat(ChatId(id)))
	}

	/// Chat id this room was derived from.
	pub fn chat_id(&self) -> Option<ChatId> {
		self.0
			.strip_prefix(Self::CHAT_PREFIX)
			.and_then(|id| id.parse().ok())
			.map(ChatId)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<ChatId> for RoomKey {
	fn from(chat_id: ChatId) -> Self {
		Self::for_chat(chat_id)
	}
}

impl fmt::Display for RoomKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomKey::parse(s)
	}
}

/// String wrapper that never prints its contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn room_key_from_chat_id() {
		let room = RoomKey::for_chat(ChatId(42));
		assert_eq!(room.as_str(), "chat_42");
		assert_eq!(room.chat_id(), Some(ChatId(42)));
		assert_eq!(room.to_string(), "chat_42");
	}

	#[test]
	fn room_key_parse_rejects_bad_input() {
		assert_eq!(RoomKey::parse("  "), Err(ParseIdError::Empty));
		assert!(RoomKey::parse("room_1").is_err());
		assert!(RoomKey::parse("chat_").is_err());
		assert!(RoomKey::parse("chat_abc").is_err());
	}

	#[test]
	fn secret_string_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.expose(), "hunter2");
	}

	proptest! {
		#[test]
		fn room_key_parse_matches_derivation(id in any::<i64>()) {
			let derived = RoomKey::for_chat(ChatId(id));
			let parsed: RoomKey = derived.as_str().parse().unwrap();
			prop_assert_eq!(parsed, derived);
		}
	}
}
