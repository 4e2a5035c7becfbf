#![forbid(unsafe_code)]

use core::fmt;

use campus_domain::{ChatId, RoomKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Client → server command action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
	Subscribe,
	Unsubscribe,

	/// Any action string the server does not recognise.
	Unknown(String),
}

impl Action {
	pub fn as_str(&self) -> &str {
		match self {
			Action::Subscribe => "subscribe",
			Action::Unsubscribe => "unsubscribe",
			Action::Unknown(s) => s.as_str(),
		}
	}
}

impl fmt::Display for Action {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl From<&str> for Action {
	fn from(s: &str) -> Self {
		match s {
			"subscribe" => Action::Subscribe,
			"unsubscribe" => Action::Unsubscribe,
			other => Action::Unknown(other.to_string()),
		}
	}
}

impl Serialize for Action {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for Action {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Ok(Action::from(s.as_str()))
	}
}

/// `{"action": "subscribe"|"unsubscribe", "chat_id": <integer>}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCommand {
	pub action: Action,

	/// Required for subscribe/unsubscribe; unknown actions may omit it.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub chat_id: Option<ChatId>,
}

impl ClientCommand {
	pub fn subscribe(chat_id: ChatId) -> Self {
		Self {
			action: Action::Subscribe,
			chat_id: Some(chat_id),
		}
	}

	pub fn unsubscribe(chat_id: ChatId) -> Self {
		Self {
			action: Action::Unsubscribe,
			chat_id: Some(chat_id),
		}
	}

	/// Room this command targets, if it carries a chat id.
	pub fn room(&self) -> Option<RoomKey> {
		self.chat_id.map(RoomKey::for_chat)
	}
}

/// Kinds of chat events pushed to room subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	MessageCreated,
	MessageUpdated,
	MessageDeleted,
	PollCreated,
	VoteCast,
	ChatUpdated,
	ChatDeleted,
}

impl EventKind {
	/// Stable wire name.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::MessageCreated => "message_created",
			EventKind::MessageUpdated => "message_updated",
			EventKind::MessageDeleted => "message_deleted",
			EventKind::PollCreated => "poll_created",
			EventKind::VoteCast => "vote_cast",
			EventKind::ChatUpdated => "chat_updated",
			EventKind::ChatDeleted => "chat_deleted",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// `{"event": <string>, "data": <arbitrary>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
	pub event: EventKind,
	pub data: serde_json::Value,
}

impl ServerEvent {
	pub fn new(event: EventKind, data: serde_json::Value) -> Self {
		Self { event, data }
	}
}
