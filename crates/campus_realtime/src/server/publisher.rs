#![forbid(unsafe_code)]

use campus_domain::{ChatId, RoomKey};
use campus_protocol::{CodecError, DEFAULT_MAX_FRAME_SIZE, EventKind, ServerEvent, encode_event};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::hub::{BroadcastOutcome, RoomHub};

#[derive(Debug, Error)]
pub enum PublishError {
	#[error("failed to serialize {kind} payload: {source}")]
	Payload {
		kind: EventKind,
		#[source]
		source: serde_json::Error,
	},

	#[error("failed to encode {kind} event: {source}")]
	Encode {
		kind: EventKind,
		#[source]
		source: CodecError,
	},

	/// The encoded event would not fit in one frame; nobody received it.
	#[error("{kind} event is {len} bytes, over the {max} byte frame limit")]
	TooLarge {
		kind: EventKind,
		len: usize,
		max: usize,
	},
}

/// Entry point for business logic: pushes an event to every live subscriber of a room.
///
/// Cheap to clone; shares the hub it was built from.
#[derive(Debug, Clone)]
pub struct EventPublisher {
	hub: RoomHub,
	max_frame_bytes: usize,
}

impl EventPublisher {
	pub fn new(hub: RoomHub) -> Self {
		Self {
			hub,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}

	/// Use the same frame limit the connections enforce.
	pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
		self.max_frame_bytes = max_frame_bytes;
		self
	}

	/// Serialize `payload` and broadcast it to `room`.
	///
	/// Delivery is best-effort: recipients with a full queue miss this event and
	/// nobody is told. Errors mean nothing was enqueued: the payload did not
	/// serialize, or the event exceeds the frame limit.
	pub async fn publish<T>(&self, room: &RoomKey, kind: EventKind, payload: &T) -> Result<BroadcastOutcome, PublishError>
	where
		T: Serialize + ?Sized,
	{
		let data = serde_json::to_value(payload).map_err(|source| PublishError::Payload { kind, source })?;
		let event = ServerEvent::new(kind, data);

		// Writers treat an unencodable event as fatal, so it must never reach a queue.
		match encode_event(&event, self.max_frame_bytes) {
			Ok(_) => {}
			Err(CodecError::FrameTooLarge { len, max }) => {
				metrics::counter!("campus_realtime_events_rejected_total", "event" => kind.as_str()).increment(1);
				warn!(room = %room, event = %kind, len, max, "event exceeds frame limit; not published");
				return Err(PublishError::TooLarge { kind, len, max });
			}
			Err(source) => return Err(PublishError::Encode { kind, source }),
		}

		let outcome = self.hub.broadcast(room, event).await;

		metrics::counter!("campus_realtime_events_published_total", "event" => kind.as_str()).increment(1);
		debug!(
			room = %room,
			event = %kind,
			delivered = outcome.delivered,
			dropped = outcome.dropped,
			"published event"
		);

		Ok(outcome)
	}

	/// Shorthand for publishing to the room of `chat_id`.
	pub async fn publish_to_chat<T>(
		&self,
		chat_id: ChatId,
		kind: EventKind,
		payload: &T,
	) -> Result<BroadcastOutcome, PublishError>
	where
		T: Serialize + ?Sized,
	{
		self.publish(&RoomKey::for_chat(chat_id), kind, payload).await
	}
}
