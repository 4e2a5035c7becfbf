#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use campus_domain::{ChatId, ConnectionId, RoomKey, UserId};
use campus_protocol::EventKind;
use serde::Serialize;
use serde::ser::Error as _;
use serde_json::json;

use crate::server::hub::{ConnectionHandle, RoomHub, RoomHubConfig};
use crate::server::publisher::{EventPublisher, PublishError};

#[derive(Serialize)]
struct NewMessage<'a> {
	id: i64,
	chat_id: i64,
	text: &'a str,
}

struct Unserializable;

impl Serialize for Unserializable {
	fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
		Err(S::Error::custom("refusing to serialize"))
	}
}

#[tokio::test]
async fn publish_to_chat_delivers_typed_payload() {
	let hub = RoomHub::new(RoomHubConfig::default());
	let publisher = EventPublisher::new(hub.clone());

	let (tx, mut rx) = hub.outbound_queue();
	let handle = ConnectionHandle::new(ConnectionId(1), UserId(1), tx);
	hub.subscribe(RoomKey::for_chat(ChatId(42)), &handle).await;

	let outcome = publisher
		.publish_to_chat(
			ChatId(42),
			EventKind::MessageCreated,
			&NewMessage {
				id: 9,
				chat_id: 42,
				text: "hello",
			},
		)
		.await
		.expect("publish");
	assert_eq!(outcome.delivered, 1);

	let ev = rx.recv().await.expect("event");
	assert_eq!(ev.event, EventKind::MessageCreated);
	assert_eq!(ev.data, json!({ "id": 9, "chat_id": 42, "text": "hello" }));
}

#[tokio::test]
async fn publish_without_subscribers_succeeds() {
	let publisher = EventPublisher::new(RoomHub::new(RoomHubConfig::default()));

	let mut payload = BTreeMap::new();
	payload.insert("chat_id", 7);

	let outcome = publisher
		.publish(&RoomKey::for_chat(ChatId(7)), EventKind::ChatDeleted, &payload)
		.await
		.expect("publish");
	assert_eq!(outcome.delivered, 0);
}

#[tokio::test]
async fn unserializable_payload_is_reported() {
	let publisher = EventPublisher::new(RoomHub::new(RoomHubConfig::default()));

	let err = publisher
		.publish_to_chat(ChatId(1), EventKind::PollCreated, &Unserializable)
		.await
		.expect_err("payload must fail");

	let PublishError::Payload { kind, .. } = err else {
		panic!("expected payload error, got {err:?}");
	};
	assert_eq!(kind, EventKind::PollCreated);
}

#[tokio::test]
async fn oversized_event_is_refused_before_any_queue() {
	let hub = RoomHub::new(RoomHubConfig::default());
	let publisher = EventPublisher::new(hub.clone()).with_max_frame_bytes(1024);

	let (tx, mut rx) = hub.outbound_queue();
	let handle = ConnectionHandle::new(ConnectionId(1), UserId(1), tx);
	let room = RoomKey::for_chat(ChatId(5));
	hub.subscribe(room.clone(), &handle).await;

	let err = publisher
		.publish(&room, EventKind::MessageCreated, &json!({ "text": "x".repeat(2048) }))
		.await
		.expect_err("oversized event must be refused");
	let PublishError::TooLarge { kind, len, max } = err else {
		panic!("expected size error, got {err:?}");
	};
	assert_eq!(kind, EventKind::MessageCreated);
	assert_eq!(max, 1024);
	assert!(len > 2048);

	assert!(rx.try_recv().is_err(), "nothing may be enqueued");
	assert!(hub.is_member(&room, ConnectionId(1)).await);

	let outcome = publisher
		.publish(&room, EventKind::MessageCreated, &json!({ "text": "small" }))
		.await
		.expect("publish");
	assert_eq!(outcome.delivered, 1);
	assert_eq!(rx.recv().await.expect("event").data, json!({ "text": "small" }));
}
