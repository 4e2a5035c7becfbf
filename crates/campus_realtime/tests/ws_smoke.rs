//! End-to-end checks of the gateway over a real socket: handshake auth,
//! subscribe/publish fan-out, and teardown.

use std::net::SocketAddr;
use std::time::Duration;

use campus_domain::{ChatId, RoomKey, SecretString};
use campus_protocol::EventKind;
use campus_realtime::config::ServerConfig;
use campus_realtime::util::time::unix_secs_now;
use campus_realtime::{AuthClaims, RealtimeService, RunningService, issue_token};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const SECRET: &str = "smoke-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
	service: RealtimeService,
	running: RunningService,
}

impl Harness {
	async fn start() -> Self {
		let mut cfg = ServerConfig::default();
		cfg.server.auth_hmac_secret = Some(SecretString::new(SECRET));

		let service = RealtimeService::from_config(&cfg).expect("service");
		let running = service
			.start("127.0.0.1:0".parse().expect("addr"))
			.await
			.expect("start");

		Self { service, running }
	}

	fn addr(&self) -> SocketAddr {
		self.running.local_addr()
	}

	async fn connect(&self, user_id: i64) -> Client {
		let token = token_for(user_id);
		let mut req = format!("ws://{}/ws", self.addr())
			.into_client_request()
			.expect("request");
		req.headers_mut().insert(
			AUTHORIZATION,
			HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
		);

		let (ws, _resp) = connect_async(req).await.expect("connect");
		ws
	}

	async fn wait_for_subscribers(&self, chat_id: i64, expected: usize) {
		let room = RoomKey::for_chat(ChatId(chat_id));
		let hub = self.service.hub();
		timeout(Duration::from_secs(2), async {
			loop {
				let n = hub.room_subscriber_counts().await.get(&room).copied().unwrap_or(0);
				if n == expected {
					return;
				}
				sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.unwrap_or_else(|_| panic!("room {room} never reached {expected} subscribers"));
	}

	async fn wait_for_no_connections(&self) {
		let gateway = self.service.gateway();
		timeout(Duration::from_secs(2), async {
			while gateway.active_connections().await > 0 {
				sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.expect("connections never drained");
	}
}

fn token_for(user_id: i64) -> String {
	issue_token(
		&AuthClaims {
			sub: user_id,
			is_teacher: false,
			email: format!("user{user_id}@example.edu"),
			full_name: format!("User {user_id}"),
			exp: unix_secs_now() + 300,
			jti: Some(format!("smoke-{user_id}")),
		},
		SECRET,
	)
	.expect("issue token")
}

async fn send_json(ws: &mut Client, value: serde_json::Value) {
	ws.send(Message::text(value.to_string())).await.expect("send");
}

async fn next_event(ws: &mut Client) -> serde_json::Value {
	loop {
		let msg = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("timed out waiting for event")
			.expect("stream open")
			.expect("websocket error");
		match msg {
			Message::Text(text) => return serde_json::from_str(text.as_str()).expect("event json"),
			Message::Ping(_) | Message::Pong(_) => continue,
			other => panic!("unexpected frame: {other:?}"),
		}
	}
}

async fn assert_no_event(ws: &mut Client) {
	let got = timeout(Duration::from_millis(150), ws.next()).await;
	assert!(got.is_err(), "unexpected frame: {got:?}");
}

/// The server closed the connection: a close frame, end of stream, or a reset.
async fn assert_closed_by_server(ws: &mut Client) {
	loop {
		match timeout(Duration::from_secs(2), ws.next()).await.expect("server did not close") {
			Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
			Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
			Some(Ok(other)) => panic!("expected close, got {other:?}"),
		}
	}
}

#[tokio::test]
async fn handshake_without_valid_token_is_rejected() {
	let harness = Harness::start().await;
	let url = format!("ws://{}/ws", harness.addr());

	match connect_async(url.as_str()).await.map(|_| ()) {
		Err(WsError::Http(resp)) => assert_eq!(resp.status(), 401),
		other => panic!("expected 401, got {other:?}"),
	}

	let mut req = url.as_str().into_client_request().expect("request");
	req.headers_mut()
		.insert(AUTHORIZATION, HeaderValue::from_static("Bearer v1.bogus.token"));
	match connect_async(req).await.map(|_| ()) {
		Err(WsError::Http(resp)) => assert_eq!(resp.status(), 401),
		other => panic!("expected 401, got {other:?}"),
	}

	assert_eq!(harness.service.gateway().active_connections().await, 0);
}

#[tokio::test]
async fn revoked_token_is_rejected() {
	let harness = Harness::start().await;
	harness
		.service
		.revocations()
		.revoke("smoke-9", unix_secs_now() + 300)
		.await;

	let mut req = format!("ws://{}/ws", harness.addr())
		.into_client_request()
		.expect("request");
	req.headers_mut().insert(
		AUTHORIZATION,
		HeaderValue::from_str(&format!("Bearer {}", token_for(9))).expect("header"),
	);

	match connect_async(req).await.map(|_| ()) {
		Err(WsError::Http(resp)) => assert_eq!(resp.status(), 401),
		other => panic!("expected 401, got {other:?}"),
	}
}

#[tokio::test]
async fn health_checks_are_served_on_the_gateway_listener() {
	let harness = Harness::start().await;

	let mut stream = TcpStream::connect(harness.addr()).await.expect("connect");
	stream
		.write_all(b"GET /readyz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
		.await
		.expect("write");

	let mut body = String::new();
	stream.read_to_string(&mut body).await.expect("read");
	assert!(body.starts_with("HTTP/1.1 200"), "unexpected response: {body}");
	assert!(body.ends_with("ready"));
}

#[tokio::test]
async fn publish_reaches_only_the_subscribed_room() {
	let harness = Harness::start().await;
	let mut c1 = harness.connect(1).await;
	let mut c2 = harness.connect(2).await;

	send_json(&mut c1, json!({ "action": "subscribe", "chat_id": 42 })).await;
	send_json(&mut c2, json!({ "action": "subscribe", "chat_id": 43 })).await;
	harness.wait_for_subscribers(42, 1).await;
	harness.wait_for_subscribers(43, 1).await;

	let outcome = harness
		.service
		.publisher()
		.publish_to_chat(ChatId(42), EventKind::MessageCreated, &json!({ "id": 1, "text": "hi" }))
		.await
		.expect("publish");
	assert_eq!(outcome.delivered, 1);

	let event = next_event(&mut c1).await;
	assert_eq!(event, json!({ "event": "message_created", "data": { "id": 1, "text": "hi" } }));

	assert_no_event(&mut c1).await;
	assert_no_event(&mut c2).await;
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
	let harness = Harness::start().await;
	let mut ws = harness.connect(1).await;

	send_json(&mut ws, json!({ "action": "subscribe", "chat_id": 7 })).await;
	harness.wait_for_subscribers(7, 1).await;
	send_json(&mut ws, json!({ "action": "unsubscribe", "chat_id": 7 })).await;
	harness.wait_for_subscribers(7, 0).await;

	let outcome = harness
		.service
		.publisher()
		.publish_to_chat(ChatId(7), EventKind::VoteCast, &json!({ "poll_id": 3 }))
		.await
		.expect("publish");
	assert_eq!(outcome.delivered, 0);
	assert_no_event(&mut ws).await;
}

#[tokio::test]
async fn unknown_action_keeps_connection_open() {
	let harness = Harness::start().await;
	let mut ws = harness.connect(1).await;

	send_json(&mut ws, json!({ "action": "typing", "chat_id": 11 })).await;
	send_json(&mut ws, json!({ "action": "subscribe", "chat_id": 11 })).await;
	harness.wait_for_subscribers(11, 1).await;

	harness
		.service
		.publisher()
		.publish_to_chat(ChatId(11), EventKind::PollCreated, &json!({ "poll_id": 1 }))
		.await
		.expect("publish");

	let event = next_event(&mut ws).await;
	assert_eq!(event["event"], "poll_created");
}

#[tokio::test]
async fn malformed_frame_closes_connection_and_cleans_up() {
	let harness = Harness::start().await;
	let mut ws = harness.connect(1).await;

	send_json(&mut ws, json!({ "action": "subscribe", "chat_id": 5 })).await;
	harness.wait_for_subscribers(5, 1).await;

	ws.send(Message::text("not json")).await.expect("send");
	assert_closed_by_server(&mut ws).await;

	harness.wait_for_subscribers(5, 0).await;
	harness.wait_for_no_connections().await;
}

#[tokio::test]
async fn forced_disconnect_self_heals_membership() {
	let harness = Harness::start().await;
	let mut ws = harness.connect(1).await;

	send_json(&mut ws, json!({ "action": "subscribe", "chat_id": 5 })).await;
	harness.wait_for_subscribers(5, 1).await;

	assert_eq!(harness.service.gateway().disconnect_all().await, 1);
	assert_closed_by_server(&mut ws).await;

	harness.wait_for_subscribers(5, 0).await;
	let outcome = harness
		.service
		.publisher()
		.publish_to_chat(ChatId(5), EventKind::MessageDeleted, &json!({ "id": 1 }))
		.await
		.expect("publish");
	assert_eq!(outcome.delivered, 0);
}

#[tokio::test]
async fn client_going_away_removes_its_subscriptions() {
	let harness = Harness::start().await;
	let mut ws = harness.connect(1).await;

	send_json(&mut ws, json!({ "action": "subscribe", "chat_id": 5 })).await;
	send_json(&mut ws, json!({ "action": "subscribe", "chat_id": 6 })).await;
	harness.wait_for_subscribers(5, 1).await;
	harness.wait_for_subscribers(6, 1).await;

	drop(ws);

	harness.wait_for_subscribers(5, 0).await;
	harness.wait_for_subscribers(6, 0).await;
	harness.wait_for_no_connections().await;
	assert!(harness.service.hub().room_subscriber_counts().await.is_empty());
}

#[tokio::test]
async fn shutdown_disconnects_clients() {
	let harness = Harness::start().await;
	let mut ws = harness.connect(1).await;
	send_json(&mut ws, json!({ "action": "subscribe", "chat_id": 8 })).await;
	harness.wait_for_subscribers(8, 1).await;

	let service = harness.service.clone();
	harness.running.shutdown().await;

	assert_closed_by_server(&mut ws).await;
	assert!(!service.health().is_ready());
	assert!(service.hub().room_subscriber_counts().await.is_empty());
}

#[tokio::test]
async fn gateway_refuses_upgrades_once_shutting_down() {
	let harness = Harness::start().await;
	let mut ws = harness.connect(1).await;
	send_json(&mut ws, json!({ "action": "subscribe", "chat_id": 4 })).await;
	harness.wait_for_subscribers(4, 1).await;

	harness.service.gateway().shutdown(Duration::from_secs(1)).await;
	assert_closed_by_server(&mut ws).await;
	harness.wait_for_no_connections().await;

	let mut req = format!("ws://{}/ws", harness.addr())
		.into_client_request()
		.expect("request");
	req.headers_mut().insert(
		AUTHORIZATION,
		HeaderValue::from_str(&format!("Bearer {}", token_for(2))).expect("header"),
	);
	match connect_async(req).await.map(|_| ()) {
		Err(WsError::Http(resp)) => assert_eq!(resp.status(), 503),
		other => panic!("expected 503, got {other:?}"),
	}
	assert_eq!(harness.service.gateway().active_connections().await, 0);
	assert!(harness.service.hub().room_subscriber_counts().await.is_empty());
}
