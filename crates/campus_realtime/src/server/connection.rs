#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use campus_domain::ConnectionId;
use campus_protocol::{Action, ClientCommand, DEFAULT_MAX_FRAME_SIZE, decode_command, encode_event};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::auth::AuthenticatedUser;
use crate::server::hub::{ConnectionHandle, OutboundEvent, RoomHub};

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	/// How often the writer pings an otherwise idle peer.
	pub ping_interval: Duration,

	/// Maximum silence (no frame of any kind, pongs included) before the peer is considered gone.
	pub read_timeout: Duration,

	pub write_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			ping_interval: Duration::from_secs(54),
			read_timeout: Duration::from_secs(60),
			write_timeout: Duration::from_secs(10),
		}
	}
}

/// Lifecycle of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Connecting,
	Authenticated,
	Active,
	Closing,
	Closed,
}

/// Why a connection left the `Active` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
	PeerClosed,
	ReadError(String),
	ReadTimeout,
	WriteError(String),
	WriteTimeout,
	Encode(String),
	Decode(String),
	Disconnect,
}

impl CloseReason {
	fn as_metric_label(&self) -> &'static str {
		match self {
			CloseReason::PeerClosed => "peer_closed",
			CloseReason::ReadError(_) => "read_error",
			CloseReason::ReadTimeout => "read_timeout",
			CloseReason::WriteError(_) => "write_error",
			CloseReason::WriteTimeout => "write_timeout",
			CloseReason::Encode(_) => "encode_error",
			CloseReason::Decode(_) => "decode_error",
			CloseReason::Disconnect => "disconnect",
		}
	}
}

impl fmt::Display for CloseReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CloseReason::ReadError(e) | CloseReason::WriteError(e) | CloseReason::Encode(e) | CloseReason::Decode(e) => {
				write!(f, "{}: {e}", self.as_metric_label())
			}
			other => f.write_str(other.as_metric_label()),
		}
	}
}

/// Shared, first-wins close signal for the two connection loops.
#[derive(Debug, Clone)]
pub struct CloseSignal {
	tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl Default for CloseSignal {
	fn default() -> Self {
		Self::new()
	}
}

impl CloseSignal {
	pub fn new() -> Self {
		let (tx, _rx) = watch::channel(None);
		Self { tx: Arc::new(tx) }
	}

	/// Record `reason` and wake every waiter. Only the first call has any effect;
	/// returns whether this call was it.
	pub fn close(&self, reason: CloseReason) -> bool {
		self.tx.send_if_modified(|current| {
			if current.is_some() {
				return false;
			}
			*current = Some(reason);
			true
		})
	}

	/// Wait until the signal fires and return the winning reason.
	pub async fn closed(&self) -> CloseReason {
		let mut rx = self.tx.subscribe();
		match rx.wait_for(Option::is_some).await {
			Ok(reason) => (*reason).clone().unwrap_or(CloseReason::Disconnect),
			Err(_) => CloseReason::Disconnect,
		}
	}
}

/// External control over a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionControl {
	id: ConnectionId,
	close: CloseSignal,
	state: watch::Receiver<ConnectionState>,
}

impl ConnectionControl {
	pub fn id(&self) -> ConnectionId {
		self.id
	}

	/// Explicit disconnect request.
	pub fn disconnect(&self) -> bool {
		self.close.close(CloseReason::Disconnect)
	}

	pub fn state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	/// Wait until the connection reaches `Closed`.
	pub async fn wait_closed(&mut self) {
		let _ = self.state.wait_for(|s| *s == ConnectionState::Closed).await;
	}
}

/// One authenticated client session. Owns its transport; the hub only sees a
/// `ConnectionHandle`.
#[derive(Debug)]
pub struct Connection {
	id: ConnectionId,
	user: AuthenticatedUser,
	hub: RoomHub,
	settings: ConnectionSettings,
	close: CloseSignal,
	state: watch::Sender<ConnectionState>,
}

impl Connection {
	/// Build a connection for a user whose token has already been validated.
	/// It stays `Connecting` until `run` is handed the upgraded transport.
	pub fn new(id: ConnectionId, user: AuthenticatedUser, hub: RoomHub, settings: ConnectionSettings) -> Self {
		let (state, _rx) = watch::channel(ConnectionState::Connecting);
		Self {
			id,
			user,
			hub,
			settings,
			close: CloseSignal::new(),
			state,
		}
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	pub fn control(&self) -> ConnectionControl {
		ConnectionControl {
			id: self.id,
			close: self.close.clone(),
			state: self.state.subscribe(),
		}
	}

	/// Give up on a connection whose transport upgrade failed.
	pub fn abandon(self) {
		self.transition(ConnectionState::Closed);
	}

	fn transition(&self, next: ConnectionState) {
		let prev = self.state.send_replace(next);
		debug!(conn_id = %self.id, user_id = %self.user.user_id, from = ?prev, to = ?next, "connection state");
	}

	/// Run both loops until either side terminates, then tear down.
	pub async fn run<S>(self, ws: WebSocketStream<S>) -> CloseReason
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		struct ActiveGaugeGuard;
		impl Drop for ActiveGaugeGuard {
			fn drop(&mut self) {
				metrics::gauge!("campus_realtime_active_connections").decrement(1.0);
			}
		}

		self.transition(ConnectionState::Authenticated);

		metrics::gauge!("campus_realtime_active_connections").increment(1.0);
		let _gauge = ActiveGaugeGuard;

		let (sink, stream) = ws.split();
		let (tx, rx) = self.hub.outbound_queue();
		let handle = ConnectionHandle::new(self.id, self.user.user_id, tx);

		let reader = {
			let hub = self.hub.clone();
			let settings = self.settings.clone();
			let close = self.close.clone();
			tokio::spawn(async move {
				let reason = read_loop(stream, &hub, &handle, &settings, &close).await;
				close.close(reason);
				// Without room memberships this is the last sender, and the writer
				// ends on a closed queue. Record the real reason before dropping it.
				drop(handle);
			})
		};

		let writer = {
			let settings = self.settings.clone();
			let close = self.close.clone();
			let conn_id = self.id;
			tokio::spawn(async move {
				let reason = write_loop(conn_id, sink, rx, &settings, &close).await;
				close.close(reason);
			})
		};

		self.transition(ConnectionState::Active);

		let reason = self.close.closed().await;
		self.transition(ConnectionState::Closing);

		// The reader may be mid-subscribe; membership is only final once it has exited.
		let _ = reader.await;
		let rooms_left = self.hub.remove_connection(self.id).await;
		let _ = writer.await;

		metrics::counter!("campus_realtime_connections_closed_total", "reason" => reason.as_metric_label()).increment(1);
		info!(
			conn_id = %self.id,
			user_id = %self.user.user_id,
			rooms_left = rooms_left.len(),
			reason = %reason,
			"connection closed"
		);

		self.transition(ConnectionState::Closed);
		reason
	}
}

async fn read_loop<S>(
	mut stream: SplitStream<WebSocketStream<S>>,
	hub: &RoomHub,
	handle: &ConnectionHandle,
	settings: &ConnectionSettings,
	close: &CloseSignal,
) -> CloseReason
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	loop {
		let next = tokio::select! {
			reason = close.closed() => return reason,
			next = timeout(settings.read_timeout, stream.next()) => next,
		};

		let msg = match next {
			Err(_) => return CloseReason::ReadTimeout,
			Ok(None) => return CloseReason::PeerClosed,
			Ok(Some(Err(e))) => return CloseReason::ReadError(e.to_string()),
			Ok(Some(Ok(msg))) => msg,
		};

		let payload: &[u8] = match &msg {
			Message::Text(text) => text.as_bytes(),
			Message::Binary(bytes) => &bytes[..],
			Message::Close(_) => return CloseReason::PeerClosed,
			Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
		};

		// Strict on shape, permissive on vocabulary: a frame that is not a
		// command object ends the session, an unrecognised action does not.
		let cmd = match decode_command(payload, settings.max_frame_bytes) {
			Ok(cmd) => cmd,
			Err(e) => {
				metrics::counter!("campus_realtime_decode_errors_total").increment(1);
				warn!(conn_id = %handle.id(), error = %e, "undecodable command; closing connection");
				return CloseReason::Decode(e.to_string());
			}
		};

		apply_command(hub, handle, cmd).await;
	}
}

async fn apply_command(hub: &RoomHub, handle: &ConnectionHandle, cmd: ClientCommand) {
	let room = cmd.room();
	match (cmd.action, room) {
		(Action::Subscribe, Some(room)) => {
			metrics::counter!("campus_realtime_subscribe_total").increment(1);
			hub.subscribe(room, handle).await;
		}
		(Action::Unsubscribe, Some(room)) => {
			metrics::counter!("campus_realtime_unsubscribe_total").increment(1);
			hub.unsubscribe(&room, handle.id()).await;
		}
		(action, _) => {
			metrics::counter!("campus_realtime_unknown_actions_total").increment(1);
			debug!(conn_id = %handle.id(), user_id = %handle.user_id(), %action, "ignoring command");
		}
	}
}

async fn write_loop<S>(
	conn_id: ConnectionId,
	mut sink: SplitSink<WebSocketStream<S>, Message>,
	mut rx: mpsc::Receiver<OutboundEvent>,
	settings: &ConnectionSettings,
	close: &CloseSignal,
) -> CloseReason
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut ping = interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);

	loop {
		let msg = tokio::select! {
			biased;

			reason = close.closed() => {
				let _ = timeout(settings.write_timeout, sink.close()).await;
				return reason;
			}

			event = rx.recv() => {
				let Some(event) = event else {
					return CloseReason::Disconnect;
				};
				match encode_event(&event, settings.max_frame_bytes) {
					Ok(text) => Message::text(text),
					Err(e) => {
						warn!(conn_id = %conn_id, error = %e, "failed to encode outbound event");
						return CloseReason::Encode(e.to_string());
					}
				}
			}

			_ = ping.tick() => Message::Ping(Default::default()),
		};

		match timeout(settings.write_timeout, sink.send(msg)).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => return CloseReason::WriteError(e.to_string()),
			Err(_) => return CloseReason::WriteTimeout,
		}
	}
}
