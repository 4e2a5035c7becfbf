#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use campus_domain::{ConnectionId, RoomKey, UserId};
use campus_protocol::ServerEvent;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// Item carried on a connection's outbound queue. Shared between all
/// recipients of one broadcast.
pub type OutboundEvent = Arc<ServerEvent>;

/// Room registry: maps rooms to the live connections subscribed to them and
/// fans events out to their outbound queues.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<RwLock<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued events per connection.
	pub outbound_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Non-owning delivery handle for one connection.
///
/// The hub only ever enqueues through it; closing the transport is the
/// connection's own business.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	id: ConnectionId,
	user_id: UserId,
	tx: mpsc::Sender<OutboundEvent>,
}

impl ConnectionHandle {
	pub fn new(id: ConnectionId, user_id: UserId, tx: mpsc::Sender<OutboundEvent>) -> Self {
		Self { id, user_id, tx }
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	pub fn user_id(&self) -> UserId {
		self.user_id
	}
}

/// Per-call delivery summary of `RoomHub::broadcast`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
	/// Events enqueued.
	pub delivered: usize,
	/// Recipients skipped because their queue was full.
	pub dropped: usize,
	/// Recipients whose queue was already closed (connection tearing down).
	pub closed: usize,
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(RwLock::new(Inner::default())),
			cfg,
		}
	}

	/// Create a bounded outbound queue sized for this hub.
	pub fn outbound_queue(&self) -> (mpsc::Sender<OutboundEvent>, mpsc::Receiver<OutboundEvent>) {
		mpsc::channel(self.cfg.outbound_queue_capacity.max(1))
	}

	/// Add `conn` to `room`. Returns `false` if it was already a member.
	pub async fn subscribe(&self, room: RoomKey, conn: &ConnectionHandle) -> bool {
		let mut guard = self.inner.write().await;
		let inner = &mut *guard;

		let members = inner.rooms.entry(room.clone()).or_default();
		let added = members.insert(conn.id, conn.clone()).is_none();
		let subs = members.len();

		inner.rooms_by_conn.entry(conn.id).or_default().insert(room.clone());

		if self.cfg.debug_logs {
			debug!(room = %room, conn_id = %conn.id, added, subs, "room hub: subscribed");
		}

		added
	}

	/// Remove `conn_id` from `room`, dropping the room once it is empty.
	/// Returns `false` if it was not a member.
	pub async fn unsubscribe(&self, room: &RoomKey, conn_id: ConnectionId) -> bool {
		let mut guard = self.inner.write().await;
		let inner = &mut *guard;

		let now_empty = match inner.rooms_by_conn.get_mut(&conn_id) {
			Some(rooms) => {
				rooms.remove(room);
				rooms.is_empty()
			}
			None => false,
		};
		if now_empty {
			inner.rooms_by_conn.remove(&conn_id);
		}

		let removed = inner.remove_member(room, conn_id);

		if self.cfg.debug_logs {
			debug!(room = %room, conn_id = %conn_id, removed, "room hub: unsubscribed");
		}

		removed
	}

	/// Remove a connection from every room it belongs to. Returns the rooms it left.
	pub async fn remove_connection(&self, conn_id: ConnectionId) -> Vec<RoomKey> {
		let mut inner = self.inner.write().await;

		let Some(rooms) = inner.rooms_by_conn.remove(&conn_id) else {
			return Vec::new();
		};

		let rooms: Vec<RoomKey> = rooms.into_iter().collect();
		for room in &rooms {
			inner.remove_member(room, conn_id);
		}

		if self.cfg.debug_logs {
			debug!(conn_id = %conn_id, rooms = rooms.len(), "room hub: connection removed");
		}

		rooms
	}

	/// Enqueue `event` on every subscriber of `room`.
	///
	/// Never waits on a recipient: a full queue drops the event for that
	/// recipient only.
	pub async fn broadcast(&self, room: &RoomKey, event: ServerEvent) -> BroadcastOutcome {
		let event: OutboundEvent = Arc::new(event);
		let mut outcome = BroadcastOutcome::default();

		let inner = self.inner.read().await;
		let Some(members) = inner.rooms.get(room) else {
			return outcome;
		};

		for member in members.values() {
			match member.tx.try_send(Arc::clone(&event)) {
				Ok(()) => outcome.delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => outcome.dropped += 1,
				Err(mpsc::error::TrySendError::Closed(_)) => outcome.closed += 1,
			}
		}
		drop(inner);

		metrics::counter!("campus_realtime_events_delivered_total").increment(outcome.delivered as u64);
		if outcome.dropped > 0 {
			metrics::counter!("campus_realtime_events_dropped_total").increment(outcome.dropped as u64);
		}

		if self.cfg.debug_logs && outcome.dropped > 0 {
			debug!(
				room = %room,
				dropped = outcome.dropped,
				"room hub: dropped due to full outbound queues"
			);
		}

		outcome
	}

	/// Whether `conn_id` is currently subscribed to `room`.
	pub async fn is_member(&self, room: &RoomKey, conn_id: ConnectionId) -> bool {
		let inner = self.inner.read().await;
		inner.rooms.get(room).is_some_and(|m| m.contains_key(&conn_id))
	}

	/// Rooms a connection is currently subscribed to.
	pub async fn rooms_for_connection(&self, conn_id: ConnectionId) -> HashSet<RoomKey> {
		let inner = self.inner.read().await;
		inner.rooms_by_conn.get(&conn_id).cloned().unwrap_or_default()
	}

	/// Get a snapshot of subscriber counts per room.
	pub async fn room_subscriber_counts(&self) -> HashMap<RoomKey, usize> {
		let inner = self.inner.read().await;
		inner.rooms.iter().map(|(k, v)| (k.clone(), v.len())).collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<RoomKey, HashMap<ConnectionId, ConnectionHandle>>,

	/// Reverse index used by teardown.
	rooms_by_conn: HashMap<ConnectionId, HashSet<RoomKey>>,
}

impl Inner {
	fn remove_member(&mut self, room: &RoomKey, conn_id: ConnectionId) -> bool {
		let Some(members) = self.rooms.get_mut(room) else {
			return false;
		};

		let removed = members.remove(&conn_id).is_some();
		if members.is_empty() {
			self.rooms.remove(room);
		}

		removed
	}
}
