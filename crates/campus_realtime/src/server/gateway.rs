#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use campus_domain::ConnectionId;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, info, warn};

use crate::server::auth::{AuthError, Authenticator, parse_bearer};
use crate::server::connection::{Connection, ConnectionControl, ConnectionSettings};
use crate::server::health::{HealthState, text_response};
use crate::server::hub::RoomHub;

const WEBSOCKET_VERSION: &str = "13";

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
	/// Path of the upgrade route.
	pub ws_path: String,
	pub connection: ConnectionSettings,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			ws_path: "/ws".to_string(),
			connection: ConnectionSettings::default(),
		}
	}
}

/// HTTP front door: health checks, bearer check, WebSocket upgrade, and `Connection` construction.
#[derive(Clone)]
pub struct Gateway {
	inner: Arc<GatewayInner>,
}

struct GatewayInner {
	hub: RoomHub,
	authenticator: Arc<dyn Authenticator>,
	health: HealthState,
	cfg: GatewayConfig,
	next_conn_id: AtomicU64,

	/// Every connection from the 101 response until teardown, upgrade still pending included.
	live: RwLock<HashMap<ConnectionId, ConnectionControl>>,

	/// Set under the `live` write lock so no upgrade slips past a shutdown snapshot.
	shutting_down: AtomicBool,
}

impl Gateway {
	pub fn new(hub: RoomHub, authenticator: Arc<dyn Authenticator>, health: HealthState, cfg: GatewayConfig) -> Self {
		Self {
			inner: Arc::new(GatewayInner {
				hub,
				authenticator,
				health,
				cfg,
				next_conn_id: AtomicU64::new(1),
				live: RwLock::new(HashMap::new()),
				shutting_down: AtomicBool::new(false),
			}),
		}
	}

	/// Accept HTTP connections on `listener` until the task is dropped.
	pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
		loop {
			let (stream, remote) = match listener.accept().await {
				Ok(accepted) => accepted,
				Err(e) => {
					warn!(error = %e, "accept failed");
					tokio::time::sleep(Duration::from_millis(100)).await;
					continue;
				}
			};

			let io = TokioIo::new(stream);
			let gateway = self.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req| {
					let gateway = gateway.clone();
					async move { Ok::<_, Infallible>(gateway.handle_request(req, remote).await) }
				});
				if let Err(err) = http1::Builder::new()
					.serve_connection(io, service)
					.with_upgrades()
					.await
				{
					debug!(%remote, error = %err, "http connection error");
				}
			});
		}
	}

	/// Number of connections accepted by the handshake and not yet torn down.
	pub async fn active_connections(&self) -> usize {
		self.inner.live.read().await.len()
	}

	/// Fire the close signal of every live connection.
	pub async fn disconnect_all(&self) -> usize {
		let live = self.inner.live.read().await;
		for control in live.values() {
			control.disconnect();
		}
		live.len()
	}

	/// Disconnect one connection by id. Returns `false` if it is not live.
	pub async fn disconnect(&self, conn_id: ConnectionId) -> bool {
		match self.inner.live.read().await.get(&conn_id) {
			Some(control) => control.disconnect(),
			None => false,
		}
	}

	/// Refuse new upgrades, disconnect everything and wait (bounded by `grace`) for teardown to finish.
	pub async fn shutdown(&self, grace: Duration) {
		let mut controls: Vec<ConnectionControl> = {
			let live = self.inner.live.write().await;
			self.inner.shutting_down.store(true, Ordering::Release);
			live.values().cloned().collect()
		};
		for control in &controls {
			control.disconnect();
		}

		let wait_all = async {
			for control in &mut controls {
				control.wait_closed().await;
			}
		};
		if tokio::time::timeout(grace, wait_all).await.is_err() {
			warn!(grace_ms = grace.as_millis() as u64, "connections still closing after grace period");
		}
	}

	async fn handle_request(&self, mut req: Request<Incoming>, remote: SocketAddr) -> Response<Full<Bytes>> {
		let path = req.uri().path().to_string();

		if let Some(resp) = self.inner.health.respond(req.method(), &path) {
			return resp;
		}

		if path != self.inner.cfg.ws_path {
			return text_response(StatusCode::NOT_FOUND, "");
		}

		if req.method() != Method::GET {
			return text_response(StatusCode::METHOD_NOT_ALLOWED, "");
		}

		let authorization = req.headers().get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
		let token = match parse_bearer(authorization) {
			Ok(token) => token.to_string(),
			Err(e) => return reject_unauthorized(remote, &e),
		};

		let Some(accept_key) = websocket_accept_key(req.headers()) else {
			metrics::counter!("campus_realtime_handshake_rejected_total", "reason" => "bad_upgrade").increment(1);
			debug!(%remote, "not a websocket upgrade request");
			return text_response(StatusCode::BAD_REQUEST, "expected websocket upgrade");
		};

		let user = match self.inner.authenticator.authenticate(&token).await {
			Ok(user) => user,
			Err(e) => return reject_unauthorized(remote, &e),
		};

		let Ok(accept_value) = HeaderValue::from_str(&accept_key) else {
			return text_response(StatusCode::INTERNAL_SERVER_ERROR, "");
		};

		let conn_id = ConnectionId(self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed));
		let user_id = user.user_id;
		let connection = Connection::new(conn_id, user, self.inner.hub.clone(), self.inner.cfg.connection.clone());
		{
			let mut live = self.inner.live.write().await;
			if self.inner.shutting_down.load(Ordering::Acquire) {
				metrics::counter!("campus_realtime_handshake_rejected_total", "reason" => "shutting_down").increment(1);
				return text_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
			}
			live.insert(conn_id, connection.control());
		}

		metrics::counter!("campus_realtime_connections_total").increment(1);
		info!(conn_id = %conn_id, user_id = %user_id, %remote, "upgrading connection");

		let on_upgrade = hyper::upgrade::on(&mut req);
		let gateway = self.clone();
		tokio::spawn(async move {
			match on_upgrade.await {
				Ok(upgraded) => {
					let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
					connection.run(ws).await;
				}
				Err(e) => {
					warn!(conn_id = %conn_id, error = %e, "websocket upgrade failed");
					connection.abandon();
				}
			}
			gateway.inner.live.write().await.remove(&conn_id);
		});

		let mut resp = text_response(StatusCode::SWITCHING_PROTOCOLS, "");
		let headers = resp.headers_mut();
		headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
		headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
		headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept_value);
		resp
	}
}

fn reject_unauthorized(remote: SocketAddr, err: &AuthError) -> Response<Full<Bytes>> {
	let reason = match err {
		AuthError::MissingCredential => "missing_credential",
		AuthError::MalformedCredential => "malformed_credential",
		AuthError::Malformed(_) => "malformed_token",
		AuthError::BadSignature => "bad_signature",
		AuthError::Expired => "expired",
		AuthError::Revoked => "revoked",
		AuthError::Backend(_) => "backend",
	};
	metrics::counter!("campus_realtime_handshake_rejected_total", "reason" => reason).increment(1);
	info!(%remote, error = %err, "rejected websocket handshake");

	let mut resp = text_response(StatusCode::UNAUTHORIZED, "unauthorized");
	resp.headers_mut()
		.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
	resp
}

/// Validate the upgrade headers and derive `Sec-WebSocket-Accept`.
fn websocket_accept_key(headers: &HeaderMap) -> Option<String> {
	let has_token = |name: header::HeaderName, token: &str| {
		headers
			.get_all(name)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.flat_map(|v| v.split(','))
			.any(|v| v.trim().eq_ignore_ascii_case(token))
	};

	if !has_token(header::UPGRADE, "websocket") || !has_token(header::CONNECTION, "upgrade") {
		return None;
	}

	let version = headers.get(header::SEC_WEBSOCKET_VERSION)?.to_str().ok()?;
	if version.trim() != WEBSOCKET_VERSION {
		return None;
	}

	let key = headers.get(header::SEC_WEBSOCKET_KEY)?;
	Some(derive_accept_key(key.as_bytes()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn upgrade_headers() -> HeaderMap {
		let mut headers = HeaderMap::new();
		headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
		headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
		headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
		headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
		headers
	}

	#[test]
	fn accept_key_matches_rfc6455_sample() {
		assert_eq!(
			websocket_accept_key(&upgrade_headers()).as_deref(),
			Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
		);
	}

	#[test]
	fn incomplete_upgrade_is_refused() {
		let mut headers = upgrade_headers();
		headers.remove(header::SEC_WEBSOCKET_KEY);
		assert!(websocket_accept_key(&headers).is_none());

		let mut headers = upgrade_headers();
		headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
		assert!(websocket_accept_key(&headers).is_none());

		let mut headers = upgrade_headers();
		headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
		assert!(websocket_accept_key(&headers).is_none());
	}
}
