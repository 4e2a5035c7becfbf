#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::server::auth::{Authenticator, HmacAuthenticator, InMemoryRevocationList, RevocationStore};
use crate::server::gateway::{Gateway, GatewayConfig};
use crate::server::health::HealthState;
use crate::server::hub::RoomHub;
use crate::server::publisher::EventPublisher;
use crate::util::time::unix_secs_now;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything the realtime subsystem needs, built once and shared by reference.
///
/// Business logic holds on to `publisher()` and `revocations()`; the gateway
/// serves clients.
#[derive(Clone)]
pub struct RealtimeService {
	hub: RoomHub,
	publisher: EventPublisher,
	gateway: Gateway,
	health: HealthState,
	revocations: Arc<InMemoryRevocationList>,
	prune_interval: Duration,
}

impl RealtimeService {
	/// Build the service with the HMAC authenticator. Fails without a configured secret.
	pub fn from_config(cfg: &ServerConfig) -> anyhow::Result<Self> {
		let secret = cfg.require_hmac_secret()?;
		let revocations = Arc::new(InMemoryRevocationList::new());
		let store: Arc<dyn RevocationStore> = revocations.clone();
		let authenticator: Arc<dyn Authenticator> = Arc::new(HmacAuthenticator::new(secret, store));

		Ok(Self::with_authenticator(cfg, authenticator, revocations))
	}

	/// Build the service around an arbitrary authenticator.
	pub fn with_authenticator(
		cfg: &ServerConfig,
		authenticator: Arc<dyn Authenticator>,
		revocations: Arc<InMemoryRevocationList>,
	) -> Self {
		let hub = RoomHub::new(cfg.hub_config());
		let health = HealthState::new();
		let gateway = Gateway::new(
			hub.clone(),
			authenticator,
			health.clone(),
			GatewayConfig {
				ws_path: cfg.server.ws_path.clone(),
				connection: cfg.connection_settings(),
			},
		);

		Self {
			publisher: EventPublisher::new(hub.clone()).with_max_frame_bytes(cfg.connection.max_frame_bytes),
			hub,
			gateway,
			health,
			revocations,
			prune_interval: cfg.server.revocation_prune_interval,
		}
	}

	pub fn hub(&self) -> &RoomHub {
		&self.hub
	}

	pub fn publisher(&self) -> &EventPublisher {
		&self.publisher
	}

	pub fn gateway(&self) -> &Gateway {
		&self.gateway
	}

	pub fn health(&self) -> &HealthState {
		&self.health
	}

	pub fn revocations(&self) -> &Arc<InMemoryRevocationList> {
		&self.revocations
	}

	/// Bind the gateway listener and start serving in the background.
	pub async fn start(&self, bind: SocketAddr) -> anyhow::Result<RunningService> {
		let listener = TcpListener::bind(bind)
			.await
			.with_context(|| format!("bind gateway listener on {bind}"))?;
		let local_addr = listener.local_addr().context("read gateway local address")?;

		let gateway = tokio::spawn(self.gateway.clone().serve(listener));
		let pruner = spawn_revocation_pruner(Arc::clone(&self.revocations), self.prune_interval);

		self.health.mark_ready();
		info!(addr = %local_addr, "realtime gateway listening");

		Ok(RunningService {
			local_addr,
			gateway,
			pruner,
			service: self.clone(),
		})
	}
}

/// Handle to a started service.
pub struct RunningService {
	local_addr: SocketAddr,
	gateway: JoinHandle<anyhow::Result<()>>,
	pruner: JoinHandle<()>,
	service: RealtimeService,
}

impl RunningService {
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Stop accepting, disconnect every client and wait for their teardown.
	pub async fn shutdown(self) {
		self.service.health.mark_not_ready();
		self.gateway.abort();
		self.pruner.abort();

		self.service.gateway.shutdown(SHUTDOWN_GRACE).await;
		info!("realtime gateway stopped");
	}
}

fn spawn_revocation_pruner(revocations: Arc<InMemoryRevocationList>, every: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(every);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tick.tick().await;
			let pruned = revocations.prune_expired(unix_secs_now()).await;
			if pruned > 0 {
				debug!(pruned, "pruned expired revocations");
			}
		}
	})
}
