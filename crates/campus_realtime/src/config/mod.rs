#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use campus_domain::SecretString;
use campus_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::connection::ConnectionSettings;
use crate::server::hub::RoomHubConfig;

const DEFAULT_WS_PATH: &str = "/ws";
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
const DEFAULT_PING_INTERVAL_SECS: u64 = 54;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REVOCATION_PRUNE_SECS: u64 = 300;

/// Default config path: `~/.campus/realtime.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".campus").join("realtime.toml"))
}

/// Load the server config from TOML at `path` (missing file = defaults) plus `CAMPUS_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.clamp();

	Ok(cfg)
}

/// Realtime server config.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub connection: ConnectionLimits,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless access tokens. Required.
	pub auth_hmac_secret: Option<SecretString>,
	/// Path of the upgrade route.
	pub ws_path: String,
	/// How often expired revocations are forgotten.
	pub revocation_prune_interval: Duration,
	pub hub_debug_logs: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			auth_hmac_secret: None,
			ws_path: DEFAULT_WS_PATH.to_string(),
			revocation_prune_interval: Duration::from_secs(DEFAULT_REVOCATION_PRUNE_SECS),
			hub_debug_logs: false,
		}
	}
}

/// Per-connection queue sizes and deadlines.
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
	pub ping_interval: Duration,
	pub read_timeout: Duration,
	pub write_timeout: Duration,
}

impl Default for ConnectionLimits {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
			read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
			write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
		}
	}
}

impl ServerConfig {
	/// The configured HMAC secret, or an error naming how to provide one.
	pub fn require_hmac_secret(&self) -> anyhow::Result<SecretString> {
		self.server.auth_hmac_secret.clone().ok_or_else(|| {
			anyhow!("no auth_hmac_secret configured (set [server].auth_hmac_secret or CAMPUS_AUTH_HMAC_SECRET)")
		})
	}

	pub fn hub_config(&self) -> RoomHubConfig {
		RoomHubConfig {
			outbound_queue_capacity: self.connection.outbound_queue_capacity,
			debug_logs: self.server.hub_debug_logs,
		}
	}

	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			max_frame_bytes: self.connection.max_frame_bytes,
			ping_interval: self.connection.ping_interval,
			read_timeout: self.connection.read_timeout,
			write_timeout: self.connection.write_timeout,
		}
	}

	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerConfig::default();
		let secs = |v: Option<u64>, default: Duration| v.map(Duration::from_secs).unwrap_or(default);

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				ws_path: file
					.server
					.ws_path
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.server.ws_path),
				revocation_prune_interval: secs(
					file.server.revocation_prune_interval_secs,
					defaults.server.revocation_prune_interval,
				),
				hub_debug_logs: file.server.hub_debug_logs.unwrap_or(false),
			},
			connection: ConnectionLimits {
				outbound_queue_capacity: file
					.connection
					.outbound_queue_capacity
					.unwrap_or(defaults.connection.outbound_queue_capacity),
				max_frame_bytes: file
					.connection
					.max_frame_bytes
					.unwrap_or(defaults.connection.max_frame_bytes),
				ping_interval: secs(file.connection.ping_interval_secs, defaults.connection.ping_interval),
				read_timeout: secs(file.connection.read_timeout_secs, defaults.connection.read_timeout),
				write_timeout: secs(file.connection.write_timeout_secs, defaults.connection.write_timeout),
			},
		}
	}

	/// Replace unusable values with defaults.
	fn clamp(&mut self) {
		let defaults = ConnectionLimits::default();
		let c = &mut self.connection;

		if c.outbound_queue_capacity == 0 {
			warn!(
				default = defaults.outbound_queue_capacity,
				"connection config: outbound_queue_capacity is 0; using default"
			);
			c.outbound_queue_capacity = defaults.outbound_queue_capacity;
		}

		if c.max_frame_bytes == 0 {
			warn!(
				default = defaults.max_frame_bytes,
				"connection config: max_frame_bytes is 0; using default"
			);
			c.max_frame_bytes = defaults.max_frame_bytes;
		}

		for (name, value, default) in [
			("ping_interval", &mut c.ping_interval, defaults.ping_interval),
			("read_timeout", &mut c.read_timeout, defaults.read_timeout),
			("write_timeout", &mut c.write_timeout, defaults.write_timeout),
		] {
			if value.is_zero() {
				warn!(
					setting = name,
					default_secs = default.as_secs(),
					"connection config: zero duration; using default"
				);
				*value = default;
			}
		}

		// A healthy peer answers a ping within one interval; the read deadline
		// has to outlast it.
		if c.read_timeout <= c.ping_interval {
			let raised = c.ping_interval + Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS - DEFAULT_PING_INTERVAL_SECS);
			warn!(
				read_timeout_secs = c.read_timeout.as_secs(),
				ping_interval_secs = c.ping_interval.as_secs(),
				raised_secs = raised.as_secs(),
				"connection config: read_timeout does not exceed ping_interval; raising"
			);
			c.read_timeout = raised;
		}

		if !self.server.ws_path.starts_with('/') {
			self.server.ws_path = format!("/{}", self.server.ws_path);
		}

		if self.server.revocation_prune_interval.is_zero() {
			self.server.revocation_prune_interval = Duration::from_secs(DEFAULT_REVOCATION_PRUNE_SECS);
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	connection: FileConnectionSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	ws_path: Option<String>,
	revocation_prune_interval_secs: Option<u64>,
	hub_debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConnectionSettings {
	outbound_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
	ping_interval_secs: Option<u64>,
	read_timeout_secs: Option<u64>,
	write_timeout_secs: Option<u64>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("CAMPUS_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = non_empty("CAMPUS_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("CAMPUS_WS_PATH") {
		info!(ws_path = %v, "server config: ws_path overridden by env");
		cfg.server.ws_path = v;
	}

	if let Some(v) = non_empty("CAMPUS_HUB_DEBUG_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.hub_debug_logs = enabled;
		info!(enabled, "server config: hub_debug_logs overridden by env");
	}

	if let Some(v) = non_empty("CAMPUS_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
	{
		cfg.connection.outbound_queue_capacity = capacity;
		info!(capacity, "connection config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = non_empty("CAMPUS_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
	{
		cfg.connection.max_frame_bytes = bytes;
		info!(bytes, "connection config: max_frame_bytes overridden by env");
	}

	if let Some(v) = non_empty("CAMPUS_PING_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.connection.ping_interval = Duration::from_secs(secs);
		info!(secs, "connection config: ping_interval overridden by env");
	}

	if let Some(v) = non_empty("CAMPUS_READ_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.connection.read_timeout = Duration::from_secs(secs);
		info!(secs, "connection config: read_timeout overridden by env");
	}

	if let Some(v) = non_empty("CAMPUS_WRITE_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.connection.write_timeout = Duration::from_secs(secs);
		info!(secs, "connection config: write_timeout overridden by env");
	}
}
