#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bookbridge_protocol::DEFAULT_MAX_FRAME_SIZE;
use bookbridge_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::messages::DEFAULT_MAX_MESSAGE_CHARS;

pub const DEFAULT_BIND: &str = "ws://0.0.0.0:8080";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_DB_CONNECTIONS: u32 = 10;

/// Signing secret accepted in debug builds when none is configured; matches the
/// accounts service's development default so locally issued tokens verify.
pub const DEV_JWT_SECRET: &str = "bookreselling-secret-key-for-development-only";

/// Default config path: `~/.bookbridge/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".bookbridge").join("config.toml"))
}

/// Load the server config from TOML and process env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket listen endpoint (`ws://host:port`).
	pub bind: String,
	/// Optional health/readiness + chat REST bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HS256 secret shared with the token issuer.
	pub jwt_secret: Option<SecretString>,
	pub handshake_timeout: Duration,
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
	pub max_message_chars: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			health_bind: None,
			metrics_bind: None,
			jwt_secret: None,
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
			outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// `sqlite:` or `postgres:` URL; absent means the in-memory store.
	pub database_url: Option<String>,
	pub max_connections: u32,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			max_connections: DEFAULT_MAX_DB_CONNECTIONS,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	health_bind: Option<String>,
	metrics_bind: Option<String>,
	jwt_secret: Option<SecretString>,
	handshake_timeout_ms: Option<u64>,
	outbound_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
	max_message_chars: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	max_connections: Option<u32>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		Self {
			server: ServerSettings {
				bind: file.server.bind.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.bind),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				jwt_secret: file.server.jwt_secret.filter(|s| !s.is_blank()),
				handshake_timeout: file
					.server
					.handshake_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.handshake_timeout),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_frame_bytes),
				max_message_chars: file.server.max_message_chars.unwrap_or(defaults.max_message_chars),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				max_connections: file
					.persistence
					.max_connections
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_DB_CONNECTIONS),
			},
		}
	}

	/// The configured signing secret, or the development default in debug builds.
	pub fn resolve_jwt_secret(&self) -> anyhow::Result<SecretString> {
		resolve_jwt_secret(self.server.jwt_secret.as_ref(), cfg!(debug_assertions))
	}
}

fn resolve_jwt_secret(configured: Option<&SecretString>, allow_dev_default: bool) -> anyhow::Result<SecretString> {
	match configured {
		Some(secret) if !secret.is_blank() => Ok(secret.clone()),
		_ if allow_dev_default => {
			warn!("no jwt_secret configured; using the development secret (never do this in production)");
			Ok(SecretString::new(DEV_JWT_SECRET))
		}
		_ => Err(anyhow!(
			"no jwt_secret configured (set [server].jwt_secret or BOOKBRIDGE_JWT_SECRET)"
		)),
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

fn non_empty(v: String) -> Option<String> {
	let v = v.trim().to_string();
	if v.is_empty() { None } else { Some(v) }
}

/// First non-empty value among `keys`, in order.
fn first_var(env: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<(String, String)> {
	keys.iter()
		.find_map(|&key| env(key).and_then(non_empty).map(|v| (key.to_string(), v)))
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	if let Some((_, v)) = first_var(&env, &["BOOKBRIDGE_BIND"]) {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some((_, v)) = first_var(&env, &["BOOKBRIDGE_HEALTH_BIND"]) {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some((_, v)) = first_var(&env, &["BOOKBRIDGE_METRICS_BIND"]) {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some((key, v)) = first_var(&env, &["BOOKBRIDGE_JWT_SECRET", "JWT_SECRET"]) {
		cfg.server.jwt_secret = Some(SecretString::new(v));
		info!(var = %key, "server auth: jwt_secret overridden by env");
	}

	if let Some((_, v)) = first_var(&env, &["BOOKBRIDGE_HANDSHAKE_TIMEOUT_MS"])
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.server.handshake_timeout = Duration::from_millis(ms);
		info!(ms, "server config: handshake_timeout overridden by env");
	}

	if let Some((_, v)) = first_var(&env, &["BOOKBRIDGE_OUTBOUND_QUEUE_CAPACITY"])
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some((_, v)) = first_var(&env, &["BOOKBRIDGE_MAX_MESSAGE_CHARS"])
		&& let Ok(max) = v.parse::<usize>()
	{
		cfg.server.max_message_chars = max;
		info!(max, "server config: max_message_chars overridden by env");
	}

	if let Some((key, v)) = first_var(&env, &["BOOKBRIDGE_DATABASE_URL", "DATABASE_URL"]) {
		cfg.persistence.database_url = Some(v);
		info!(var = %key, "persistence: database_url overridden by env");
	}

	if let Some((_, v)) = first_var(&env, &["BOOKBRIDGE_DB_MAX_CONNECTIONS"])
		&& let Ok(max) = v.parse::<u32>()
		&& max > 0
	{
		cfg.persistence.max_connections = max;
		info!(max, "persistence: max_connections overridden by env");
	}
}
