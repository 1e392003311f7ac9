#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use bookbridge_domain::{Role, UserId};
use bookbridge_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::auth::{AuthClaims, issue_token};
use crate::server::connection::ConnectionSettings;
use crate::server::http::{HealthState, HttpContext, spawn_http_server};
use crate::server::listener::serve;
use crate::server::state::ChatState;
use crate::server::store::{ChatBackend, InMemoryChatBackend, SqlChatBackend};

const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: bookbridge_server [--bind ws://host:port] [--config PATH]\n\
\x20      bookbridge_server issue-token --user-id N --username NAME --role buyer|seller|both [--ttl-secs S] [--config PATH]\n\
\n\
Options:\n\
\t--bind      WebSocket bind endpoint (default: from config, else ws://0.0.0.0:8080)\n\
\t--config    Config file (default: ~/.bookbridge/config.toml)\n\
\t--help      Show this help\n\
\n\
issue-token signs a development access token with the configured jwt_secret.\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug)]
enum Command {
	Serve {
		bind: Option<String>,
		config: Option<PathBuf>,
	},
	IssueToken {
		user_id: UserId,
		username: String,
		role: Role,
		ttl_secs: u64,
		config: Option<PathBuf>,
	},
}

fn required<T>(value: Option<T>, flag: &str) -> T {
	value.unwrap_or_else(|| {
		eprintln!("{flag} is required");
		usage_and_exit();
	})
}

fn parse_args() -> Command {
	let mut args = std::env::args().skip(1).peekable();
	let issue = args.peek().map(|a| a == "issue-token").unwrap_or(false);
	if issue {
		args.next();
	}

	let mut bind = None;
	let mut config = None;
	let mut user_id = None;
	let mut username = None;
	let mut role = None;
	let mut ttl_secs = DEFAULT_TOKEN_TTL_SECS;

	while let Some(arg) = args.next() {
		let mut value = || {
			let v = args.next().unwrap_or_else(|| usage_and_exit());
			if v.trim().is_empty() {
				eprintln!("{arg} must be non-empty");
				usage_and_exit();
			}
			v
		};
		match (arg.as_str(), issue) {
			("--help" | "-h", _) => usage_and_exit(),
			("--config", _) => config = Some(PathBuf::from(value())),
			("--bind" | "--listen", false) => bind = Some(value()),
			("--user-id", true) => {
				user_id = Some(value().parse::<UserId>().unwrap_or_else(|e| {
					eprintln!("--user-id: {e}");
					usage_and_exit();
				}))
			}
			("--username", true) => username = Some(value()),
			("--role", true) => {
				role = Some(value().parse::<Role>().unwrap_or_else(|e| {
					eprintln!("--role: {e}");
					usage_and_exit();
				}))
			}
			("--ttl-secs", true) => {
				ttl_secs = value().parse::<u64>().unwrap_or_else(|_| {
					eprintln!("--ttl-secs must be a number of seconds");
					usage_and_exit();
				})
			}
			_ => {
				eprintln!("Unknown argument: {arg}");
				usage_and_exit();
			}
		}
	}

	if issue {
		Command::IssueToken {
			user_id: required(user_id, "--user-id"),
			username: required(username, "--username"),
			role: required(role, "--role"),
			ttl_secs,
			config,
		}
	} else {
		Command::Serve { bind, config }
	}
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,bookbridge_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("bookbridge_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<(PathBuf, ServerConfig)> {
	let path = match path {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&path)?;
	Ok((path, cfg))
}

async fn build_backend(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn ChatBackend>> {
	match cfg.persistence.database_url.as_deref() {
		Some(url) => {
			let backend = SqlChatBackend::connect(url, cfg.persistence.max_connections)
				.await
				.context("connect chat database")?;
			info!("chat store: sql backend ready (migrations applied)");
			Ok(Arc::new(backend))
		}
		None => {
			warn!("chat store: no database_url configured; using the in-memory store with an empty book catalog");
			Ok(Arc::new(InMemoryChatBackend::default()))
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	match parse_args() {
		Command::IssueToken {
			user_id,
			username,
			role,
			ttl_secs,
			config,
		} => {
			let (_, cfg) = load_config(config)?;
			let secret = cfg.resolve_jwt_secret()?;
			let claims = AuthClaims::new(user_id, username, role, ttl_secs);
			println!("{}", issue_token(&claims, secret.expose())?);
			Ok(())
		}
		Command::Serve { bind, config } => run_server(bind, config).await,
	}
}

async fn run_server(bind: Option<String>, config: Option<PathBuf>) -> anyhow::Result<()> {
	init_tracing();

	let (config_path, cfg) = load_config(config)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let endpoint = WsEndpoint::parse(bind.as_deref().unwrap_or(&cfg.server.bind)).map_err(|e| anyhow!(e))?;
	let jwt_secret = cfg.resolve_jwt_secret()?;

	init_metrics(cfg.server.metrics_bind.as_deref());

	let backend = build_backend(&cfg).await?;
	let state = ChatState::new(backend, cfg.server.max_message_chars);

	let health = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_http_server(
					addr,
					HttpContext {
						health: health.clone(),
						chat: state.clone(),
						jwt_secret: jwt_secret.clone(),
					},
				);
				info!(%addr, "health and chat api listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let settings = ConnectionSettings {
		jwt_secret,
		handshake_timeout: cfg.server.handshake_timeout,
		outbound_queue_capacity: cfg.server.outbound_queue_capacity,
		max_frame_bytes: cfg.server.max_frame_bytes,
	};

	let listener = TcpListener::bind(endpoint.hostport())
		.await
		.with_context(|| format!("bind {}", endpoint.hostport()))?;
	health.mark_ready();

	tokio::select! {
		res = serve(listener, state, settings) => res,
		_ = tokio::signal::ctrl_c() => {
			health.mark_not_ready();
			info!("shutdown requested");
			Ok(())
		}
	}
}
