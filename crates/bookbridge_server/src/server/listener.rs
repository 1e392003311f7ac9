#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::state::ChatState;

/// Accepts TCP connections forever, one handler task each.
pub async fn serve(listener: TcpListener, state: ChatState, settings: ConnectionSettings) -> anyhow::Result<()> {
	let local = listener.local_addr().context("listener local addr")?;
	info!(addr = %local, "accepting websocket connections");

	let next_conn_id = AtomicU64::new(1);
	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "accept failed");
				tokio::time::sleep(Duration::from_millis(50)).await;
				continue;
			}
		};
		if let Err(e) = stream.set_nodelay(true) {
			debug!(peer = %peer, error = %e, "set_nodelay failed");
		}

		let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
		let state = state.clone();
		let settings = settings.clone();
		debug!(conn_id, peer = %peer, "accepted connection");

		tokio::spawn(async move {
			if let Err(e) = handle_connection(conn_id, stream, state, settings).await {
				warn!(conn_id, error = %e, "connection handler failed");
			}
		});
	}
}
