#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use bookbridge_domain::UserId;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info};

pub type ConnId = u64;

/// Outbound handle for one live connection.
#[derive(Debug, Clone)]
pub struct LiveConnection {
	pub conn_id: ConnId,
	pub user_id: UserId,
	pub username: String,
	tx: mpsc::Sender<WsMessage>,
	close: Arc<Notify>,
}

impl LiveConnection {
	pub fn new(conn_id: ConnId, user_id: UserId, username: String, tx: mpsc::Sender<WsMessage>, close: Arc<Notify>) -> Self {
		Self {
			conn_id,
			user_id,
			username,
			tx,
			close,
		}
	}
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
	pub delivered: usize,
	pub evicted: usize,
}

/// Live connections grouped by room key.
///
/// Fan-out never waits on a connection: a full or closed queue evicts the
/// connection and fires its close signal.
#[derive(Debug)]
pub struct ConnectionRegistry<K> {
	inner: Arc<Mutex<HashMap<K, HashMap<ConnId, LiveConnection>>>>,
	label: &'static str,
}

impl<K> Clone for ConnectionRegistry<K> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
			label: self.label,
		}
	}
}

impl<K> ConnectionRegistry<K>
where
	K: Clone + Eq + Hash + fmt::Display + Send + 'static,
{
	pub fn new(label: &'static str) -> Self {
		Self {
			inner: Arc::new(Mutex::new(HashMap::new())),
			label,
		}
	}

	/// Adds a connection to a room; the returned guard removes it on drop.
	pub fn register(&self, room: K, conn: LiveConnection) -> Registration<K> {
		let conn_id = conn.conn_id;
		let user_id = conn.user_id;
		let username = conn.username.clone();
		let members = {
			let mut inner = self.inner.lock();
			let entry = inner.entry(room.clone()).or_default();
			entry.insert(conn_id, conn);
			entry.len()
		};

		debug!(
			registry = self.label,
			room = %room,
			conn_id,
			user_id = %user_id,
			username = %username,
			members,
			"connection registered"
		);
		metrics::gauge!("bookbridge_server_registered_connections", "registry" => self.label).increment(1.0);

		Registration {
			registry: self.clone(),
			room,
			conn_id,
		}
	}

	/// Removes a connection. Returns `false` when it was already gone.
	pub fn unregister(&self, room: &K, conn_id: ConnId) -> bool {
		let removed = {
			let mut inner = self.inner.lock();
			let Some(entry) = inner.get_mut(room) else {
				return false;
			};
			let removed = entry.remove(&conn_id).is_some();
			if entry.is_empty() {
				inner.remove(room);
			}
			removed
		};

		if removed {
			debug!(registry = self.label, room = %room, conn_id, "connection unregistered");
			metrics::gauge!("bookbridge_server_registered_connections", "registry" => self.label).decrement(1.0);
		}
		removed
	}

	/// Delivers `msg` to every connection in the room.
	pub fn broadcast(&self, room: &K, msg: WsMessage) -> BroadcastOutcome {
		self.fan_out(room, msg, None)
	}

	/// Delivers `msg` to every connection in the room except `skip`.
	pub fn broadcast_except(&self, room: &K, msg: WsMessage, skip: ConnId) -> BroadcastOutcome {
		self.fan_out(room, msg, Some(skip))
	}

	fn fan_out(&self, room: &K, msg: WsMessage, skip: Option<ConnId>) -> BroadcastOutcome {
		let mut outcome = BroadcastOutcome::default();
		let mut evicted = Vec::new();

		{
			let mut inner = self.inner.lock();
			let Some(entry) = inner.get_mut(room) else {
				return outcome;
			};

			for (conn_id, conn) in entry.iter() {
				if Some(*conn_id) == skip {
					continue;
				}
				match conn.tx.try_send(msg.clone()) {
					Ok(()) => outcome.delivered += 1,
					Err(mpsc::error::TrySendError::Full(_)) => evicted.push((*conn_id, "queue full")),
					Err(mpsc::error::TrySendError::Closed(_)) => evicted.push((*conn_id, "queue closed")),
				}
			}

			for (conn_id, reason) in &evicted {
				if let Some(conn) = entry.remove(conn_id) {
					conn.close.notify_one();
					info!(
						registry = self.label,
						room = %room,
						conn_id,
						user_id = %conn.user_id,
						username = %conn.username,
						reason,
						"evicting connection"
					);
				}
			}

			if entry.is_empty() {
				inner.remove(room);
			}
		}

		outcome.evicted = evicted.len();
		if outcome.evicted > 0 {
			metrics::counter!("bookbridge_server_broadcast_evictions_total", "registry" => self.label)
				.increment(outcome.evicted as u64);
			metrics::gauge!("bookbridge_server_registered_connections", "registry" => self.label)
				.decrement(outcome.evicted as f64);
		}
		outcome
	}

	pub fn connection_count(&self, room: &K) -> usize {
		self.inner.lock().get(room).map(HashMap::len).unwrap_or(0)
	}

	pub fn room_count(&self) -> usize {
		self.inner.lock().len()
	}
}

/// Membership of one connection in one room; unregisters on drop.
#[derive(Debug)]
pub struct Registration<K>
where
	K: Clone + Eq + Hash + fmt::Display + Send + 'static,
{
	registry: ConnectionRegistry<K>,
	room: K,
	conn_id: ConnId,
}

impl<K> Registration<K>
where
	K: Clone + Eq + Hash + fmt::Display + Send + 'static,
{
	pub fn room(&self) -> &K {
		&self.room
	}
}

impl<K> Drop for Registration<K>
where
	K: Clone + Eq + Hash + fmt::Display + Send + 'static,
{
	fn drop(&mut self) {
		self.registry.unregister(&self.room, self.conn_id);
	}
}
