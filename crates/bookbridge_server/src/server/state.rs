#![forbid(unsafe_code)]

use std::sync::Arc;

use bookbridge_domain::{ChatId, CommunityRoom};

use crate::server::messages::MessageStore;
use crate::server::registry::ConnectionRegistry;
use crate::server::sessions::SessionDirectory;
use crate::server::store::ChatBackend;

/// Shared services handed to every connection and HTTP request.
#[derive(Clone)]
pub struct ChatState {
	pub backend: Arc<dyn ChatBackend>,
	pub sessions: SessionDirectory,
	pub messages: MessageStore,
	pub chat_rooms: ConnectionRegistry<ChatId>,
	pub community: ConnectionRegistry<CommunityRoom>,
}

impl ChatState {
	pub fn new(backend: Arc<dyn ChatBackend>, max_message_chars: usize) -> Self {
		Self {
			sessions: SessionDirectory::new(Arc::clone(&backend)),
			messages: MessageStore::new(Arc::clone(&backend), max_message_chars),
			chat_rooms: ConnectionRegistry::new("chat"),
			community: ConnectionRegistry::new("community"),
			backend,
		}
	}
}
