#![forbid(unsafe_code)]

use std::sync::Arc;

use bookbridge_domain::{ChatError, ChatId, UserId};
use tracing::debug;

use crate::server::sessions::storage_error;
use crate::server::store::{ChatBackend, Message, StoredMessage};

/// Default cap on message length, in characters.
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 4000;

/// A history entry annotated for one viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantMessage {
	pub stored: StoredMessage,
	pub is_self_sender: bool,
}

#[derive(Clone)]
pub struct MessageStore {
	backend: Arc<dyn ChatBackend>,
	max_message_chars: usize,
}

impl MessageStore {
	pub fn new(backend: Arc<dyn ChatBackend>, max_message_chars: usize) -> Self {
		Self {
			backend,
			max_message_chars,
		}
	}

	/// Persists one message. Content is stored exactly as given; only
	/// whitespace-only content is refused.
	pub async fn append(&self, chat: ChatId, sender: UserId, content: &str) -> Result<Message, ChatError> {
		self.validate_content(content)?;

		let stored = self
			.backend
			.insert_message(chat, sender, content)
			.await
			.map_err(storage_error)?
			.ok_or(ChatError::InvalidSession(chat))?;

		debug!(chat_id = %chat, message_id = %stored.id, sender = %sender, "message persisted");
		metrics::counter!("bookbridge_server_messages_persisted_total").increment(1);
		Ok(stored)
	}

	/// Content rules shared by persisted and broadcast-only messages.
	pub fn validate_content(&self, content: &str) -> Result<(), ChatError> {
		if content.trim().is_empty() {
			return Err(ChatError::EmptyContent);
		}
		let chars = content.chars().count();
		if self.max_message_chars > 0 && chars > self.max_message_chars {
			return Err(ChatError::ProtocolViolation(format!(
				"message too long: {chars} characters (max {})",
				self.max_message_chars
			)));
		}
		Ok(())
	}

	/// All messages of a chat, oldest first. Unknown chats have no history.
	pub async fn history(&self, chat: ChatId) -> Result<Vec<StoredMessage>, ChatError> {
		self.backend.messages(chat).await.map_err(storage_error)
	}

	/// History for a participant, each entry flagged when the viewer sent it.
	pub async fn messages_for_participant(
		&self,
		chat: ChatId,
		viewer: UserId,
	) -> Result<Vec<ParticipantMessage>, ChatError> {
		let session = self
			.backend
			.session_by_id(chat)
			.await
			.map_err(storage_error)?
			.ok_or(ChatError::InvalidSession(chat))?;
		if !session.is_participant(viewer) {
			return Err(ChatError::NotAuthorizedForBook(format!(
				"user {viewer} is not a participant of chat {chat}"
			)));
		}

		let out = self
			.history(chat)
			.await?
			.into_iter()
			.map(|stored| ParticipantMessage {
				is_self_sender: stored.message.sender_id == viewer,
				stored,
			})
			.collect();
		Ok(out)
	}
}
