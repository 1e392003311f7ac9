#![forbid(unsafe_code)]

use std::sync::Arc;

use bookbridge_domain::{BookId, ChatError, ChatId, Role, UserId};
use tracing::{debug, info, warn};

use crate::server::store::{ChatBackend, ChatSession, InsertSession, SessionSummary, SideFilter};

pub(crate) fn storage_error(err: anyhow::Error) -> ChatError {
	ChatError::Storage(format!("{err:#}"))
}

/// Outcome of [`SessionDirectory::resolve_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
	pub session: ChatSession,
	pub created: bool,
}

/// Maps (book, buyer, seller) to exactly one chat session.
#[derive(Clone)]
pub struct SessionDirectory {
	backend: Arc<dyn ChatBackend>,
}

impl SessionDirectory {
	pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
		Self { backend }
	}

	/// Finds the session for `book` between the requester and its counterparty,
	/// creating it on first contact.
	///
	/// Buyers never name the seller: it is always derived from the book.
	/// Sellers must own the book and name an existing buyer account in `counterparty`.
	/// Accounts with [`Role::Both`] act as the seller on their own listings and
	/// as a buyer everywhere else.
	pub async fn resolve_or_create(
		&self,
		book: BookId,
		requester: UserId,
		role: Role,
		counterparty: Option<UserId>,
	) -> Result<ResolvedSession, ChatError> {
		let seller = self
			.backend
			.book_seller(book)
			.await
			.map_err(storage_error)?
			.ok_or(ChatError::BookNotFound(book))?;

		let acting_as = match role {
			Role::Both if requester == seller => Role::Seller,
			Role::Both => Role::Buyer,
			r => r,
		};

		let buyer = match acting_as {
			Role::Seller => {
				if requester != seller {
					return Err(ChatError::NotAuthorizedForBook(format!(
						"user {requester} is not the seller of book {book}"
					)));
				}
				let buyer = counterparty.ok_or(ChatError::MissingCounterparty)?;
				if buyer == seller {
					return Err(ChatError::NotAuthorizedForBook(
						"a seller cannot open a chat with themselves".to_string(),
					));
				}
				if self.backend.username(buyer).await.map_err(storage_error)?.is_none() {
					debug!(book = %book, buyer = %buyer, "seller named a buyer with no account");
					return Err(ChatError::MissingCounterparty);
				}
				buyer
			}
			_ => {
				if requester == seller {
					return Err(ChatError::NotAuthorizedForBook(format!(
						"user {requester} cannot buy their own book {book}"
					)));
				}
				if let Some(hint) = counterparty
					&& hint != seller
				{
					debug!(book = %book, hint = %hint, seller = %seller, "ignoring seller hint that does not own the book");
				}
				requester
			}
		};

		if let Some(session) = self.find(book, buyer, seller).await? {
			return Ok(ResolvedSession {
				session,
				created: false,
			});
		}

		match self.backend.insert_session(book, buyer, seller).await.map_err(storage_error)? {
			InsertSession::Created(session) => {
				info!(chat_id = %session.id, book = %book, buyer = %buyer, seller = %seller, "chat session created");
				metrics::counter!("bookbridge_server_sessions_created_total").increment(1);
				Ok(ResolvedSession { session, created: true })
			}
			InsertSession::Conflict => {
				debug!(book = %book, buyer = %buyer, seller = %seller, "lost session insert race; re-reading");
				match self.find(book, buyer, seller).await? {
					Some(session) => Ok(ResolvedSession {
						session,
						created: false,
					}),
					None => {
						warn!(book = %book, buyer = %buyer, seller = %seller, "session vanished after insert conflict");
						Err(ChatError::Storage("session vanished after insert conflict".to_string()))
					}
				}
			}
		}
	}

	/// Reopens a known session; only its two participants may do so.
	pub async fn open_existing(&self, chat: ChatId, requester: UserId) -> Result<ChatSession, ChatError> {
		let session = self
			.backend
			.session_by_id(chat)
			.await
			.map_err(storage_error)?
			.ok_or(ChatError::InvalidSession(chat))?;

		if !session.is_participant(requester) {
			return Err(ChatError::NotAuthorizedForBook(format!(
				"user {requester} is not a participant of chat {chat}"
			)));
		}
		Ok(session)
	}

	/// Sessions visible to the user under its role, newest first.
	pub async fn sessions_for_user(&self, user: UserId, role: Role) -> Result<Vec<SessionSummary>, ChatError> {
		let sides = match role {
			Role::Buyer => SideFilter {
				as_buyer: true,
				as_seller: false,
			},
			Role::Seller => SideFilter {
				as_buyer: false,
				as_seller: true,
			},
			Role::Both => SideFilter {
				as_buyer: true,
				as_seller: true,
			},
		};
		self.backend.sessions_for_user(user, sides).await.map_err(storage_error)
	}

	async fn find(&self, book: BookId, buyer: UserId, seller: UserId) -> Result<Option<ChatSession>, ChatError> {
		self.backend
			.find_session(book, buyer, seller)
			.await
			.map_err(storage_error)
	}
}
