#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("invalid id: {0}")]
	InvalidId(String),
}

macro_rules! row_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub i64);

		impl $name {
			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				match s.parse::<i64>() {
					Ok(v) if v > 0 => Ok(Self(v)),
					_ => Err(ParseIdError::InvalidId(s.to_string())),
				}
			}
		}
	};
}

row_id!(
	/// Account identifier (`users.id`).
	UserId
);
row_id!(
	/// Listing identifier (`books.id`).
	BookId
);
row_id!(
	/// Chat session identifier (`chats.id`).
	ChatId
);
row_id!(
	/// Persisted message identifier (`messages.id`).
	MessageId
);

/// Account role carried in access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Buyer,
	Seller,
	/// Later schema revisions allow one account to both buy and sell.
	Both,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Buyer => "buyer",
			Role::Seller => "seller",
			Role::Both => "both",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"buyer" => Ok(Role::Buyer),
			"seller" => Ok(Role::Seller),
			"both" => Ok(Role::Both),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Marker key for the unscoped community broadcast room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CommunityRoom;

impl fmt::Display for CommunityRoom {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("community")
	}
}

/// Failure taxonomy of the chat subsystem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	#[error("authentication required")]
	Unauthenticated,

	#[error("invalid credential: {0}")]
	InvalidCredential(String),

	#[error("book {0} not found")]
	BookNotFound(BookId),

	#[error("not authorized: {0}")]
	NotAuthorizedForBook(String),

	#[error("an existing buyer id is required")]
	MissingCounterparty,

	#[error("chat session {0} does not exist")]
	InvalidSession(ChatId),

	#[error("message content is empty")]
	EmptyContent,

	#[error("transport failure: {0}")]
	TransportFailure(String),

	#[error("protocol violation: {0}")]
	ProtocolViolation(String),

	/// Backend failure; the detail is logged, never sent to clients.
	#[error("storage failure: {0}")]
	Storage(String),
}

impl ChatError {
	/// Stable code carried in `error` frames and HTTP error bodies.
	pub const fn code(&self) -> &'static str {
		match self {
			ChatError::Unauthenticated => "UNAUTHENTICATED",
			ChatError::InvalidCredential(_) => "INVALID_CREDENTIAL",
			ChatError::BookNotFound(_) => "BOOK_NOT_FOUND",
			ChatError::NotAuthorizedForBook(_) => "NOT_AUTHORIZED_FOR_BOOK",
			ChatError::MissingCounterparty => "MISSING_COUNTERPARTY",
			ChatError::InvalidSession(_) => "INVALID_SESSION",
			ChatError::EmptyContent => "EMPTY_CONTENT",
			ChatError::TransportFailure(_) => "TRANSPORT_FAILURE",
			ChatError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
			ChatError::Storage(_) => "INTERNAL",
		}
	}

	/// Human-readable text safe to show to the remote peer.
	pub fn client_message(&self) -> String {
		match self {
			ChatError::Storage(_) => "internal server error".to_string(),
			ChatError::InvalidCredential(_) => "invalid or expired token".to_string(),
			other => other.to_string(),
		}
	}
}
