#![forbid(unsafe_code)]

use bookbridge_domain::{BookId, ChatError, ChatId, MessageId, Role, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Default maximum size of one inbound text frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

/// Frame kinds a client may send.
pub const CLIENT_KINDS: &[&str] = &["auth", "message", "typing"];

/// Frame kinds only the server emits.
pub const SERVER_KINDS: &[&str] = &["history", "message", "typing", "error", "connection_success", "chat_created"];

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("frame is not a JSON object")]
	NotAnObject,

	#[error("frame has no string \"type\" field")]
	MissingType,

	#[error("unknown field {field:?} for frame kind {kind:?}")]
	UnknownField {
		kind: String,
		field: String,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

impl From<FrameError> for ChatError {
	fn from(e: FrameError) -> Self {
		ChatError::ProtocolViolation(e.to_string())
	}
}

/// Frames sent by clients, one schema per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	Auth {
		token: String,
	},

	Message {
		content: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		chat_id: Option<ChatId>,
	},

	Typing {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		chat_id: Option<ChatId>,
	},
}

impl ClientFrame {
	pub const fn kind(&self) -> &'static str {
		match self {
			ClientFrame::Auth { .. } => "auth",
			ClientFrame::Message { .. } => "message",
			ClientFrame::Typing { .. } => "typing",
		}
	}

	fn allowed_fields(kind: &str) -> &'static [&'static str] {
		match kind {
			"auth" => &["type", "token"],
			"message" => &["type", "content", "chat_id"],
			"typing" => &["type", "chat_id"],
			_ => &[],
		}
	}
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
	Frame(ClientFrame),

	/// Well-formed object whose kind is not a client kind.
	Unrecognized(String),
}

/// One persisted message as carried in `history` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
	pub id: MessageId,
	pub chat_id: ChatId,
	pub sender_id: UserId,
	pub sender_name: String,
	pub content: String,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
	pub sender_name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingMeta {
	pub sender_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMeta {
	pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMeta {
	pub user_id: UserId,
	pub username: String,
	pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCreatedMeta {
	pub book_id: BookId,
	pub buyer_id: UserId,
	pub seller_id: UserId,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	History {
		chat_id: ChatId,
		timestamp: DateTime<Utc>,
		data: Vec<HistoryEntry>,
	},

	Message {
		content: String,
		sender_id: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		chat_id: Option<ChatId>,
		timestamp: DateTime<Utc>,
		data: MessageMeta,
	},

	Typing {
		sender_id: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		chat_id: Option<ChatId>,
		timestamp: DateTime<Utc>,
		data: TypingMeta,
	},

	Error {
		content: String,
		timestamp: DateTime<Utc>,
		data: ErrorMeta,
	},

	ConnectionSuccess {
		sender_id: UserId,
		timestamp: DateTime<Utc>,
		data: ConnectionMeta,
	},

	ChatCreated {
		chat_id: ChatId,
		timestamp: DateTime<Utc>,
		data: ChatCreatedMeta,
	},
}

impl ServerFrame {
	/// Error frame for a taxonomy failure.
	pub fn from_error(err: &ChatError) -> Self {
		ServerFrame::Error {
			content: err.client_message(),
			timestamp: Utc::now(),
			data: ErrorMeta {
				code: err.code().to_string(),
			},
		}
	}

	pub const fn kind(&self) -> &'static str {
		match self {
			ServerFrame::History { .. } => "history",
			ServerFrame::Message { .. } => "message",
			ServerFrame::Typing { .. } => "typing",
			ServerFrame::Error { .. } => "error",
			ServerFrame::ConnectionSuccess { .. } => "connection_success",
			ServerFrame::ChatCreated { .. } => "chat_created",
		}
	}
}

/// Decode one inbound text frame.
///
/// Unknown kinds are reported as [`Inbound::Unrecognized`]; unknown fields on a
/// known kind are rejected.
pub fn decode_client_frame(text: &str, max_frame_size: usize) -> Result<Inbound, FrameError> {
	if text.len() > max_frame_size {
		return Err(FrameError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	let value: Value = serde_json::from_str(text)?;
	let Value::Object(obj) = value else {
		return Err(FrameError::NotAnObject);
	};

	let kind = match obj.get("type") {
		Some(Value::String(k)) => k.clone(),
		_ => return Err(FrameError::MissingType),
	};

	if !CLIENT_KINDS.contains(&kind.as_str()) {
		return Ok(Inbound::Unrecognized(kind));
	}

	reject_unknown_fields(&kind, &obj)?;

	let frame: ClientFrame = serde_json::from_value(Value::Object(obj))?;
	Ok(Inbound::Frame(frame))
}

fn reject_unknown_fields(kind: &str, obj: &Map<String, Value>) -> Result<(), FrameError> {
	let allowed = ClientFrame::allowed_fields(kind);
	match obj.keys().find(|k| !allowed.contains(&k.as_str())) {
		Some(field) => Err(FrameError::UnknownField {
			kind: kind.to_string(),
			field: field.clone(),
		}),
		None => Ok(()),
	}
}

/// Encode a server frame as JSON text.
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, FrameError> {
	Ok(serde_json::to_string(frame)?)
}

/// Encode a client frame as JSON text.
pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, FrameError> {
	Ok(serde_json::to_string(frame)?)
}

/// Decode a server frame (client side).
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, FrameError> {
	Ok(serde_json::from_str(text)?)
}
