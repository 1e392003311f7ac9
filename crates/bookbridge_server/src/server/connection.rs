#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bookbridge_domain::{BookId, ChatError, ChatId, CommunityRoom, ParseIdError, Role, UserId};
use bookbridge_protocol::{
	ChatCreatedMeta, ClientFrame, ConnectionMeta, DEFAULT_MAX_FRAME_SIZE, HistoryEntry, Inbound, MessageMeta,
	ServerFrame, TypingMeta, decode_client_frame, encode_server_frame,
};
use bookbridge_util::secret::SecretString;
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, warn};

use crate::server::auth::{AuthClaims, bearer_from_header, verify_bearer};
use crate::server::registry::{ConnId, LiveConnection, Registration};
use crate::server::state::ChatState;
use crate::server::store::{ChatSession, StoredMessage};
use crate::util::time::ms_to_datetime;

/// Upper bound on flushing queued frames after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub jwt_secret: SecretString,

	/// Bounds the upgrade and, separately, authentication plus session resolution.
	pub handshake_timeout: Duration,

	pub outbound_queue_capacity: usize,

	pub max_frame_bytes: usize,
}

impl ConnectionSettings {
	/// Reader limits so oversized frames fail on their header instead of being buffered.
	fn websocket_config(&self) -> WebSocketConfig {
		let max = self.max_frame_bytes.max(1);
		WebSocketConfig::default()
			.max_frame_size(Some(max))
			.max_message_size(Some(max))
	}
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			jwt_secret: SecretString::new(""),
			handshake_timeout: Duration::from_secs(10),
			outbound_queue_capacity: 256,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Which conversation a chat connection asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
	Book {
		book_id: BookId,
		buyer_id: Option<UserId>,
		seller_hint: Option<UserId>,
	},
	Existing(ChatId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
	Chat(ChatTarget),
	Community,
}

#[derive(Debug)]
enum Credential {
	Verified(AuthClaims),
	/// Nothing presented at upgrade; the first frame must be `auth`.
	Deferred,
}

#[derive(Debug)]
struct UpgradeRequest {
	target: ConnectTarget,
	credential: Credential,
}

/// Upgrade refused with an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rejection {
	pub status: StatusCode,
	pub error: ChatError,
}

impl Rejection {
	fn bad_request(detail: impl Into<String>) -> Self {
		Self {
			status: StatusCode::BAD_REQUEST,
			error: ChatError::ProtocolViolation(detail.into()),
		}
	}

	fn unauthorized(error: ChatError) -> Self {
		Self {
			status: StatusCode::UNAUTHORIZED,
			error,
		}
	}

	fn into_response(self) -> ErrorResponse {
		let body = serde_json::json!({
			"error": self.error.client_message(),
			"code": self.error.code(),
		});
		let mut resp = ErrorResponse::new(Some(body.to_string()));
		*resp.status_mut() = self.status;
		resp.headers_mut()
			.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
		resp
	}
}

fn query_id<T>(query: &HashMap<String, String>, key: &str) -> Result<Option<T>, Rejection>
where
	T: FromStr<Err = ParseIdError>,
{
	match query.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
		None => Ok(None),
		Some(v) => v
			.parse::<T>()
			.map(Some)
			.map_err(|e| Rejection::bad_request(format!("invalid {key}: {e}"))),
	}
}

/// Routes an upgrade path plus query to a connection target.
pub(crate) fn parse_target(path: &str, query: &HashMap<String, String>) -> Result<ConnectTarget, Rejection> {
	let path = path.trim_end_matches('/');
	let book_target = |book_id: BookId| -> Result<ConnectTarget, Rejection> {
		Ok(ConnectTarget::Chat(ChatTarget::Book {
			book_id,
			buyer_id: query_id(query, "buyer_id")?,
			seller_hint: query_id(query, "seller_id")?,
		}))
	};

	match path {
		"/ws/community" => Ok(ConnectTarget::Community),
		"/ws/chat" => {
			if let Some(chat_id) = query_id::<ChatId>(query, "chat_id")? {
				return Ok(ConnectTarget::Chat(ChatTarget::Existing(chat_id)));
			}
			match query_id::<BookId>(query, "book_id")? {
				Some(book_id) => book_target(book_id),
				None => Err(Rejection::bad_request("book_id or chat_id is required")),
			}
		}
		_ => match path.strip_prefix("/ws/chat/") {
			Some(segment) if !segment.contains('/') => {
				let book_id = segment
					.parse::<BookId>()
					.map_err(|e| Rejection::bad_request(format!("invalid book id in path: {e}")))?;
				book_target(book_id)
			}
			_ => Err(Rejection {
				status: StatusCode::NOT_FOUND,
				error: ChatError::ProtocolViolation(format!("no chat endpoint at {path}")),
			}),
		},
	}
}

fn parse_upgrade(req: &Request, secret: &str) -> Result<UpgradeRequest, Rejection> {
	let query: HashMap<String, String> = req
		.uri()
		.query()
		.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
		.unwrap_or_default();

	let target = parse_target(req.uri().path(), &query)?;

	let credential = if let Some(value) = req.headers().get(header::AUTHORIZATION) {
		let value = value
			.to_str()
			.map_err(|_| Rejection::unauthorized(ChatError::InvalidCredential("non-ascii authorization header".into())))?;
		let token = bearer_from_header(value).map_err(Rejection::unauthorized)?;
		Credential::Verified(verify_bearer(Some(token), secret).map_err(Rejection::unauthorized)?)
	} else if let Some(token) = query.get("token").filter(|t| !t.trim().is_empty()) {
		Credential::Verified(verify_bearer(Some(token), secret).map_err(Rejection::unauthorized)?)
	} else {
		Credential::Deferred
	};

	Ok(UpgradeRequest { target, credential })
}

/// Where an authenticated connection ended up.
#[derive(Debug, Clone)]
enum Joined {
	Chat(ChatSession),
	Community,
}

enum RoomRegistration {
	Chat(Registration<ChatId>),
	Community(Registration<CommunityRoom>),
}

fn to_ws(frame: &ServerFrame) -> Result<WsMessage, ChatError> {
	Ok(WsMessage::text(encode_server_frame(frame)?))
}

async fn send_frame(tx: &mpsc::Sender<WsMessage>, frame: &ServerFrame) -> Result<(), ChatError> {
	let msg = to_ws(frame)?;
	tx.send(msg)
		.await
		.map_err(|_| ChatError::TransportFailure("connection writer stopped".to_string()))
}

fn history_entry(stored: StoredMessage) -> HistoryEntry {
	HistoryEntry {
		id: stored.message.id,
		chat_id: stored.message.chat_id,
		sender_id: stored.message.sender_id,
		sender_name: stored.sender_name,
		content: stored.message.content,
		created_at: ms_to_datetime(stored.message.created_at_ms),
	}
}

/// Serves one WebSocket connection from upgrade to close.
///
/// Generic over the byte stream so tests can drive it over an in-process duplex.
pub async fn handle_connection<S>(conn_id: ConnId, stream: S, state: ChatState, settings: ConnectionSettings) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("bookbridge_server_active_connections").decrement(1.0);
		}
	}

	metrics::counter!("bookbridge_server_connections_total").increment(1);
	metrics::gauge!("bookbridge_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut upgrade: Option<UpgradeRequest> = None;
	let secret = settings.jwt_secret.clone();
	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		match parse_upgrade(req, secret.expose()) {
			Ok(parsed) => {
				upgrade = Some(parsed);
				Ok(resp)
			}
			Err(rejection) => {
				info!(conn_id, path = %req.uri().path(), status = %rejection.status, error = %rejection.error, "upgrade rejected");
				metrics::counter!("bookbridge_server_upgrade_rejections_total", "code" => rejection.error.code())
					.increment(1);
				Err(rejection.into_response())
			}
		}
	};

	let accept = accept_hdr_async_with_config(stream, callback, Some(settings.websocket_config()));
	let ws = match timeout(settings.handshake_timeout, accept).await {
		Ok(Ok(ws)) => ws,
		Ok(Err(e)) => {
			debug!(conn_id, error = %e, "websocket handshake failed");
			return Ok(());
		}
		Err(_) => {
			debug!(conn_id, "websocket handshake timed out");
			return Ok(());
		}
	};
	let Some(UpgradeRequest { target, credential }) = upgrade else {
		return Ok(());
	};

	let (sink, mut source) = ws.split();
	let (out_tx, out_rx) = mpsc::channel::<WsMessage>(settings.outbound_queue_capacity.max(1));
	let mut writer = tokio::spawn(write_loop(conn_id, sink, out_rx));
	let close = Arc::new(Notify::new());

	run_session(conn_id, &mut source, &out_tx, &close, target, credential, &state, &settings).await;

	drop(out_tx);
	match timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => warn!(conn_id, error = %e, "writer task failed"),
		Err(_) => {
			debug!(conn_id, "writer did not drain in time; aborting");
			writer.abort();
		}
	}

	debug!(conn_id, "connection closed");
	Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_session<St>(
	conn_id: ConnId,
	source: &mut St,
	out_tx: &mpsc::Sender<WsMessage>,
	close: &Arc<Notify>,
	target: ConnectTarget,
	credential: Credential,
	state: &ChatState,
	settings: &ConnectionSettings,
) where
	St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
	let handshake = timeout(
		settings.handshake_timeout,
		authenticate_and_resolve(source, out_tx, target, credential, state, settings),
	)
	.await;

	let (claims, joined) = match handshake {
		Ok(Ok(v)) => v,
		Ok(Err(err)) => {
			fail_handshake(conn_id, out_tx, &err).await;
			return;
		}
		Err(_) => {
			fail_handshake(conn_id, out_tx, &ChatError::InvalidCredential("handshake timed out".to_string())).await;
			return;
		}
	};

	if let Joined::Chat(session) = &joined {
		match state.messages.history(session.id).await {
			Ok(history) => {
				let frame = ServerFrame::History {
					chat_id: session.id,
					timestamp: Utc::now(),
					data: history.into_iter().map(history_entry).collect(),
				};
				if let Err(e) = send_frame(out_tx, &frame).await {
					debug!(conn_id, error = %e, "could not queue history");
					return;
				}
			}
			Err(e) => warn!(conn_id, chat_id = %session.id, error = %e, "history replay failed; continuing without it"),
		}
	}

	let live = LiveConnection::new(
		conn_id,
		claims.user_id,
		claims.username.clone(),
		out_tx.clone(),
		Arc::clone(close),
	);
	let registration = match &joined {
		Joined::Chat(session) => RoomRegistration::Chat(state.chat_rooms.register(session.id, live)),
		Joined::Community => RoomRegistration::Community(state.community.register(CommunityRoom, live)),
	};

	info!(conn_id, user_id = %claims.user_id, room = %room_label(&joined), "connection active");

	loop {
		let next = tokio::select! {
			_ = close.notified() => {
				info!(conn_id, user_id = %claims.user_id, "connection evicted by broadcast");
				break;
			}
			next = source.next() => next,
		};

		let msg = match next {
			Some(Ok(msg)) => msg,
			Some(Err(WsError::Capacity(e))) => {
				info!(conn_id, user_id = %claims.user_id, error = %e, "frame over size limit; closing");
				metrics::counter!("bookbridge_server_oversized_frames_total").increment(1);
				break;
			}
			Some(Err(e)) => {
				debug!(conn_id, error = %e, "read failed");
				break;
			}
			None => break,
		};

		let keep_going = match msg {
			WsMessage::Text(text) => {
				handle_text(conn_id, text.as_str(), &claims, &joined, &registration, out_tx, state, settings).await
			}
			WsMessage::Binary(_) => {
				send_local_error(
					conn_id,
					out_tx,
					&ChatError::ProtocolViolation("binary frames are not supported".to_string()),
				)
				.await
			}
			WsMessage::Close(_) => false,
			_ => true,
		};
		if !keep_going {
			break;
		}
	}

	drop(registration);
	info!(conn_id, user_id = %claims.user_id, "connection left");
}

fn room_label(joined: &Joined) -> String {
	match joined {
		Joined::Chat(session) => format!("chat:{}", session.id),
		Joined::Community => CommunityRoom.to_string(),
	}
}

async fn authenticate_and_resolve<St>(
	source: &mut St,
	out_tx: &mpsc::Sender<WsMessage>,
	target: ConnectTarget,
	credential: Credential,
	state: &ChatState,
	settings: &ConnectionSettings,
) -> Result<(AuthClaims, Joined), ChatError>
where
	St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
	let mut claims = match credential {
		Credential::Verified(claims) => claims,
		Credential::Deferred => {
			await_auth_frame(source, settings.max_frame_bytes, settings.jwt_secret.expose()).await?
		}
	};

	// Display names follow the account table when it knows the user.
	match state.backend.username(claims.user_id).await {
		Ok(Some(name)) => claims.username = name,
		Ok(None) => {}
		Err(e) => debug!(user_id = %claims.user_id, error = %e, "username lookup failed; keeping token username"),
	}

	send_frame(
		out_tx,
		&ServerFrame::ConnectionSuccess {
			sender_id: claims.user_id,
			timestamp: Utc::now(),
			data: ConnectionMeta {
				user_id: claims.user_id,
				username: claims.username.clone(),
				role: claims.role,
			},
		},
	)
	.await?;

	let chat = match target {
		ConnectTarget::Community => return Ok((claims, Joined::Community)),
		ConnectTarget::Chat(chat) => chat,
	};

	let session = match chat {
		ChatTarget::Existing(chat_id) => state.sessions.open_existing(chat_id, claims.user_id).await?,
		ChatTarget::Book {
			book_id,
			buyer_id,
			seller_hint,
		} => {
			let counterparty = match claims.role {
				Role::Buyer => seller_hint,
				Role::Seller | Role::Both => buyer_id,
			};
			state
				.sessions
				.resolve_or_create(book_id, claims.user_id, claims.role, counterparty)
				.await?
				.session
		}
	};

	send_frame(
		out_tx,
		&ServerFrame::ChatCreated {
			chat_id: session.id,
			timestamp: Utc::now(),
			data: ChatCreatedMeta {
				book_id: session.book_id,
				buyer_id: session.buyer_id,
				seller_id: session.seller_id,
			},
		},
	)
	.await?;

	Ok((claims, Joined::Chat(session)))
}

async fn await_auth_frame<St>(source: &mut St, max_frame_bytes: usize, secret: &str) -> Result<AuthClaims, ChatError>
where
	St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
	loop {
		let msg = match source.next().await {
			Some(Ok(msg)) => msg,
			Some(Err(e)) => return Err(ChatError::TransportFailure(e.to_string())),
			None => return Err(ChatError::TransportFailure("peer closed before authenticating".to_string())),
		};

		match msg {
			WsMessage::Text(text) => {
				return match decode_client_frame(text.as_str(), max_frame_bytes)? {
					Inbound::Frame(ClientFrame::Auth { token }) => verify_bearer(Some(&token), secret),
					Inbound::Frame(other) => Err(ChatError::ProtocolViolation(format!(
						"expected auth frame, got {}",
						other.kind()
					))),
					Inbound::Unrecognized(kind) => {
						Err(ChatError::ProtocolViolation(format!("expected auth frame, got {kind}")))
					}
				};
			}
			WsMessage::Binary(_) => {
				return Err(ChatError::ProtocolViolation("binary frames are not supported".to_string()));
			}
			WsMessage::Close(_) => {
				return Err(ChatError::TransportFailure("peer closed before authenticating".to_string()));
			}
			_ => continue,
		}
	}
}

async fn fail_handshake(conn_id: ConnId, out_tx: &mpsc::Sender<WsMessage>, err: &ChatError) {
	match err {
		ChatError::Unauthenticated | ChatError::InvalidCredential(_) => {
			metrics::counter!("bookbridge_server_auth_failures_total").increment(1);
			info!(conn_id, error = %err, "authentication failed");
		}
		ChatError::Storage(_) => warn!(conn_id, error = %err, "session resolution failed"),
		_ => info!(conn_id, code = err.code(), error = %err, "handshake refused"),
	}

	if matches!(err, ChatError::TransportFailure(_)) {
		return;
	}
	if let Err(e) = send_frame(out_tx, &ServerFrame::from_error(err)).await {
		debug!(conn_id, error = %e, "could not queue handshake error");
	}
}

/// Sends an error frame to this connection only. Returns `false` once the writer is gone.
async fn send_local_error(conn_id: ConnId, out_tx: &mpsc::Sender<WsMessage>, err: &ChatError) -> bool {
	if let ChatError::Storage(_) = err {
		warn!(conn_id, error = %err, "request failed");
	} else {
		debug!(conn_id, code = err.code(), error = %err, "rejecting frame");
	}
	send_frame(out_tx, &ServerFrame::from_error(err)).await.is_ok()
}

#[allow(clippy::too_many_arguments)]
async fn handle_text(
	conn_id: ConnId,
	text: &str,
	claims: &AuthClaims,
	joined: &Joined,
	registration: &RoomRegistration,
	out_tx: &mpsc::Sender<WsMessage>,
	state: &ChatState,
	settings: &ConnectionSettings,
) -> bool {
	let frame = match decode_client_frame(text, settings.max_frame_bytes) {
		Ok(Inbound::Frame(frame)) => frame,
		Ok(Inbound::Unrecognized(kind)) => {
			debug!(conn_id, kind = %kind, "ignoring unrecognized frame kind");
			return true;
		}
		Err(e) => return send_local_error(conn_id, out_tx, &ChatError::from(e)).await,
	};

	match (frame, joined) {
		(ClientFrame::Auth { .. }, _) => {
			debug!(conn_id, "ignoring auth frame after handshake");
			true
		}

		(ClientFrame::Message { content, chat_id }, Joined::Chat(session)) => {
			if let Some(requested) = chat_id
				&& requested != session.id
			{
				let err = ChatError::ProtocolViolation(format!(
					"message addressed to chat {requested} on a connection bound to chat {}",
					session.id
				));
				return send_local_error(conn_id, out_tx, &err).await;
			}

			let stored = match state.messages.append(session.id, claims.user_id, &content).await {
				Ok(stored) => stored,
				Err(err) => return send_local_error(conn_id, out_tx, &err).await,
			};

			let frame = ServerFrame::Message {
				content: stored.content,
				sender_id: stored.sender_id,
				chat_id: Some(stored.chat_id),
				timestamp: ms_to_datetime(stored.created_at_ms),
				data: MessageMeta {
					sender_name: claims.username.clone(),
					message_id: Some(stored.id),
				},
			};
			broadcast(conn_id, registration, &frame, None, state);
			true
		}

		(ClientFrame::Message { content, .. }, Joined::Community) => {
			if let Err(err) = state.messages.validate_content(&content) {
				return send_local_error(conn_id, out_tx, &err).await;
			}
			let frame = ServerFrame::Message {
				content,
				sender_id: claims.user_id,
				chat_id: None,
				timestamp: Utc::now(),
				data: MessageMeta {
					sender_name: claims.username.clone(),
					message_id: None,
				},
			};
			broadcast(conn_id, registration, &frame, None, state);
			true
		}

		(ClientFrame::Typing { chat_id }, _) => {
			let bound = match joined {
				Joined::Chat(session) => Some(session.id),
				Joined::Community => None,
			};
			if chat_id.is_some() && chat_id != bound {
				debug!(conn_id, "ignoring typing frame for another chat");
				return true;
			}
			let frame = ServerFrame::Typing {
				sender_id: claims.user_id,
				chat_id: bound,
				timestamp: Utc::now(),
				data: TypingMeta {
					sender_name: claims.username.clone(),
				},
			};
			broadcast(conn_id, registration, &frame, Some(conn_id), state);
			true
		}
	}
}

fn broadcast(conn_id: ConnId, registration: &RoomRegistration, frame: &ServerFrame, skip: Option<ConnId>, state: &ChatState) {
	let msg = match to_ws(frame) {
		Ok(msg) => msg,
		Err(e) => {
			warn!(conn_id, error = %e, "failed to encode broadcast frame");
			return;
		}
	};

	let outcome = match (registration, skip) {
		(RoomRegistration::Chat(reg), None) => state.chat_rooms.broadcast(reg.room(), msg),
		(RoomRegistration::Chat(reg), Some(skip)) => state.chat_rooms.broadcast_except(reg.room(), msg, skip),
		(RoomRegistration::Community(reg), None) => state.community.broadcast(reg.room(), msg),
		(RoomRegistration::Community(reg), Some(skip)) => state.community.broadcast_except(reg.room(), msg, skip),
	};

	debug!(
		conn_id,
		kind = frame.kind(),
		delivered = outcome.delivered,
		evicted = outcome.evicted,
		"broadcast"
	);
}

async fn write_loop<Si>(conn_id: ConnId, mut sink: Si, mut rx: mpsc::Receiver<WsMessage>)
where
	Si: Sink<WsMessage, Error = WsError> + Unpin,
{
	while let Some(msg) = rx.recv().await {
		if let Err(e) = sink.send(msg).await {
			debug!(conn_id, error = %e, "write failed; stopping writer");
			metrics::counter!("bookbridge_server_write_failures_total").increment(1);
			return;
		}
	}

	if let Err(e) = sink.close().await {
		debug!(conn_id, error = %e, "close handshake failed");
	}
}
