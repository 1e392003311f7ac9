#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bookbridge_domain::{BookId, ChatError, ChatId, MessageId, UserId};
use bookbridge_util::secret::SecretString;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::server::auth::{AuthClaims, bearer_from_header, verify_bearer};
use crate::server::state::ChatState;
use crate::util::time::ms_to_datetime;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Everything the HTTP side-channel needs per request.
#[derive(Clone)]
pub struct HttpContext {
	pub health: HealthState,
	pub chat: ChatState,
	pub jwt_secret: SecretString,
}

#[derive(Debug, Serialize)]
struct LastMessageView {
	id: MessageId,
	sender_id: UserId,
	content: String,
	created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SessionView {
	chat_id: ChatId,
	book_id: BookId,
	book_title: String,
	buyer_id: UserId,
	buyer_name: String,
	seller_id: UserId,
	seller_name: String,
	created_at: DateTime<Utc>,
	last_message: Option<LastMessageView>,
}

#[derive(Debug, Serialize)]
struct MessageView {
	id: MessageId,
	chat_id: ChatId,
	sender_id: UserId,
	sender_name: String,
	content: String,
	created_at: DateTime<Utc>,
	is_self_sender: bool,
}

pub fn spawn_http_server(bind: SocketAddr, ctx: HttpContext) {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(bind, ctx).await {
			warn!(error = %err, "http server stopped");
		}
	});
}

async fn run_http_server(bind: SocketAddr, ctx: HttpContext) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let ctx = ctx.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_http(req, ctx.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(error = %err, "http connection error");
			}
		});
	}
}

async fn handle_http(req: Request<Incoming>, ctx: HttpContext) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let auth = req
		.headers()
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.map(str::to_owned);
	let method = req.method().clone();
	let path = req.uri().path().to_owned();
	drop(req);

	let (status, content_type, body) = route(&method, &path, auth.as_deref(), &ctx).await;

	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
	Ok(resp)
}

const TEXT: &str = "text/plain; charset=utf-8";
const JSON: &str = "application/json";

/// Routes one request; transport-independent so it can be exercised directly.
pub(crate) async fn route(
	method: &Method,
	path: &str,
	authorization: Option<&str>,
	ctx: &HttpContext,
) -> (StatusCode, &'static str, Bytes) {
	if method != Method::GET {
		return (StatusCode::METHOD_NOT_ALLOWED, TEXT, Bytes::new());
	}

	match path {
		"/healthz" => (StatusCode::OK, TEXT, Bytes::from_static(b"ok")),
		"/readyz" => {
			let backend_ok = match ctx.chat.backend.ping().await {
				Ok(()) => true,
				Err(e) => {
					warn!(error = %e, "readiness probe: backend unavailable");
					false
				}
			};
			if ctx.health.is_ready() && backend_ok {
				(StatusCode::OK, TEXT, Bytes::from_static(b"ready"))
			} else {
				(StatusCode::SERVICE_UNAVAILABLE, TEXT, Bytes::from_static(b"not-ready"))
			}
		}
		"/api/chats" => json_result(list_sessions(authorization, ctx).await),
		_ => match chat_messages_path(path) {
			Some(Ok(chat)) => json_result(list_messages(chat, authorization, ctx).await),
			Some(Err(err)) => json_result::<()>(Err(err)),
			None => (StatusCode::NOT_FOUND, TEXT, Bytes::new()),
		},
	}
}

/// `/api/chats/{id}/messages` → the chat id.
fn chat_messages_path(path: &str) -> Option<Result<ChatId, ChatError>> {
	let id = path.strip_prefix("/api/chats/")?.strip_suffix("/messages")?;
	if id.contains('/') {
		return None;
	}
	Some(
		id.parse::<ChatId>()
			.map_err(|e| ChatError::ProtocolViolation(format!("invalid chat id: {e}"))),
	)
}

fn authenticate(authorization: Option<&str>, ctx: &HttpContext) -> Result<AuthClaims, ChatError> {
	let token = authorization.map(bearer_from_header).transpose()?;
	verify_bearer(token, ctx.jwt_secret.expose())
}

async fn list_sessions(authorization: Option<&str>, ctx: &HttpContext) -> Result<Vec<SessionView>, ChatError> {
	let claims = authenticate(authorization, ctx)?;
	let summaries = ctx.chat.sessions.sessions_for_user(claims.user_id, claims.role).await?;
	Ok(summaries
		.into_iter()
		.map(|s| SessionView {
			chat_id: s.session.id,
			book_id: s.session.book_id,
			book_title: s.book_title,
			buyer_id: s.session.buyer_id,
			buyer_name: s.buyer_name,
			seller_id: s.session.seller_id,
			seller_name: s.seller_name,
			created_at: ms_to_datetime(s.session.created_at_ms),
			last_message: s.last_message.map(|m| LastMessageView {
				id: m.id,
				sender_id: m.sender_id,
				content: m.content,
				created_at: ms_to_datetime(m.created_at_ms),
			}),
		})
		.collect())
}

async fn list_messages(chat: ChatId, authorization: Option<&str>, ctx: &HttpContext) -> Result<Vec<MessageView>, ChatError> {
	let claims = authenticate(authorization, ctx)?;
	let messages = ctx.chat.messages.messages_for_participant(chat, claims.user_id).await?;
	Ok(messages
		.into_iter()
		.map(|m| MessageView {
			id: m.stored.message.id,
			chat_id: m.stored.message.chat_id,
			sender_id: m.stored.message.sender_id,
			sender_name: m.stored.sender_name,
			content: m.stored.message.content,
			created_at: ms_to_datetime(m.stored.message.created_at_ms),
			is_self_sender: m.is_self_sender,
		})
		.collect())
}

fn status_for(err: &ChatError) -> StatusCode {
	match err {
		ChatError::Unauthenticated | ChatError::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
		ChatError::NotAuthorizedForBook(_) => StatusCode::FORBIDDEN,
		ChatError::BookNotFound(_) | ChatError::InvalidSession(_) => StatusCode::NOT_FOUND,
		ChatError::Storage(_) | ChatError::TransportFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
		ChatError::MissingCounterparty | ChatError::EmptyContent | ChatError::ProtocolViolation(_) => {
			StatusCode::BAD_REQUEST
		}
	}
}

fn json_result<T: Serialize>(result: Result<T, ChatError>) -> (StatusCode, &'static str, Bytes) {
	let (status, body) = match result {
		Ok(value) => match serde_json::to_vec(&value) {
			Ok(body) => (StatusCode::OK, body),
			Err(e) => {
				warn!(error = %e, "failed to encode response");
				(
					StatusCode::INTERNAL_SERVER_ERROR,
					br#"{"error":"internal server error","code":"INTERNAL"}"#.to_vec(),
				)
			}
		},
		Err(err) => {
			if let ChatError::Storage(_) = err {
				warn!(error = %err, "http request failed");
			}
			let body = serde_json::json!({ "error": err.client_message(), "code": err.code() });
			(status_for(&err), body.to_string().into_bytes())
		}
	};
	(status, JSON, Bytes::from(body))
}
