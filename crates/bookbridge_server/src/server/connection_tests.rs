#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bookbridge_domain::{BookId, ChatId, CommunityRoom, Role, UserId};
use bookbridge_protocol::{ClientFrame, HistoryEntry, ServerFrame, decode_server_frame, encode_client_frame};
use bookbridge_util::secret::SecretString;
use futures::{SinkExt, StreamExt};
use proptest::prelude::*;
use tokio::io::DuplexStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{WebSocketStream, client_async};

use crate::server::auth::{AuthClaims, issue_token};
use crate::server::connection::{ChatTarget, ConnectTarget, ConnectionSettings, handle_connection, parse_target};
use crate::server::state::ChatState;
use crate::server::test_support::*;

type Client = WebSocketStream<DuplexStream>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn settings() -> ConnectionSettings {
	ConnectionSettings {
		jwt_secret: SecretString::new(SECRET),
		..ConnectionSettings::default()
	}
}

/// Runs the server side of one connection over an in-process pipe.
async fn connect_with(
	state: &ChatState,
	settings: ConnectionSettings,
	path: &str,
	authorization: Option<&str>,
) -> Result<Client, WsError> {
	let (client_io, server_io) = tokio::io::duplex(64 * 1024);
	let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
	tokio::spawn(handle_connection(conn_id, server_io, state.clone(), settings));

	let url = format!("ws://localhost{path}");
	let mut request = url.as_str().into_client_request()?;
	if let Some(value) = authorization {
		request
			.headers_mut()
			.insert(header::AUTHORIZATION, value.parse().expect("header value"));
	}
	let (ws, _response) = client_async(request, client_io).await?;
	Ok(ws)
}

async fn connect(state: &ChatState, path: &str) -> Client {
	connect_with(state, settings(), path, None).await.expect("upgrade accepted")
}

async fn next_frame(ws: &mut Client) -> ServerFrame {
	loop {
		let msg = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("frame within timeout")
			.expect("connection still open")
			.expect("readable message");
		match msg {
			WsMessage::Text(text) => return decode_server_frame(text.as_str()).expect("server frame"),
			WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
			other => panic!("unexpected websocket message: {other:?}"),
		}
	}
}

async fn expect_closed(ws: &mut Client) {
	loop {
		match timeout(Duration::from_secs(2), ws.next()).await.expect("close within timeout") {
			None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
			Some(Ok(WsMessage::Text(text))) => panic!("unexpected frame before close: {text}"),
			Some(Ok(_)) => continue,
		}
	}
}

async fn assert_silent(ws: &mut Client) {
	let got = timeout(Duration::from_millis(100), ws.next()).await;
	assert!(got.is_err(), "expected no frame, got {got:?}");
}

async fn send(ws: &mut Client, frame: &ClientFrame) {
	let text = encode_client_frame(frame).expect("encode");
	ws.send(WsMessage::text(text)).await.expect("send");
}

async fn send_raw(ws: &mut Client, text: &str) {
	ws.send(WsMessage::text(text)).await.expect("send");
}

fn say(content: &str) -> ClientFrame {
	ClientFrame::Message {
		content: content.to_string(),
		chat_id: None,
	}
}

fn error_code(frame: &ServerFrame) -> &str {
	match frame {
		ServerFrame::Error { data, .. } => data.code.as_str(),
		other => panic!("expected error frame, got {other:?}"),
	}
}

/// Consumes `connection_success`, `chat_created` and `history`.
async fn expect_joined(ws: &mut Client, user: UserId) -> (ChatId, Vec<HistoryEntry>) {
	match next_frame(ws).await {
		ServerFrame::ConnectionSuccess { sender_id, .. } => assert_eq!(sender_id, user),
		other => panic!("expected connection_success, got {other:?}"),
	}
	let chat_id = match next_frame(ws).await {
		ServerFrame::ChatCreated { chat_id, .. } => chat_id,
		other => panic!("expected chat_created, got {other:?}"),
	};
	match next_frame(ws).await {
		ServerFrame::History { chat_id: replayed, data, .. } => {
			assert_eq!(replayed, chat_id);
			(chat_id, data)
		}
		other => panic!("expected history, got {other:?}"),
	}
}

async fn wait_members(state: &ChatState, chat: ChatId, n: usize) {
	wait_until(|| state.chat_rooms.connection_count(&chat) == n).await;
}

fn buyer_token() -> String {
	token_for(BUYER, "bea", Role::Buyer)
}

fn seller_token() -> String {
	token_for(SELLER, "sam", Role::Seller)
}

/// Buyer and seller both joined to the chat for [`BOOK`].
async fn buyer_and_seller(state: &ChatState) -> (Client, Client, ChatId) {
	let mut buyer = connect(state, &format!("/ws/chat/{BOOK}?token={}", buyer_token())).await;
	let (chat, _) = expect_joined(&mut buyer, BUYER).await;

	let auth = format!("Bearer {}", seller_token());
	let mut seller = connect_with(state, settings(), &format!("/ws/chat/{BOOK}?buyer_id={BUYER}"), Some(&auth))
		.await
		.expect("upgrade accepted");
	let (seller_chat, _) = expect_joined(&mut seller, SELLER).await;
	assert_eq!(seller_chat, chat);

	wait_members(state, chat, 2).await;
	(buyer, seller, chat)
}

#[tokio::test]
async fn buyer_first_contact_creates_the_session_and_replays_empty_history() {
	let (_backend, state) = seeded_state().await;
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?token={}", buyer_token())).await;

	match next_frame(&mut ws).await {
		ServerFrame::ConnectionSuccess { sender_id, data, .. } => {
			assert_eq!(sender_id, BUYER);
			assert_eq!(data.username, "bea");
			assert_eq!(data.role, Role::Buyer);
		}
		other => panic!("expected connection_success, got {other:?}"),
	}
	let chat = match next_frame(&mut ws).await {
		ServerFrame::ChatCreated { chat_id, data, .. } => {
			assert_eq!(data.book_id, BOOK);
			assert_eq!(data.buyer_id, BUYER);
			assert_eq!(data.seller_id, SELLER);
			chat_id
		}
		other => panic!("expected chat_created, got {other:?}"),
	};
	match next_frame(&mut ws).await {
		ServerFrame::History { chat_id, data, .. } => {
			assert_eq!(chat_id, chat);
			assert!(data.is_empty());
		}
		other => panic!("expected history, got {other:?}"),
	}

	wait_members(&state, chat, 1).await;
}

#[tokio::test]
async fn messages_are_persisted_then_reach_both_participants() {
	let (_backend, state) = seeded_state().await;
	let (mut buyer, mut seller, chat) = buyer_and_seller(&state).await;

	send(&mut buyer, &say("Is it still available?")).await;

	let mut message_id = None;
	for ws in [&mut buyer, &mut seller] {
		match next_frame(ws).await {
			ServerFrame::Message {
				content,
				sender_id,
				chat_id,
				data,
				..
			} => {
				assert_eq!(content, "Is it still available?");
				assert_eq!(sender_id, BUYER);
				assert_eq!(chat_id, Some(chat));
				assert_eq!(data.sender_name, "bea");
				assert!(data.message_id.is_some());
				message_id = data.message_id;
			}
			other => panic!("expected message, got {other:?}"),
		}
	}

	let history = state.messages.history(chat).await.unwrap();
	assert_eq!(history.len(), 1);
	assert_eq!(Some(history[0].message.id), message_id);

	send(
		&mut seller,
		&ClientFrame::Message {
			content: "Yes, it is".to_string(),
			chat_id: Some(chat),
		},
	)
	.await;
	for ws in [&mut buyer, &mut seller] {
		match next_frame(ws).await {
			ServerFrame::Message { sender_id, data, .. } => {
				assert_eq!(sender_id, SELLER);
				assert_eq!(data.sender_name, "sam");
			}
			other => panic!("expected message, got {other:?}"),
		}
	}
	assert_eq!(state.messages.history(chat).await.unwrap().len(), 2);
}

#[tokio::test]
async fn reconnect_replays_history_oldest_first() {
	let (_backend, state) = seeded_state().await;
	let chat = state
		.sessions
		.resolve_or_create(BOOK, BUYER, Role::Buyer, None)
		.await
		.unwrap()
		.session
		.id;
	state.messages.append(chat, BUYER, "one").await.unwrap();
	state.messages.append(chat, SELLER, "two").await.unwrap();
	state.messages.append(chat, BUYER, "three").await.unwrap();

	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?token={}", buyer_token())).await;
	let (joined, history) = expect_joined(&mut ws, BUYER).await;
	assert_eq!(joined, chat);

	let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
	assert_eq!(contents, vec!["one", "two", "three"]);
	assert_eq!(history[1].sender_name, "sam");
	assert!(history.iter().all(|m| m.chat_id == chat));
}

#[tokio::test]
async fn display_name_comes_from_the_account_table() {
	let (_backend, state) = seeded_state().await;
	let stale = token_for(BUYER, "bea-before-rename", Role::Buyer);
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?token={stale}")).await;

	match next_frame(&mut ws).await {
		ServerFrame::ConnectionSuccess { data, .. } => assert_eq!(data.username, "bea"),
		other => panic!("expected connection_success, got {other:?}"),
	}
	let chat = match next_frame(&mut ws).await {
		ServerFrame::ChatCreated { chat_id, .. } => chat_id,
		other => panic!("expected chat_created, got {other:?}"),
	};
	assert!(matches!(next_frame(&mut ws).await, ServerFrame::History { .. }));
	wait_members(&state, chat, 1).await;

	send(&mut ws, &say("hi")).await;
	match next_frame(&mut ws).await {
		ServerFrame::Message { data, .. } => assert_eq!(data.sender_name, "bea"),
		other => panic!("expected message, got {other:?}"),
	}
}

#[tokio::test]
async fn seller_without_ownership_is_refused_and_closed() {
	let (_backend, state) = seeded_state().await;
	let token = token_for(OTHER_SELLER, "sol", Role::Seller);
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?buyer_id={BUYER}&token={token}")).await;

	assert!(matches!(next_frame(&mut ws).await, ServerFrame::ConnectionSuccess { .. }));
	assert_eq!(error_code(&next_frame(&mut ws).await), "NOT_AUTHORIZED_FOR_BOOK");
	expect_closed(&mut ws).await;

	assert!(state.sessions.sessions_for_user(BUYER, Role::Buyer).await.unwrap().is_empty());
	assert_eq!(state.chat_rooms.room_count(), 0);
}

#[tokio::test]
async fn seller_must_name_the_buyer() {
	let (_backend, state) = seeded_state().await;
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?token={}", seller_token())).await;

	assert!(matches!(next_frame(&mut ws).await, ServerFrame::ConnectionSuccess { .. }));
	assert_eq!(error_code(&next_frame(&mut ws).await), "MISSING_COUNTERPARTY");
	expect_closed(&mut ws).await;
}

#[tokio::test]
async fn seller_naming_an_unknown_buyer_is_refused() {
	let (_backend, state) = seeded_state().await;
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?buyer_id=999&token={}", seller_token())).await;

	assert!(matches!(next_frame(&mut ws).await, ServerFrame::ConnectionSuccess { .. }));
	assert_eq!(error_code(&next_frame(&mut ws).await), "MISSING_COUNTERPARTY");
	expect_closed(&mut ws).await;
	assert!(state.sessions.sessions_for_user(SELLER, Role::Seller).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_book_is_reported_and_closed() {
	let (_backend, state) = seeded_state().await;
	let mut ws = connect(&state, &format!("/ws/chat/999?token={}", buyer_token())).await;

	assert!(matches!(next_frame(&mut ws).await, ServerFrame::ConnectionSuccess { .. }));
	assert_eq!(error_code(&next_frame(&mut ws).await), "BOOK_NOT_FOUND");
	expect_closed(&mut ws).await;
}

#[tokio::test]
async fn credential_may_arrive_as_the_first_frame() {
	let (_backend, state) = seeded_state().await;
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}")).await;

	send(&mut ws, &ClientFrame::Auth { token: buyer_token() }).await;
	let (chat, history) = expect_joined(&mut ws, BUYER).await;
	assert!(history.is_empty());
	wait_members(&state, chat, 1).await;

	send(&mut ws, &say("hello")).await;
	assert!(matches!(next_frame(&mut ws).await, ServerFrame::Message { .. }));
}

#[tokio::test]
async fn first_frame_other_than_auth_fails_the_handshake() {
	let (_backend, state) = seeded_state().await;
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}")).await;

	send(&mut ws, &say("let me in")).await;
	assert_eq!(error_code(&next_frame(&mut ws).await), "PROTOCOL_VIOLATION");
	expect_closed(&mut ws).await;

	assert!(state.sessions.sessions_for_user(BUYER, Role::Buyer).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_first_frame_credential_is_rejected() {
	let (_backend, state) = seeded_state().await;
	let forged = issue_with_other_secret();
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}")).await;

	send(&mut ws, &ClientFrame::Auth { token: forged }).await;
	assert_eq!(error_code(&next_frame(&mut ws).await), "INVALID_CREDENTIAL");
	expect_closed(&mut ws).await;
}

fn issue_with_other_secret() -> String {
	issue_token(&AuthClaims::new(BUYER, "bea", Role::Buyer, 3600), "someone-elses-secret").unwrap()
}

#[tokio::test]
async fn silent_client_gets_one_error_then_close() {
	let (_backend, state) = seeded_state().await;
	let quick = ConnectionSettings {
		handshake_timeout: Duration::from_millis(200),
		..settings()
	};
	let mut ws = connect_with(&state, quick, &format!("/ws/chat/{BOOK}"), None)
		.await
		.expect("upgrade accepted");

	assert_eq!(error_code(&next_frame(&mut ws).await), "INVALID_CREDENTIAL");
	expect_closed(&mut ws).await;
	assert_eq!(state.chat_rooms.room_count(), 0);
}

fn rejected_status(result: Result<Client, WsError>) -> StatusCode {
	match result {
		Err(WsError::Http(resp)) => resp.status(),
		Err(other) => panic!("expected http rejection, got {other:?}"),
		Ok(_) => panic!("expected the upgrade to be refused"),
	}
}

#[tokio::test]
async fn upgrade_is_refused_for_bad_credentials_and_routes() {
	let (_backend, state) = seeded_state().await;

	let bad_token = connect_with(&state, settings(), &format!("/ws/chat/{BOOK}?token=garbage"), None).await;
	assert_eq!(rejected_status(bad_token), StatusCode::UNAUTHORIZED);

	let bad_scheme = connect_with(&state, settings(), &format!("/ws/chat/{BOOK}"), Some("Basic Zm9vOmJhcg==")).await;
	assert_eq!(rejected_status(bad_scheme), StatusCode::UNAUTHORIZED);

	// The header is authoritative even when the query carries a valid token.
	let header_wins = connect_with(
		&state,
		settings(),
		&format!("/ws/chat/{BOOK}?token={}", buyer_token()),
		Some("Bearer garbage"),
	)
	.await;
	assert_eq!(rejected_status(header_wins), StatusCode::UNAUTHORIZED);

	let unknown = connect_with(&state, settings(), "/ws/market", None).await;
	assert_eq!(rejected_status(unknown), StatusCode::NOT_FOUND);

	let bad_id = connect_with(&state, settings(), "/ws/chat/abc", None).await;
	assert_eq!(rejected_status(bad_id), StatusCode::BAD_REQUEST);

	let no_target = connect_with(&state, settings(), "/ws/chat", None).await;
	assert_eq!(rejected_status(no_target), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_frames_are_reported_and_the_connection_survives() {
	let (_backend, state) = seeded_state().await;
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?token={}", buyer_token())).await;
	let (chat, _) = expect_joined(&mut ws, BUYER).await;
	wait_members(&state, chat, 1).await;

	send_raw(&mut ws, "not json").await;
	assert_eq!(error_code(&next_frame(&mut ws).await), "PROTOCOL_VIOLATION");

	send_raw(&mut ws, r#"{"type":"message","content":"hi","priority":"high"}"#).await;
	assert_eq!(error_code(&next_frame(&mut ws).await), "PROTOCOL_VIOLATION");

	ws.send(WsMessage::binary(vec![1u8, 2, 3])).await.unwrap();
	assert_eq!(error_code(&next_frame(&mut ws).await), "PROTOCOL_VIOLATION");

	send(&mut ws, &say("still here")).await;
	match next_frame(&mut ws).await {
		ServerFrame::Message { content, .. } => assert_eq!(content, "still here"),
		other => panic!("expected message, got {other:?}"),
	}
	assert_eq!(state.messages.history(chat).await.unwrap().len(), 1);
}

#[tokio::test]
async fn empty_content_is_refused_to_the_sender_only() {
	let (_backend, state) = seeded_state().await;
	let (mut buyer, mut seller, chat) = buyer_and_seller(&state).await;

	send(&mut buyer, &say("   \n\t")).await;
	assert_eq!(error_code(&next_frame(&mut buyer).await), "EMPTY_CONTENT");
	assert_silent(&mut seller).await;
	assert!(state.messages.history(chat).await.unwrap().is_empty());

	send(&mut buyer, &say("ok")).await;
	assert!(matches!(next_frame(&mut seller).await, ServerFrame::Message { .. }));
}

#[tokio::test]
async fn oversized_frame_closes_the_connection_unread() {
	let (_backend, state) = seeded_state().await;
	let small = ConnectionSettings {
		max_frame_bytes: 1024,
		..settings()
	};
	let mut ws = connect_with(&state, small, &format!("/ws/chat/{BOOK}?token={}", buyer_token()), None)
		.await
		.expect("upgrade accepted");
	let (chat, _) = expect_joined(&mut ws, BUYER).await;
	wait_members(&state, chat, 1).await;

	send(&mut ws, &say(&"x".repeat(4096))).await;
	expect_closed(&mut ws).await;

	wait_members(&state, chat, 0).await;
	assert!(state.messages.history(chat).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_history_read_still_activates_the_connection() {
	let (backend, state) = flaky_state().await;
	backend.set_fail_history(true);
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?token={}", buyer_token())).await;

	assert!(matches!(next_frame(&mut ws).await, ServerFrame::ConnectionSuccess { .. }));
	let chat = match next_frame(&mut ws).await {
		ServerFrame::ChatCreated { chat_id, .. } => chat_id,
		other => panic!("expected chat_created, got {other:?}"),
	};
	wait_members(&state, chat, 1).await;

	send(&mut ws, &say("anyone there?")).await;
	match next_frame(&mut ws).await {
		ServerFrame::Message { content, chat_id, .. } => {
			assert_eq!(content, "anyone there?");
			assert_eq!(chat_id, Some(chat));
		}
		other => panic!("expected message instead of history, got {other:?}"),
	}
}

#[tokio::test]
async fn persistence_failure_is_reported_to_the_sender_only() {
	let (backend, state) = flaky_state().await;
	let (mut buyer, mut seller, chat) = buyer_and_seller(&state).await;

	backend.set_fail_appends(true);
	send(&mut buyer, &say("lost?")).await;
	match next_frame(&mut buyer).await {
		ServerFrame::Error { content, data, .. } => {
			assert_eq!(data.code, "INTERNAL");
			assert!(!content.contains("locked"), "storage detail leaked: {content}");
		}
		other => panic!("expected error frame, got {other:?}"),
	}
	assert_silent(&mut seller).await;

	backend.set_fail_appends(false);
	send(&mut buyer, &say("retry")).await;
	for ws in [&mut buyer, &mut seller] {
		match next_frame(ws).await {
			ServerFrame::Message { content, .. } => assert_eq!(content, "retry"),
			other => panic!("expected message, got {other:?}"),
		}
	}
	let history = state.messages.history(chat).await.unwrap();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].message.content, "retry");
	assert_eq!(state.chat_rooms.connection_count(&chat), 2);
}

#[tokio::test]
async fn message_for_another_chat_is_a_protocol_violation() {
	let (_backend, state) = seeded_state().await;
	let (mut buyer, mut seller, chat) = buyer_and_seller(&state).await;

	send(
		&mut buyer,
		&ClientFrame::Message {
			content: "wrong room".to_string(),
			chat_id: Some(ChatId(chat.get() + 100)),
		},
	)
	.await;
	assert_eq!(error_code(&next_frame(&mut buyer).await), "PROTOCOL_VIOLATION");
	assert_silent(&mut seller).await;
	assert!(state.messages.history(chat).await.unwrap().is_empty());
}

#[tokio::test]
async fn unrecognized_frame_kinds_are_ignored() {
	let (_backend, state) = seeded_state().await;
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?token={}", buyer_token())).await;
	let (chat, _) = expect_joined(&mut ws, BUYER).await;
	wait_members(&state, chat, 1).await;

	send_raw(&mut ws, r#"{"type":"read_receipt","message_id":1}"#).await;
	send(&mut ws, &ClientFrame::Auth { token: buyer_token() }).await;
	send(&mut ws, &say("after noise")).await;

	match next_frame(&mut ws).await {
		ServerFrame::Message { content, .. } => assert_eq!(content, "after noise"),
		other => panic!("expected message, got {other:?}"),
	}
}

#[tokio::test]
async fn typing_reaches_only_the_other_participant() {
	let (_backend, state) = seeded_state().await;
	let (mut buyer, mut seller, chat) = buyer_and_seller(&state).await;

	send(&mut buyer, &ClientFrame::Typing { chat_id: None }).await;
	match next_frame(&mut seller).await {
		ServerFrame::Typing {
			sender_id,
			chat_id,
			data,
			..
		} => {
			assert_eq!(sender_id, BUYER);
			assert_eq!(chat_id, Some(chat));
			assert_eq!(data.sender_name, "bea");
		}
		other => panic!("expected typing, got {other:?}"),
	}
	assert_silent(&mut buyer).await;
	assert!(state.messages.history(chat).await.unwrap().is_empty());
}

#[tokio::test]
async fn community_messages_fan_out_without_persistence() {
	let (_backend, state) = seeded_state().await;
	let mut bea = connect(&state, &format!("/ws/community?token={}", buyer_token())).await;
	let mut sam = connect(&state, &format!("/ws/community?token={}", seller_token())).await;
	for ws in [&mut bea, &mut sam] {
		assert!(matches!(next_frame(ws).await, ServerFrame::ConnectionSuccess { .. }));
	}
	wait_until(|| state.community.connection_count(&CommunityRoom) == 2).await;

	send(&mut sam, &say("new arrivals on the shelf")).await;
	for ws in [&mut bea, &mut sam] {
		match next_frame(ws).await {
			ServerFrame::Message {
				content,
				sender_id,
				chat_id,
				data,
				..
			} => {
				assert_eq!(content, "new arrivals on the shelf");
				assert_eq!(sender_id, SELLER);
				assert_eq!(chat_id, None);
				assert_eq!(data.message_id, None);
				assert_eq!(data.sender_name, "sam");
			}
			other => panic!("expected message, got {other:?}"),
		}
	}

	assert!(state.sessions.sessions_for_user(SELLER, Role::Seller).await.unwrap().is_empty());
	assert_eq!(state.chat_rooms.room_count(), 0);
}

#[tokio::test]
async fn disconnect_leaves_the_room() {
	let (_backend, state) = seeded_state().await;
	let mut ws = connect(&state, &format!("/ws/chat/{BOOK}?token={}", buyer_token())).await;
	let (chat, _) = expect_joined(&mut ws, BUYER).await;
	wait_members(&state, chat, 1).await;

	drop(ws);
	wait_members(&state, chat, 0).await;
	assert_eq!(state.chat_rooms.room_count(), 0);
}

#[tokio::test]
async fn existing_chat_can_be_reopened_by_id_by_participants_only() {
	let (_backend, state) = seeded_state().await;
	let chat = state
		.sessions
		.resolve_or_create(BOOK, BUYER, Role::Buyer, None)
		.await
		.unwrap()
		.session
		.id;

	let mut seller = connect(&state, &format!("/ws/chat?chat_id={chat}&token={}", seller_token())).await;
	let (joined, _) = expect_joined(&mut seller, SELLER).await;
	assert_eq!(joined, chat);

	let stranger = token_for(OTHER_BUYER, "ben", Role::Buyer);
	let mut ws = connect(&state, &format!("/ws/chat?chat_id={chat}&token={stranger}")).await;
	assert!(matches!(next_frame(&mut ws).await, ServerFrame::ConnectionSuccess { .. }));
	assert_eq!(error_code(&next_frame(&mut ws).await), "NOT_AUTHORIZED_FOR_BOOK");
	expect_closed(&mut ws).await;

	let mut ws = connect(&state, &format!("/ws/chat?chat_id=9999&token={}", buyer_token())).await;
	assert!(matches!(next_frame(&mut ws).await, ServerFrame::ConnectionSuccess { .. }));
	assert_eq!(error_code(&next_frame(&mut ws).await), "INVALID_SESSION");
	expect_closed(&mut ws).await;
}

fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
	pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn target_parsing_covers_every_route() {
	assert_eq!(parse_target("/ws/community", &query(&[])).unwrap(), ConnectTarget::Community);
	assert_eq!(
		parse_target("/ws/chat/42/", &query(&[("buyer_id", "7")])).unwrap(),
		ConnectTarget::Chat(ChatTarget::Book {
			book_id: BookId(42),
			buyer_id: Some(UserId(7)),
			seller_hint: None,
		})
	);
	assert_eq!(
		parse_target("/ws/chat", &query(&[("chat_id", "5"), ("book_id", "42")])).unwrap(),
		ConnectTarget::Chat(ChatTarget::Existing(ChatId(5)))
	);
	assert_eq!(
		parse_target("/ws/chat", &query(&[("book_id", "42"), ("seller_id", "3")])).unwrap(),
		ConnectTarget::Chat(ChatTarget::Book {
			book_id: BookId(42),
			buyer_id: None,
			seller_hint: Some(UserId(3)),
		})
	);

	let err = parse_target("/ws/chat/42", &query(&[("buyer_id", "x")])).unwrap_err();
	assert_eq!(err.status, StatusCode::BAD_REQUEST);
	let err = parse_target("/ws/chat/0", &query(&[])).unwrap_err();
	assert_eq!(err.status, StatusCode::BAD_REQUEST);
	let err = parse_target("/ws/chat/42/extra", &query(&[])).unwrap_err();
	assert_eq!(err.status, StatusCode::NOT_FOUND);
}

proptest! {
	#[test]
	fn any_positive_book_id_in_the_path_routes_to_that_book(id in 1i64..i64::MAX) {
		let target = parse_target(&format!("/ws/chat/{id}"), &HashMap::new()).unwrap();
		prop_assert_eq!(
			target,
			ConnectTarget::Chat(ChatTarget::Book {
				book_id: BookId(id),
				buyer_id: None,
				seller_hint: None,
			})
		);
	}
}
