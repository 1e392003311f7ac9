#![forbid(unsafe_code)]

use bookbridge_domain::{ChatError, ChatId, Role};

use crate::server::messages::MessageStore;
use crate::server::test_support::*;

#[tokio::test]
async fn append_persists_verbatim_and_history_keeps_order() {
	let (_backend, state) = seeded_state().await;
	let chat = state
		.sessions
		.resolve_or_create(BOOK, BUYER, Role::Buyer, None)
		.await
		.unwrap()
		.session
		.id;

	let first = state.messages.append(chat, BUYER, "  Is it still available?  ").await.unwrap();
	let second = state.messages.append(chat, SELLER, "Yes").await.unwrap();
	let third = state.messages.append(chat, BUYER, "Great 📚").await.unwrap();
	assert_eq!(first.content, "  Is it still available?  ");
	assert!(first.id < second.id && second.id < third.id);

	let history = state.messages.history(chat).await.unwrap();
	let ids: Vec<_> = history.iter().map(|m| m.message.id).collect();
	assert_eq!(ids, vec![first.id, second.id, third.id]);
	assert_eq!(history[1].sender_name, "sam");
	assert_eq!(history[2].message.content, "Great 📚");
}

#[tokio::test]
async fn blank_content_is_refused_and_not_stored() {
	let (_backend, state) = seeded_state().await;
	let chat = state
		.sessions
		.resolve_or_create(BOOK, BUYER, Role::Buyer, None)
		.await
		.unwrap()
		.session
		.id;

	assert_eq!(state.messages.append(chat, BUYER, "").await.unwrap_err(), ChatError::EmptyContent);
	assert_eq!(
		state.messages.append(chat, BUYER, " \t\n ").await.unwrap_err(),
		ChatError::EmptyContent
	);
	assert!(state.messages.history(chat).await.unwrap().is_empty());
}

#[tokio::test]
async fn append_to_unknown_chat_is_an_invalid_session() {
	let (_backend, state) = seeded_state().await;

	let err = state.messages.append(ChatId(77), BUYER, "hello").await.unwrap_err();
	assert_eq!(err, ChatError::InvalidSession(ChatId(77)));
	assert!(state.messages.history(ChatId(77)).await.unwrap().is_empty());
}

#[tokio::test]
async fn length_limit_counts_characters() {
	let backend = seeded_backend().await;
	let store = MessageStore::new(backend, 5);

	assert!(store.validate_content("ééééé").is_ok());
	let err = store.validate_content("abcdef").unwrap_err();
	assert!(matches!(err, ChatError::ProtocolViolation(_)), "{err:?}");

	let unlimited = MessageStore::new(seeded_backend().await, 0);
	assert!(unlimited.validate_content(&"x".repeat(100_000)).is_ok());
}

#[tokio::test]
async fn participant_view_flags_own_messages() {
	let (_backend, state) = seeded_state().await;
	let chat = state
		.sessions
		.resolve_or_create(BOOK, BUYER, Role::Buyer, None)
		.await
		.unwrap()
		.session
		.id;
	state.messages.append(chat, BUYER, "offer: 10").await.unwrap();
	state.messages.append(chat, SELLER, "make it 12").await.unwrap();

	let seller_view = state.messages.messages_for_participant(chat, SELLER).await.unwrap();
	let flags: Vec<bool> = seller_view.iter().map(|m| m.is_self_sender).collect();
	assert_eq!(flags, vec![false, true]);

	let err = state.messages.messages_for_participant(chat, OTHER_BUYER).await.unwrap_err();
	assert!(matches!(err, ChatError::NotAuthorizedForBook(_)));

	let err = state.messages.messages_for_participant(ChatId(500), BUYER).await.unwrap_err();
	assert_eq!(err, ChatError::InvalidSession(ChatId(500)));
}

#[tokio::test]
async fn listing_reports_the_latest_message() {
	let (_backend, state) = seeded_state().await;
	let chat = state
		.sessions
		.resolve_or_create(BOOK, BUYER, Role::Buyer, None)
		.await
		.unwrap()
		.session
		.id;
	state.messages.append(chat, BUYER, "first").await.unwrap();
	let last = state.messages.append(chat, SELLER, "second").await.unwrap();

	let summaries = state.sessions.sessions_for_user(BUYER, Role::Buyer).await.unwrap();
	assert_eq!(summaries.len(), 1);
	assert_eq!(summaries[0].last_message.as_ref(), Some(&last));
}

#[tokio::test]
async fn removing_the_book_drops_its_chats_and_messages() {
	let (backend, state) = seeded_state().await;
	let chat = state
		.sessions
		.resolve_or_create(BOOK, BUYER, Role::Buyer, None)
		.await
		.unwrap()
		.session
		.id;
	state.messages.append(chat, BUYER, "hello").await.unwrap();

	backend.remove_book(BOOK).await;

	assert!(state.messages.history(chat).await.unwrap().is_empty());
	assert_eq!(
		state.sessions.open_existing(chat, BUYER).await.unwrap_err(),
		ChatError::InvalidSession(chat)
	);
}
