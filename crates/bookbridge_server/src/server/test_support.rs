#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::bail;
use bookbridge_domain::{BookId, ChatId, Role, UserId};
use tokio::time::timeout;

use crate::server::auth::{AuthClaims, issue_token};
use crate::server::messages::DEFAULT_MAX_MESSAGE_CHARS;
use crate::server::state::ChatState;
use crate::server::store::{
	ChatBackend, ChatSession, InMemoryChatBackend, InsertSession, Message, SessionSummary, SideFilter, StoredMessage,
};

pub const SECRET: &str = "test-signing-secret";

pub const SELLER: UserId = UserId(3);
pub const BUYER: UserId = UserId(7);
pub const OTHER_BUYER: UserId = UserId(8);
pub const OTHER_SELLER: UserId = UserId(9);
pub const HYBRID: UserId = UserId(11);

pub const BOOK: BookId = BookId(42);
pub const OTHER_BOOK: BookId = BookId(43);
pub const HYBRID_BOOK: BookId = BookId(44);

/// Opt-in test logging: `BOOKBRIDGE_TEST_LOG=debug cargo test`.
pub fn init_test_tracing() {
	if let Ok(filter) = std::env::var("BOOKBRIDGE_TEST_LOG") {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
			.with_test_writer()
			.try_init();
	}
}

/// Marketplace with two sellers, two buyers and one account that both buys and sells.
pub async fn seeded_backend() -> Arc<InMemoryChatBackend> {
	init_test_tracing();

	let backend = Arc::new(InMemoryChatBackend::default());
	backend.add_user(SELLER, "sam").await;
	backend.add_user(BUYER, "bea").await;
	backend.add_user(OTHER_BUYER, "ben").await;
	backend.add_user(OTHER_SELLER, "sol").await;
	backend.add_user(HYBRID, "hal").await;
	backend.add_book(BOOK, SELLER, "Dune").await;
	backend.add_book(OTHER_BOOK, OTHER_SELLER, "Emma").await;
	backend.add_book(HYBRID_BOOK, HYBRID, "Ulysses").await;
	backend
}

pub async fn seeded_state() -> (Arc<InMemoryChatBackend>, ChatState) {
	let backend = seeded_backend().await;
	let state = ChatState::new(backend.clone(), DEFAULT_MAX_MESSAGE_CHARS);
	(backend, state)
}

/// Seeded backend whose history reads and message writes can be made to fail.
pub struct FlakyBackend {
	inner: Arc<InMemoryChatBackend>,
	fail_history: AtomicBool,
	fail_appends: AtomicBool,
}

impl FlakyBackend {
	pub fn set_fail_history(&self, fail: bool) {
		self.fail_history.store(fail, Ordering::SeqCst);
	}

	pub fn set_fail_appends(&self, fail: bool) {
		self.fail_appends.store(fail, Ordering::SeqCst);
	}
}

#[async_trait::async_trait]
impl ChatBackend for FlakyBackend {
	async fn book_seller(&self, book: BookId) -> anyhow::Result<Option<UserId>> {
		self.inner.book_seller(book).await
	}

	async fn username(&self, user: UserId) -> anyhow::Result<Option<String>> {
		self.inner.username(user).await
	}

	async fn find_session(&self, book: BookId, buyer: UserId, seller: UserId) -> anyhow::Result<Option<ChatSession>> {
		self.inner.find_session(book, buyer, seller).await
	}

	async fn session_by_id(&self, chat: ChatId) -> anyhow::Result<Option<ChatSession>> {
		self.inner.session_by_id(chat).await
	}

	async fn insert_session(&self, book: BookId, buyer: UserId, seller: UserId) -> anyhow::Result<InsertSession> {
		self.inner.insert_session(book, buyer, seller).await
	}

	async fn insert_message(&self, chat: ChatId, sender: UserId, content: &str) -> anyhow::Result<Option<Message>> {
		if self.fail_appends.load(Ordering::SeqCst) {
			bail!("database is locked");
		}
		self.inner.insert_message(chat, sender, content).await
	}

	async fn messages(&self, chat: ChatId) -> anyhow::Result<Vec<StoredMessage>> {
		if self.fail_history.load(Ordering::SeqCst) {
			bail!("connection reset while reading messages");
		}
		self.inner.messages(chat).await
	}

	async fn sessions_for_user(&self, user: UserId, sides: SideFilter) -> anyhow::Result<Vec<SessionSummary>> {
		self.inner.sessions_for_user(user, sides).await
	}
}

pub async fn flaky_state() -> (Arc<FlakyBackend>, ChatState) {
	let backend = Arc::new(FlakyBackend {
		inner: seeded_backend().await,
		fail_history: AtomicBool::new(false),
		fail_appends: AtomicBool::new(false),
	});
	let state = ChatState::new(backend.clone(), DEFAULT_MAX_MESSAGE_CHARS);
	(backend, state)
}

pub fn token_for(user: UserId, username: &str, role: Role) -> String {
	issue_token(&AuthClaims::new(user, username, role, 3600), SECRET).expect("issue token")
}

/// Polls `cond` until it holds; panics after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
	timeout(Duration::from_secs(2), async {
		while !cond() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("condition not reached within timeout");
}
