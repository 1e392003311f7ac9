#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use bookbridge_domain::{BookId, ChatId, MessageId, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// One buyer/seller conversation about one book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
	pub id: ChatId,
	pub book_id: BookId,
	pub buyer_id: UserId,
	pub seller_id: UserId,
	pub created_at_ms: i64,
}

impl ChatSession {
	pub fn is_participant(&self, user: UserId) -> bool {
		self.buyer_id == user || self.seller_id == user
	}
}

/// One persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub id: MessageId,
	pub chat_id: ChatId,
	pub sender_id: UserId,
	pub content: String,
	pub created_at_ms: i64,
}

/// A message joined with its sender's display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub message: Message,
	pub sender_name: String,
}

/// Listing row for a user's chat overview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
	pub session: ChatSession,
	pub book_title: String,
	pub buyer_name: String,
	pub seller_name: String,
	pub last_message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertSession {
	Created(ChatSession),
	/// Another writer inserted the same (book, buyer, seller) first.
	Conflict,
}

/// Which side(s) of a session a listing should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideFilter {
	pub as_buyer: bool,
	pub as_seller: bool,
}

const UNKNOWN_USER: &str = "unknown";

#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
	/// Seller of a book, `None` when the book does not exist.
	async fn book_seller(&self, book: BookId) -> anyhow::Result<Option<UserId>>;

	async fn username(&self, user: UserId) -> anyhow::Result<Option<String>>;

	async fn find_session(&self, book: BookId, buyer: UserId, seller: UserId) -> anyhow::Result<Option<ChatSession>>;

	async fn session_by_id(&self, chat: ChatId) -> anyhow::Result<Option<ChatSession>>;

	async fn insert_session(&self, book: BookId, buyer: UserId, seller: UserId) -> anyhow::Result<InsertSession>;

	/// Appends atomically; `None` when the chat does not exist.
	async fn insert_message(&self, chat: ChatId, sender: UserId, content: &str) -> anyhow::Result<Option<Message>>;

	/// Messages of a chat ordered by `(created_at, id)` ascending.
	async fn messages(&self, chat: ChatId) -> anyhow::Result<Vec<StoredMessage>>;

	/// Sessions the user takes part in, newest first.
	async fn sessions_for_user(&self, user: UserId, sides: SideFilter) -> anyhow::Result<Vec<SessionSummary>>;

	async fn ping(&self) -> anyhow::Result<()> {
		Ok(())
	}
}

#[derive(Debug, Default)]
struct MemoryState {
	users: HashMap<UserId, String>,
	books: HashMap<BookId, (UserId, String)>,
	sessions: Vec<ChatSession>,
	messages: HashMap<ChatId, Vec<Message>>,
	next_chat_id: i64,
	next_message_id: i64,
}

impl MemoryState {
	fn name_of(&self, user: UserId) -> String {
		self.users.get(&user).cloned().unwrap_or_else(|| UNKNOWN_USER.to_string())
	}
}

/// Process-local backend for tests and ephemeral deployments.
///
/// Users and books are owned by collaborators; seed them with [`Self::add_user`]
/// and [`Self::add_book`].
#[derive(Default)]
pub struct InMemoryChatBackend {
	inner: Mutex<MemoryState>,
}

impl InMemoryChatBackend {
	pub async fn add_user(&self, id: UserId, username: impl Into<String>) {
		self.inner.lock().await.users.insert(id, username.into());
	}

	pub async fn add_book(&self, id: BookId, seller: UserId, title: impl Into<String>) {
		self.inner.lock().await.books.insert(id, (seller, title.into()));
	}

	/// Drops a book and everything hanging off it.
	pub async fn remove_book(&self, id: BookId) {
		let mut guard = self.inner.lock().await;
		guard.books.remove(&id);
		let gone: Vec<ChatId> = guard.sessions.iter().filter(|s| s.book_id == id).map(|s| s.id).collect();
		guard.sessions.retain(|s| s.book_id != id);
		for chat in gone {
			guard.messages.remove(&chat);
		}
	}
}

#[async_trait::async_trait]
impl ChatBackend for InMemoryChatBackend {
	async fn book_seller(&self, book: BookId) -> anyhow::Result<Option<UserId>> {
		Ok(self.inner.lock().await.books.get(&book).map(|(seller, _)| *seller))
	}

	async fn username(&self, user: UserId) -> anyhow::Result<Option<String>> {
		Ok(self.inner.lock().await.users.get(&user).cloned())
	}

	async fn find_session(&self, book: BookId, buyer: UserId, seller: UserId) -> anyhow::Result<Option<ChatSession>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.sessions
			.iter()
			.find(|s| s.book_id == book && s.buyer_id == buyer && s.seller_id == seller)
			.cloned())
	}

	async fn session_by_id(&self, chat: ChatId) -> anyhow::Result<Option<ChatSession>> {
		let guard = self.inner.lock().await;
		Ok(guard.sessions.iter().find(|s| s.id == chat).cloned())
	}

	async fn insert_session(&self, book: BookId, buyer: UserId, seller: UserId) -> anyhow::Result<InsertSession> {
		let mut guard = self.inner.lock().await;
		if !guard.books.contains_key(&book) {
			return Err(anyhow!("book {book} does not exist"));
		}
		if guard
			.sessions
			.iter()
			.any(|s| s.book_id == book && s.buyer_id == buyer && s.seller_id == seller)
		{
			return Ok(InsertSession::Conflict);
		}

		guard.next_chat_id += 1;
		let session = ChatSession {
			id: ChatId(guard.next_chat_id),
			book_id: book,
			buyer_id: buyer,
			seller_id: seller,
			created_at_ms: unix_ms_now(),
		};
		guard.sessions.push(session.clone());
		Ok(InsertSession::Created(session))
	}

	async fn insert_message(&self, chat: ChatId, sender: UserId, content: &str) -> anyhow::Result<Option<Message>> {
		let mut guard = self.inner.lock().await;
		if !guard.sessions.iter().any(|s| s.id == chat) {
			return Ok(None);
		}

		guard.next_message_id += 1;
		let message = Message {
			id: MessageId(guard.next_message_id),
			chat_id: chat,
			sender_id: sender,
			content: content.to_string(),
			created_at_ms: unix_ms_now(),
		};
		guard.messages.entry(chat).or_default().push(message.clone());
		Ok(Some(message))
	}

	async fn messages(&self, chat: ChatId) -> anyhow::Result<Vec<StoredMessage>> {
		let guard = self.inner.lock().await;
		let mut out: Vec<StoredMessage> = guard
			.messages
			.get(&chat)
			.map(|msgs| {
				msgs.iter()
					.map(|m| StoredMessage {
						sender_name: guard.name_of(m.sender_id),
						message: m.clone(),
					})
					.collect()
			})
			.unwrap_or_default();
		out.sort_by_key(|m| (m.message.created_at_ms, m.message.id));
		Ok(out)
	}

	async fn sessions_for_user(&self, user: UserId, sides: SideFilter) -> anyhow::Result<Vec<SessionSummary>> {
		let guard = self.inner.lock().await;
		let mut out: Vec<SessionSummary> = guard
			.sessions
			.iter()
			.filter(|s| (sides.as_buyer && s.buyer_id == user) || (sides.as_seller && s.seller_id == user))
			.map(|s| SessionSummary {
				session: s.clone(),
				book_title: guard.books.get(&s.book_id).map(|(_, t)| t.clone()).unwrap_or_default(),
				buyer_name: guard.name_of(s.buyer_id),
				seller_name: guard.name_of(s.seller_id),
				last_message: guard
					.messages
					.get(&s.id)
					.and_then(|msgs| msgs.iter().max_by_key(|m| (m.created_at_ms, m.id)).cloned()),
			})
			.collect();
		out.sort_by(|a, b| {
			(b.session.created_at_ms, b.session.id).cmp(&(a.session.created_at_ms, a.session.id))
		});
		Ok(out)
	}
}

/// SQL-backed store (sqlite or postgres) sharing the marketplace database.
#[derive(Clone)]
pub struct SqlChatBackend {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type SessionRow = (i64, i64, i64, i64, i64);
type MessageRow = (i64, i64, i64, String, i64);
type StoredMessageRow = (i64, i64, i64, String, i64, Option<String>);
type SummaryRow = (i64, i64, i64, i64, i64, Option<String>, Option<String>, Option<String>);

fn session_from_row((id, book, buyer, seller, created): SessionRow) -> ChatSession {
	ChatSession {
		id: ChatId(id),
		book_id: BookId(book),
		buyer_id: UserId(buyer),
		seller_id: UserId(seller),
		created_at_ms: created,
	}
}

fn message_from_row((id, chat, sender, content, created): MessageRow) -> Message {
	Message {
		id: MessageId(id),
		chat_id: ChatId(chat),
		sender_id: UserId(sender),
		content,
		created_at_ms: created,
	}
}

fn stored_from_row((id, chat, sender, content, created, name): StoredMessageRow) -> StoredMessage {
	StoredMessage {
		message: message_from_row((id, chat, sender, content, created)),
		sender_name: name.unwrap_or_else(|| UNKNOWN_USER.to_string()),
	}
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
	matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// Postgres ids may be SERIAL (int4) in pre-existing schemas; every selected id is widened.
const PG_SESSION_COLUMNS: &str = "id::BIGINT, book_id::BIGINT, buyer_id::BIGINT, seller_id::BIGINT, \
	(EXTRACT(EPOCH FROM created_at) * 1000)::BIGINT";
const PG_MESSAGE_COLUMNS: &str =
	"id::BIGINT, chat_id::BIGINT, sender_id::BIGINT, content, (EXTRACT(EPOCH FROM created_at) * 1000)::BIGINT";

impl SqlChatBackend {
	pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			Self::from_sqlite(pool).await
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Wraps an existing sqlite pool and runs migrations on it.
	pub async fn from_sqlite(pool: sqlx::SqlitePool) -> anyhow::Result<Self> {
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;
		Ok(Self {
			backend: SqlBackend::Sqlite(pool),
		})
	}

	async fn last_message(&self, chat: ChatId) -> anyhow::Result<Option<Message>> {
		let row: Option<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, chat_id, sender_id, content, created_at FROM messages \
				WHERE chat_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
			)
			.bind(chat.get())
			.fetch_optional(pool)
			.await
			.context("select last message (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {PG_MESSAGE_COLUMNS} FROM messages \
				WHERE chat_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1"
			))
			.bind(chat.get())
			.fetch_optional(pool)
			.await
			.context("select last message (postgres)")?,
		};
		Ok(row.map(message_from_row))
	}
}

#[async_trait::async_trait]
impl ChatBackend for SqlChatBackend {
	async fn book_seller(&self, book: BookId) -> anyhow::Result<Option<UserId>> {
		let row: Option<(Option<i64>,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT seller_id FROM books WHERE id = ?")
				.bind(book.get())
				.fetch_optional(pool)
				.await
				.context("select book seller (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT seller_id::BIGINT FROM books WHERE id = $1")
				.bind(book.get())
				.fetch_optional(pool)
				.await
				.context("select book seller (postgres)")?,
		};
		Ok(row.and_then(|(seller,)| seller).map(UserId))
	}

	async fn username(&self, user: UserId) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT username FROM users WHERE id = ?")
				.bind(user.get())
				.fetch_optional(pool)
				.await
				.context("select username (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT username FROM users WHERE id = $1")
				.bind(user.get())
				.fetch_optional(pool)
				.await
				.context("select username (postgres)")?,
		};
		Ok(row.map(|(name,)| name))
	}

	async fn find_session(&self, book: BookId, buyer: UserId, seller: UserId) -> anyhow::Result<Option<ChatSession>> {
		let row: Option<SessionRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, book_id, buyer_id, seller_id, created_at FROM chats \
				WHERE book_id = ? AND buyer_id = ? AND seller_id = ?",
			)
			.bind(book.get())
			.bind(buyer.get())
			.bind(seller.get())
			.fetch_optional(pool)
			.await
			.context("select session (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {PG_SESSION_COLUMNS} FROM chats WHERE book_id = $1 AND buyer_id = $2 AND seller_id = $3"
			))
			.bind(book.get())
			.bind(buyer.get())
			.bind(seller.get())
			.fetch_optional(pool)
			.await
			.context("select session (postgres)")?,
		};
		Ok(row.map(session_from_row))
	}

	async fn session_by_id(&self, chat: ChatId) -> anyhow::Result<Option<ChatSession>> {
		let row: Option<SessionRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, book_id, buyer_id, seller_id, created_at FROM chats WHERE id = ?")
					.bind(chat.get())
					.fetch_optional(pool)
					.await
					.context("select session by id (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(&format!("SELECT {PG_SESSION_COLUMNS} FROM chats WHERE id = $1"))
					.bind(chat.get())
					.fetch_optional(pool)
					.await
					.context("select session by id (postgres)")?
			}
		};
		Ok(row.map(session_from_row))
	}

	async fn insert_session(&self, book: BookId, buyer: UserId, seller: UserId) -> anyhow::Result<InsertSession> {
		let inserted: Result<Option<SessionRow>, sqlx::Error> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(
					"INSERT INTO chats (book_id, buyer_id, seller_id, created_at) VALUES (?, ?, ?, ?) \
					ON CONFLICT (book_id, buyer_id, seller_id) DO NOTHING \
					RETURNING id, book_id, buyer_id, seller_id, created_at",
				)
				.bind(book.get())
				.bind(buyer.get())
				.bind(seller.get())
				.bind(unix_ms_now())
				.fetch_optional(pool)
				.await
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(&format!(
					"INSERT INTO chats (book_id, buyer_id, seller_id) VALUES ($1, $2, $3) \
					ON CONFLICT (book_id, buyer_id, seller_id) DO NOTHING \
					RETURNING {PG_SESSION_COLUMNS}"
				))
				.bind(book.get())
				.bind(buyer.get())
				.bind(seller.get())
				.fetch_optional(pool)
				.await
			}
		};

		match inserted {
			Ok(Some(row)) => Ok(InsertSession::Created(session_from_row(row))),
			Ok(None) => Ok(InsertSession::Conflict),
			Err(e) if is_unique_violation(&e) => Ok(InsertSession::Conflict),
			Err(e) => Err(anyhow::Error::new(e).context("insert session")),
		}
	}

	async fn insert_message(&self, chat: ChatId, sender: UserId, content: &str) -> anyhow::Result<Option<Message>> {
		let row: Option<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO messages (chat_id, sender_id, content, created_at) \
				SELECT ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM chats WHERE id = ?) \
				RETURNING id, chat_id, sender_id, content, created_at",
			)
			.bind(chat.get())
			.bind(sender.get())
			.bind(content)
			.bind(unix_ms_now())
			.bind(chat.get())
			.fetch_optional(pool)
			.await
			.context("insert message (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"INSERT INTO messages (chat_id, sender_id, content) \
				SELECT $1, $2, $3 WHERE EXISTS (SELECT 1 FROM chats WHERE id = $1) \
				RETURNING {PG_MESSAGE_COLUMNS}"
			))
			.bind(chat.get())
			.bind(sender.get())
			.bind(content)
			.fetch_optional(pool)
			.await
			.context("insert message (postgres)")?,
		};
		Ok(row.map(message_from_row))
	}

	async fn messages(&self, chat: ChatId) -> anyhow::Result<Vec<StoredMessage>> {
		let rows: Vec<StoredMessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT m.id, m.chat_id, m.sender_id, m.content, m.created_at, u.username \
				FROM messages m LEFT JOIN users u ON u.id = m.sender_id \
				WHERE m.chat_id = ? ORDER BY m.created_at ASC, m.id ASC",
			)
			.bind(chat.get())
			.fetch_all(pool)
			.await
			.context("select messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT m.id::BIGINT, m.chat_id::BIGINT, m.sender_id::BIGINT, m.content, \
				(EXTRACT(EPOCH FROM m.created_at) * 1000)::BIGINT, u.username::TEXT \
				FROM messages m LEFT JOIN users u ON u.id = m.sender_id \
				WHERE m.chat_id = $1 ORDER BY m.created_at ASC, m.id ASC",
			)
			.bind(chat.get())
			.fetch_all(pool)
			.await
			.context("select messages (postgres)")?,
		};
		Ok(rows.into_iter().map(stored_from_row).collect())
	}

	async fn sessions_for_user(&self, user: UserId, sides: SideFilter) -> anyhow::Result<Vec<SessionSummary>> {
		let rows: Vec<SummaryRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT c.id, c.book_id, c.buyer_id, c.seller_id, c.created_at, b.title, ub.username, us.username \
				FROM chats c \
				LEFT JOIN books b ON b.id = c.book_id \
				LEFT JOIN users ub ON ub.id = c.buyer_id \
				LEFT JOIN users us ON us.id = c.seller_id \
				WHERE (? AND c.buyer_id = ?) OR (? AND c.seller_id = ?) \
				ORDER BY c.created_at DESC, c.id DESC",
			)
			.bind(sides.as_buyer)
			.bind(user.get())
			.bind(sides.as_seller)
			.bind(user.get())
			.fetch_all(pool)
			.await
			.context("select sessions for user (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT c.id::BIGINT, c.book_id::BIGINT, c.buyer_id::BIGINT, c.seller_id::BIGINT, \
				(EXTRACT(EPOCH FROM c.created_at) * 1000)::BIGINT, b.title::TEXT, ub.username::TEXT, us.username::TEXT \
				FROM chats c \
				LEFT JOIN books b ON b.id = c.book_id \
				LEFT JOIN users ub ON ub.id = c.buyer_id \
				LEFT JOIN users us ON us.id = c.seller_id \
				WHERE ($2 AND c.buyer_id = $1) OR ($3 AND c.seller_id = $1) \
				ORDER BY c.created_at DESC, c.id DESC",
			)
			.bind(user.get())
			.bind(sides.as_buyer)
			.bind(sides.as_seller)
			.fetch_all(pool)
			.await
			.context("select sessions for user (postgres)")?,
		};

		let mut out = Vec::with_capacity(rows.len());
		for (id, book, buyer, seller, created, title, buyer_name, seller_name) in rows {
			let session = session_from_row((id, book, buyer, seller, created));
			let last_message = self.last_message(session.id).await?;
			out.push(SessionSummary {
				session,
				book_title: title.unwrap_or_default(),
				buyer_name: buyer_name.unwrap_or_else(|| UNKNOWN_USER.to_string()),
				seller_name: seller_name.unwrap_or_else(|| UNKNOWN_USER.to_string()),
				last_message,
			});
		}
		Ok(out)
	}

	async fn ping(&self) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("SELECT 1").execute(pool).await.context("ping sqlite")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("SELECT 1").execute(pool).await.context("ping postgres")?;
			}
		}
		Ok(())
	}
}
