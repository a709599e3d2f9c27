use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{bad_request, forbidden, not_found};
use crate::models::{
    Attachment, Chat, ChatConfig, GenerationStatus, ImageGeneration, MessageMetadata, Role,
    SharedChat, SharedChatData, UiMessage, User,
};

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    image TEXT,
    password_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL -- Unix millis
);

CREATE TABLE IF NOT EXISTS sessions (
    token TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY NOT NULL, -- client generated
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    is_branch INTEGER NOT NULL DEFAULT 0,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    is_shared INTEGER NOT NULL DEFAULT 0,
    parent_chat_id TEXT, -- not a foreign key: branches outlive their parent
    active_stream_id TEXT,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_chats_user_id ON chats(user_id);
CREATE INDEX IF NOT EXISTS idx_chats_parent_chat_id ON chats(parent_chat_id);

CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT, -- display order
    id TEXT NOT NULL UNIQUE,
    chat_id TEXT NOT NULL,
    role TEXT NOT NULL, -- 'system', 'user' or 'assistant'
    text_part TEXT NOT NULL, -- text parts joined, for search
    parts TEXT NOT NULL, -- JSON array
    metadata TEXT, -- JSON object
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id);

CREATE TABLE IF NOT EXISTS message_files (
    message_id TEXT NOT NULL,
    url TEXT NOT NULL,
    PRIMARY KEY (message_id, url),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_message_files_url ON message_files(url);

CREATE TABLE IF NOT EXISTS attachments (
    storage_id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    url TEXT NOT NULL UNIQUE,
    media_type TEXT NOT NULL,
    filename TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_attachments_user_id ON attachments(user_id);

CREATE TABLE IF NOT EXISTS image_generations (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    model TEXT NOT NULL,
    aspect_ratio TEXT,
    image_size TEXT,
    reference_image_url TEXT,
    status TEXT NOT NULL,
    result_image_url TEXT,
    result_storage_id TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_image_generations_user ON image_generations(user_id, created_at);

-- Per-user settings (Key-Value)
CREATE TABLE IF NOT EXISTS settings (
    user_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (user_id, key),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);
";

const CHAT_COLUMNS: &str = "id, user_id, title, created_at, updated_at, is_branch, is_pinned, is_shared, parent_chat_id, active_stream_id";

const CHAT_CONFIG_KEY: &str = "chat_config";

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).context("Invalid timestamp")
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: String,
    user_id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
    is_branch: bool,
    is_pinned: bool,
    is_shared: bool,
    parent_chat_id: Option<String>,
    active_stream_id: Option<String>,
}

impl TryFrom<ChatRow> for Chat {
    type Error = anyhow::Error;

    fn try_from(row: ChatRow) -> Result<Self> {
        Ok(Chat {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            is_branch: row.is_branch,
            is_pinned: row.is_pinned,
            is_shared: row.is_shared,
            parent_chat_id: row.parent_chat_id,
            active_stream_id: row.active_stream_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    role: String,
    text_part: String,
    parts: String,
    metadata: Option<String>,
}

impl TryFrom<MessageRow> for UiMessage {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let metadata = match row.metadata.as_deref() {
            Some(raw) => Some(
                serde_json::from_str::<MessageMetadata>(raw)
                    .context("Failed to parse message metadata")?,
            ),
            None => None,
        };
        Ok(UiMessage {
            role: Role::parse(&row.role)
                .with_context(|| format!("Unknown role '{}' on message {}", row.role, row.id))?,
            parts: serde_json::from_str(&row.parts).context("Failed to parse message parts")?,
            id: row.id,
            metadata,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    name: String,
    image: Option<String>,
    created_at: i64,
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: row.id,
            email: row.email,
            name: row.name,
            image: row.image,
            created_at: from_millis(row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GenerationRow {
    id: String,
    user_id: String,
    prompt: String,
    model: String,
    aspect_ratio: Option<String>,
    image_size: Option<String>,
    reference_image_url: Option<String>,
    status: String,
    result_image_url: Option<String>,
    result_storage_id: Option<String>,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<GenerationRow> for ImageGeneration {
    type Error = anyhow::Error;

    fn try_from(row: GenerationRow) -> Result<Self> {
        Ok(ImageGeneration {
            status: GenerationStatus::parse(&row.status)
                .with_context(|| format!("Unknown generation status '{}'", row.status))?,
            id: row.id,
            user_id: row.user_id,
            prompt: row.prompt,
            model: row.model,
            aspect_ratio: row.aspect_ratio,
            image_size: row.image_size,
            reference_image_url: row.reference_image_url,
            result_image_url: row.result_image_url,
            result_storage_id: row.result_storage_id,
            error_message: row.error_message,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

/// Escapes LIKE wildcards so user input matches literally.
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

async fn fetch_owned_chat(conn: &mut SqliteConnection, chat_id: &str, user_id: &str) -> Result<Chat> {
    let sql = format!("SELECT {} FROM chats WHERE id = ? AND user_id = ?", CHAT_COLUMNS);
    let row = sqlx::query_as::<_, ChatRow>(&sql)
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch chat from database")?;
    match row {
        Some(row) => row.try_into(),
        None => Err(not_found("Chat not found")),
    }
}

async fn fetch_chat_message_rows(conn: &mut SqliteConnection, chat_id: &str) -> Result<Vec<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(
        "SELECT id, role, text_part, parts, metadata FROM messages WHERE chat_id = ? ORDER BY seq ASC",
    )
    .bind(chat_id)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to fetch messages from database")
}

/// Returns false when a chat with the same id already exists.
async fn insert_chat(conn: &mut SqliteConnection, chat: &Chat) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO chats (id, user_id, title, created_at, updated_at, is_branch, is_pinned, is_shared, parent_chat_id, active_stream_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&chat.id)
    .bind(&chat.user_id)
    .bind(&chat.title)
    .bind(chat.created_at.timestamp_millis())
    .bind(chat.updated_at.timestamp_millis())
    .bind(chat.is_branch)
    .bind(chat.is_pinned)
    .bind(chat.is_shared)
    .bind(&chat.parent_chat_id)
    .bind(&chat.active_stream_id)
    .execute(&mut *conn)
    .await
    .context("Failed to insert chat into database")?;
    Ok(result.rows_affected() == 1)
}

/// Copies message rows (and their file references) into another chat,
/// deriving each new id from the original one.
async fn copy_messages(
    conn: &mut SqliteConnection,
    rows: &[MessageRow],
    target_chat_id: &str,
    id_suffix: &str,
) -> Result<()> {
    for row in rows {
        let new_id = format!("{}{}", row.id, id_suffix);
        sqlx::query(
            "INSERT INTO messages (id, chat_id, role, text_part, parts, metadata) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&new_id)
        .bind(target_chat_id)
        .bind(&row.role)
        .bind(&row.text_part)
        .bind(&row.parts)
        .bind(&row.metadata)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to copy message {}", row.id))?;

        sqlx::query("INSERT INTO message_files (message_id, url) SELECT ?, url FROM message_files WHERE message_id = ?")
            .bind(&new_id)
            .bind(&row.id)
            .execute(&mut *conn)
            .await
            .context("Failed to copy message file references")?;
    }
    Ok(())
}

async fn file_urls_for_messages(conn: &mut SqliteConnection, message_ids: &[String]) -> Result<BTreeSet<String>> {
    let mut urls = BTreeSet::new();
    for id in message_ids {
        let rows: Vec<String> = sqlx::query_scalar("SELECT url FROM message_files WHERE message_id = ?")
            .bind(id)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to fetch message file references")?;
        urls.extend(rows);
    }
    Ok(urls)
}

/// Removes attachment rows whose URL is no longer referenced by any message
/// and returns their storage ids so the blobs can be deleted.
async fn release_unreferenced_attachments(
    conn: &mut SqliteConnection,
    urls: BTreeSet<String>,
) -> Result<Vec<String>> {
    let mut released = Vec::new();
    for url in urls {
        let still_used: Option<i64> = sqlx::query_scalar("SELECT 1 FROM message_files WHERE url = ? LIMIT 1")
            .bind(&url)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to check attachment references")?;
        if still_used.is_some() {
            log::debug!("Attachment {} still referenced, keeping it", url);
            continue;
        }
        let storage_id: Option<String> = sqlx::query_scalar("SELECT storage_id FROM attachments WHERE url = ?")
            .bind(&url)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to look up attachment")?;
        if let Some(storage_id) = storage_id {
            sqlx::query("DELETE FROM attachments WHERE storage_id = ?")
                .bind(&storage_id)
                .execute(&mut *conn)
                .await
                .context("Failed to delete attachment row")?;
            released.push(storage_id);
        }
    }
    Ok(released)
}

async fn delete_chats_of(conn: &mut SqliteConnection, chat_ids: &[String]) -> Result<Vec<String>> {
    let mut message_ids = Vec::new();
    for chat_id in chat_ids {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM messages WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list chat messages")?;
        message_ids.extend(ids);
    }
    let urls = file_urls_for_messages(conn, &message_ids).await?;
    for chat_id in chat_ids {
        // messages and message_files go with the chat (ON DELETE CASCADE)
        sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id)
            .execute(&mut *conn)
            .await
            .context("Failed to delete chat from database")?;
    }
    release_unreferenced_attachments(conn, urls).await
}

#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Connects to the database and runs migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        log::info!("Connecting to database: {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL '{}'", database_url))?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database lives and dies with its single connection.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    // --- Users & sessions ---

    pub async fn create_user(&self, email: &str, name: &str, password_hash: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE email = ?")
            .bind(&email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check for existing user")?;
        if exists.is_some() {
            return Err(bad_request("An account with this email already exists"));
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            email,
            name: name.trim().to_string(),
            image: None,
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO users (id, email, name, image, password_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(&user.id)
            .bind(&user.email)
            .bind(&user.name)
            .bind(&user.image)
            .bind(password_hash)
            .bind(user.created_at.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Failed to insert user into database")?;
        log::info!("Created user {}", user.id);
        Ok(user)
    }

    /// Returns the user and stored password hash for an email, if registered.
    pub async fn find_user_credentials(&self, email: &str) -> Result<Option<(User, String)>> {
        let row: Option<(String, String, String, Option<String>, i64, String)> = sqlx::query_as(
            "SELECT id, email, name, image, created_at, password_hash FROM users WHERE email = ?",
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user credentials")?;

        match row {
            Some((id, email, name, image, created_at, hash)) => {
                let user = UserRow { id, email, name, image, created_at }.try_into()?;
                Ok(Some((user, hash)))
            }
            None => Ok(None),
        }
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT id, email, name, image, created_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;
        row.map(User::try_from).transpose()
    }

    pub async fn create_session(&self, user_id: &str, ttl: Duration) -> Result<String> {
        let token = crate::models::generate_id(None, 48);
        let now = Utc::now();
        sqlx::query("INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
            .bind(&token)
            .bind(user_id)
            .bind(now.timestamp_millis())
            .bind((now + ttl).timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Failed to create session")?;
        log::debug!("Created session for user {}", user_id);
        Ok(token)
    }

    /// Resolves a bearer token; expired sessions resolve to nothing.
    pub async fn user_for_session(&self, token: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.id, u.email, u.name, u.image, u.created_at
            FROM sessions s JOIN users u ON u.id = s.user_id
            WHERE s.token = ? AND s.expires_at > ?
            "#,
        )
        .bind(token)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to resolve session")?;
        row.map(User::try_from).transpose()
    }

    pub async fn delete_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .context("Failed to delete session")?;
        Ok(())
    }

    // --- Chats ---

    /// Fetches the user's chats, most recently updated first.
    pub async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>> {
        log::debug!("Fetching chats for user {}", user_id);
        let sql = format!(
            "SELECT {} FROM chats WHERE user_id = ? ORDER BY updated_at DESC, rowid DESC",
            CHAT_COLUMNS
        );
        let rows = sqlx::query_as::<_, ChatRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch chats from database")?;
        let chats = rows
            .into_iter()
            .map(Chat::try_from)
            .collect::<Result<Vec<Chat>>>()?;
        log::info!("Fetched {} chats", chats.len());
        Ok(chats)
    }

    /// Case-insensitive substring search over titles and message text.
    pub async fn search_chats(&self, user_id: &str, query: &str) -> Result<Vec<Chat>> {
        let pattern = like_pattern(query.trim());
        let sql = format!(
            r#"
            SELECT {} FROM chats
            WHERE user_id = ?
              AND (title LIKE ? ESCAPE '\'
                   OR id IN (SELECT chat_id FROM messages WHERE text_part LIKE ? ESCAPE '\'))
            ORDER BY updated_at DESC, rowid DESC
            "#,
            CHAT_COLUMNS
        );
        let rows = sqlx::query_as::<_, ChatRow>(&sql)
            .bind(user_id)
            .bind(&pattern)
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await
            .context("Failed to search chats")?;
        rows.into_iter().map(Chat::try_from).collect()
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let sql = format!("SELECT {} FROM chats WHERE id = ?", CHAT_COLUMNS);
        let row = sqlx::query_as::<_, ChatRow>(&sql)
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch chat from database")?;
        row.map(Chat::try_from).transpose()
    }

    pub async fn get_owned_chat(&self, chat_id: &str, user_id: &str) -> Result<Chat> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        fetch_owned_chat(&mut conn, chat_id, user_id).await
    }

    pub async fn get_chat_messages(&self, chat_id: &str, user_id: &str) -> Result<Vec<UiMessage>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        fetch_owned_chat(&mut conn, chat_id, user_id).await?;
        let rows = fetch_chat_message_rows(&mut conn, chat_id).await?;
        let messages = rows
            .into_iter()
            .map(UiMessage::try_from)
            .collect::<Result<Vec<_>>>()?;
        log::debug!("Fetched {} messages for chat {}", messages.len(), chat_id);
        Ok(messages)
    }

    /// Creates a new chat titled "New Chat". Repeating the call for a chat the
    /// user already owns returns the existing chat.
    pub async fn create_chat(&self, chat_id: &str, user_id: &str) -> Result<Chat> {
        let now = Utc::now();
        let chat = Chat {
            id: chat_id.to_string(),
            user_id: user_id.to_string(),
            title: "New Chat".to_string(),
            created_at: now,
            updated_at: now,
            is_branch: false,
            is_pinned: false,
            is_shared: false,
            parent_chat_id: None,
            active_stream_id: None,
        };
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        let inserted = insert_chat(&mut conn, &chat).await?;
        drop(conn);
        if inserted {
            log::info!("Created chat {}", chat.id);
            return Ok(chat);
        }

        match self.get_chat(chat_id).await? {
            Some(existing) if existing.user_id == user_id => {
                log::debug!("Chat {} already exists, reusing it", chat_id);
                Ok(existing)
            }
            Some(_) => Err(forbidden("Chat id belongs to another user")),
            None => Err(anyhow!("Chat {} was deleted while being created", chat_id)),
        }
    }

    pub async fn update_chat_title(&self, chat_id: &str, user_id: &str, title: &str) -> Result<()> {
        let result = sqlx::query("UPDATE chats SET title = ? WHERE id = ? AND user_id = ?")
            .bind(title)
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to update chat title in database")?;
        if result.rows_affected() == 0 {
            return Err(not_found("Chat not found"));
        }
        log::info!("Updated title of chat {}", chat_id);
        Ok(())
    }

    /// Renames a chat on behalf of the user; blank titles are rejected.
    pub async fn rename_chat_title(&self, chat_id: &str, user_id: &str, new_title: &str) -> Result<()> {
        let title = new_title.trim();
        if title.is_empty() {
            return Err(bad_request("New title cannot be empty."));
        }
        log::info!("Renaming chat {} to: {}", chat_id, title);
        self.update_chat_title(chat_id, user_id, title).await
    }

    pub async fn pin_chat(&self, chat_id: &str, user_id: &str, is_pinned: bool) -> Result<()> {
        let result = sqlx::query("UPDATE chats SET is_pinned = ? WHERE id = ? AND user_id = ?")
            .bind(is_pinned)
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to update chat pin state")?;
        if result.rows_affected() == 0 {
            return Err(not_found(format!("Chat {} not found", chat_id)));
        }
        Ok(())
    }

    /// Inserts the message, or patches it in place when the id already exists
    /// in this chat. Bumps the chat's `updated_at` either way.
    pub async fn upsert_message(&self, chat_id: &str, user_id: &str, message: &UiMessage) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        fetch_owned_chat(&mut tx, chat_id, user_id).await?;

        let parts_json = serde_json::to_string(&message.parts).context("Failed to serialize parts")?;
        let metadata_json = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize metadata")?;
        let text_part = message.text_part();

        let existing_chat: Option<String> = sqlx::query_scalar("SELECT chat_id FROM messages WHERE id = ?")
            .bind(&message.id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to look up message")?;

        match existing_chat {
            Some(existing) if existing != chat_id => {
                return Err(bad_request(format!(
                    "Message {} belongs to another chat",
                    message.id
                )));
            }
            Some(_) => {
                log::debug!("Patching message {} in chat {}", message.id, chat_id);
                sqlx::query("UPDATE messages SET role = ?, text_part = ?, parts = ?, metadata = ? WHERE id = ?")
                    .bind(message.role.as_str())
                    .bind(&text_part)
                    .bind(&parts_json)
                    .bind(&metadata_json)
                    .bind(&message.id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to update message")?;
            }
            None => {
                log::debug!("Inserting message {} into chat {}", message.id, chat_id);
                sqlx::query(
                    "INSERT INTO messages (id, chat_id, role, text_part, parts, metadata) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&message.id)
                .bind(chat_id)
                .bind(message.role.as_str())
                .bind(&text_part)
                .bind(&parts_json)
                .bind(&metadata_json)
                .execute(&mut *tx)
                .await
                .context("Failed to insert message into database")?;
            }
        }

        sqlx::query("DELETE FROM message_files WHERE message_id = ?")
            .bind(&message.id)
            .execute(&mut *tx)
            .await
            .context("Failed to reset message file references")?;
        for file in message.file_parts() {
            sqlx::query("INSERT OR IGNORE INTO message_files (message_id, url) VALUES (?, ?)")
                .bind(&message.id)
                .bind(&file.url)
                .execute(&mut *tx)
                .await
                .context("Failed to record message file reference")?;
        }

        sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
            .bind(now_millis())
            .bind(chat_id)
            .execute(&mut *tx)
            .await
            .context("Failed to update chat updated_at timestamp")?;

        tx.commit().await.context("Failed to commit message")?;
        log::info!("Saved message {} to chat {}", message.id, chat_id);
        Ok(())
    }

    pub async fn toggle_chat_share(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        let chat = self.get_owned_chat(chat_id, user_id).await?;
        let is_shared = !chat.is_shared;
        sqlx::query("UPDATE chats SET is_shared = ? WHERE id = ?")
            .bind(is_shared)
            .bind(chat_id)
            .execute(&self.pool)
            .await
            .context("Failed to update share state")?;
        log::info!("Chat {} shared: {}", chat_id, is_shared);
        Ok(is_shared)
    }

    /// Read-only view of a shared chat. Anyone may read it; `viewer` only
    /// decides `isOwner`.
    pub async fn get_shared_chat(&self, chat_id: &str, viewer: Option<&str>) -> Result<SharedChat> {
        let chat = match self.get_chat(chat_id).await? {
            Some(chat) if chat.is_shared => chat,
            _ => return Err(not_found("Chat not found or not shared")),
        };
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        let messages = fetch_chat_message_rows(&mut conn, chat_id)
            .await?
            .into_iter()
            .map(UiMessage::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(SharedChat {
            chat_data: SharedChatData {
                is_owner: viewer == Some(chat.user_id.as_str()),
                id: chat.id,
                title: chat.title,
            },
            messages,
        })
    }

    /// Creates a branch holding the parent's history up to and including
    /// `message_id`. Returns the new chat id.
    pub async fn branch_off_from_message(
        &self,
        parent_chat_id: &str,
        message_id: &str,
        user_id: &str,
    ) -> Result<String> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let parent = match fetch_owned_chat(&mut tx, parent_chat_id, user_id).await {
            Ok(chat) => chat,
            Err(_) => return Err(not_found(format!("Chat {} not found", parent_chat_id))),
        };

        let parent_rows = fetch_chat_message_rows(&mut tx, &parent.id).await?;
        let cut = parent_rows
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| not_found(format!("Message {} not found", message_id)))?;

        let branch_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let branch = Chat {
            id: branch_id.clone(),
            user_id: parent.user_id.clone(),
            title: parent.title.clone(),
            created_at: now,
            updated_at: now,
            is_branch: true,
            is_pinned: false,
            is_shared: false,
            parent_chat_id: Some(parent.id.clone()),
            active_stream_id: None,
        };
        if !insert_chat(&mut tx, &branch).await? {
            return Err(anyhow!("Branch id {} already in use", branch_id));
        }
        copy_messages(&mut tx, &parent_rows[..=cut], &branch_id, &format!("-branch-{}", branch_id)).await?;
        tx.commit().await.context("Failed to commit branch")?;

        log::info!(
            "Branched chat {} at message {} into {} ({} messages)",
            parent.id,
            message_id,
            branch_id,
            cut + 1
        );
        Ok(branch_id)
    }

    /// Copies a shared chat, whole, into a new chat owned by `user_id`.
    pub async fn fork_chat(&self, chat_id: &str, new_chat_id: &str, user_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let sql = format!("SELECT {} FROM chats WHERE id = ?", CHAT_COLUMNS);
        let original: Chat = match sqlx::query_as::<_, ChatRow>(&sql)
            .bind(chat_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to fetch chat to fork")?
        {
            Some(row) if row.is_shared => row.try_into()?,
            _ => return Err(not_found("Chat not found or not shared")),
        };

        let now = Utc::now();
        let fork = Chat {
            id: new_chat_id.to_string(),
            user_id: user_id.to_string(),
            title: original.title.clone(),
            created_at: now,
            updated_at: now,
            is_branch: false,
            is_pinned: false,
            is_shared: false,
            parent_chat_id: None,
            active_stream_id: None,
        };
        if !insert_chat(&mut tx, &fork).await? {
            return Err(bad_request(format!("Chat {} already exists", new_chat_id)));
        }
        let rows = fetch_chat_message_rows(&mut tx, &original.id).await?;
        copy_messages(&mut tx, &rows, new_chat_id, &format!("-fork-{}", new_chat_id)).await?;
        tx.commit().await.context("Failed to commit fork")?;

        log::info!("Forked chat {} into {} for user {}", chat_id, new_chat_id, user_id);
        Ok(())
    }

    // --- Deletion ---

    /// Deletes the given messages. All ids must belong to the user's chats or
    /// nothing is deleted. Returns storage ids of attachments that became
    /// unreferenced.
    pub async fn delete_messages(&self, user_id: &str, message_ids: &[String]) -> Result<Vec<String>> {
        log::warn!("Deleting {} messages for user {}", message_ids.len(), user_id);
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for id in message_ids {
            let owned: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM messages m JOIN chats c ON c.id = m.chat_id WHERE m.id = ? AND c.user_id = ?",
            )
            .bind(id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to look up message")?;
            if owned.is_none() {
                return Err(not_found(format!("Message {} not found", id)));
            }
        }

        let urls = file_urls_for_messages(&mut tx, message_ids).await?;
        for id in message_ids {
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to delete message")?;
        }
        let released = release_unreferenced_attachments(&mut tx, urls).await?;
        tx.commit().await.context("Failed to commit message deletion")?;
        Ok(released)
    }

    /// Deletes a chat and its messages. Attachments still referenced by other
    /// chats (branches, forks) are kept.
    pub async fn delete_chat(&self, chat_id: &str, user_id: &str) -> Result<Vec<String>> {
        log::warn!("Deleting chat {}", chat_id);
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        if fetch_owned_chat(&mut tx, chat_id, user_id).await.is_err() {
            return Err(not_found(format!("Chat {} not found", chat_id)));
        }
        let released = delete_chats_of(&mut tx, &[chat_id.to_string()]).await?;
        tx.commit().await.context("Failed to commit chat deletion")?;
        log::info!("Deleted chat {} ({} attachments released)", chat_id, released.len());
        Ok(released)
    }

    pub async fn delete_all_chats(&self, user_id: &str) -> Result<Vec<String>> {
        log::warn!("Deleting all chats for user {}", user_id);
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let chat_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chats WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to list chats")?;
        let released = delete_chats_of(&mut tx, &chat_ids).await?;
        tx.commit().await.context("Failed to commit chat deletion")?;
        Ok(released)
    }

    /// Removes the user and everything they own. Returns every storage id the
    /// user held so the caller can drop the blobs.
    pub async fn delete_account(&self, user_id: &str) -> Result<Vec<String>> {
        log::warn!("Deleting account {}", user_id);
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let chat_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chats WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to list chats")?;
        let mut storage_ids = delete_chats_of(&mut tx, &chat_ids).await?;

        let remaining: Vec<String> = sqlx::query_scalar("SELECT storage_id FROM attachments WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to list attachments")?;
        storage_ids.extend(remaining);

        let generated: Vec<String> = sqlx::query_scalar(
            "SELECT result_storage_id FROM image_generations WHERE user_id = ? AND result_storage_id IS NOT NULL",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to list generated images")?;
        storage_ids.extend(generated);

        // sessions, settings, attachments and generations cascade
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete user")?;
        tx.commit().await.context("Failed to commit account deletion")?;
        Ok(storage_ids)
    }

    // --- Resumable streams ---

    pub async fn set_active_stream_id(&self, chat_id: &str, user_id: &str, stream_id: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE chats SET active_stream_id = ? WHERE id = ? AND user_id = ?")
            .bind(stream_id)
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to update active stream id")?;
        if result.rows_affected() == 0 {
            return Err(not_found("Chat not found"));
        }
        Ok(())
    }

    pub async fn get_active_stream_id(&self, chat_id: &str, user_id: &str) -> Result<Option<String>> {
        Ok(self.get_owned_chat(chat_id, user_id).await?.active_stream_id)
    }

    // --- Attachments ---

    pub async fn insert_attachment(&self, attachment: &Attachment) -> Result<()> {
        sqlx::query(
            "INSERT INTO attachments (storage_id, user_id, url, media_type, filename, size, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attachment.storage_id)
        .bind(&attachment.user_id)
        .bind(&attachment.url)
        .bind(&attachment.media_type)
        .bind(&attachment.filename)
        .bind(attachment.size)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert attachment")?;
        log::info!("Stored attachment {} ({})", attachment.filename, attachment.storage_id);
        Ok(())
    }

    /// Explicit removal of the user's own uploads. Unknown URLs are ignored.
    pub async fn delete_attachments_by_url(&self, user_id: &str, urls: &[String]) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for url in urls {
            let storage_id: Option<String> =
                sqlx::query_scalar("SELECT storage_id FROM attachments WHERE url = ? AND user_id = ?")
                    .bind(url)
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await
                    .context("Failed to look up attachment")?;
            let Some(storage_id) = storage_id else {
                log::warn!("Attachment {} not found for user {}", url, user_id);
                continue;
            };
            sqlx::query("DELETE FROM attachments WHERE storage_id = ?")
                .bind(&storage_id)
                .execute(&self.pool)
                .await
                .context("Failed to delete attachment")?;
            removed.push(storage_id);
        }
        Ok(removed)
    }

    // --- Image generations ---

    pub async fn list_generations(&self, user_id: &str, limit: i64) -> Result<Vec<ImageGeneration>> {
        let rows = sqlx::query_as::<_, GenerationRow>(
            "SELECT * FROM image_generations WHERE user_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch image generations")?;
        rows.into_iter().map(ImageGeneration::try_from).collect()
    }

    /// Inserts a pending generation. A taken id is a bad request.
    pub async fn create_generation(&self, generation: &ImageGeneration) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO image_generations
                (id, user_id, prompt, model, aspect_ratio, image_size, reference_image_url, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&generation.id)
        .bind(&generation.user_id)
        .bind(&generation.prompt)
        .bind(&generation.model)
        .bind(&generation.aspect_ratio)
        .bind(&generation.image_size)
        .bind(&generation.reference_image_url)
        .bind(generation.status.as_str())
        .bind(generation.created_at.timestamp_millis())
        .bind(generation.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert image generation")?;
        if result.rows_affected() == 0 {
            return Err(bad_request("Invalid or duplicate generation id"));
        }
        Ok(())
    }

    pub async fn get_generation(&self, id: &str) -> Result<Option<ImageGeneration>> {
        let row = sqlx::query_as::<_, GenerationRow>("SELECT * FROM image_generations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch image generation")?;
        row.map(ImageGeneration::try_from).transpose()
    }

    pub async fn update_generation_status(&self, id: &str, status: GenerationStatus) -> Result<()> {
        sqlx::query("UPDATE image_generations SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update generation status")?;
        Ok(())
    }

    /// Fails with not found when the generation was deleted meanwhile.
    pub async fn complete_generation(&self, id: &str, result_image_url: &str, result_storage_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE image_generations SET status = 'completed', result_image_url = ?, result_storage_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(result_image_url)
        .bind(result_storage_id)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to complete generation")?;
        if result.rows_affected() == 0 {
            return Err(not_found(format!("Generation {} not found", id)));
        }
        Ok(())
    }

    pub async fn fail_generation(&self, id: &str, error_message: &str) -> Result<()> {
        sqlx::query("UPDATE image_generations SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?")
            .bind(error_message)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark generation as failed")?;
        Ok(())
    }

    /// Deletes the user's generation; returns the blob to remove, if any.
    pub async fn delete_generation(&self, id: &str, user_id: &str) -> Result<Option<String>> {
        let generation = match self.get_generation(id).await? {
            Some(g) if g.user_id == user_id => g,
            _ => return Err(not_found("Generation not found")),
        };
        sqlx::query("DELETE FROM image_generations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete generation")?;
        log::info!("Deleted image generation {}", id);
        Ok(generation.result_storage_id)
    }

    // --- Chat config ---

    pub async fn get_chat_config(&self, user_id: &str) -> Result<ChatConfig> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE user_id = ? AND key = ?")
            .bind(user_id)
            .bind(CHAT_CONFIG_KEY)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch chat config")?;
        match value {
            Some(raw) => serde_json::from_str(&raw).context("Failed to parse stored chat config"),
            None => Ok(ChatConfig::default()),
        }
    }

    pub async fn put_chat_config(&self, user_id: &str, config: &ChatConfig) -> Result<()> {
        let raw = serde_json::to_string(config).context("Failed to serialize chat config")?;
        sqlx::query(
            "INSERT INTO settings (user_id, key, value) VALUES (?, ?, ?) ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(user_id)
        .bind(CHAT_CONFIG_KEY)
        .bind(raw)
        .execute(&self.pool)
        .await
        .context("Failed to save chat config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FilePart, MessagePart};

    async fn storage() -> StorageManager {
        StorageManager::new("sqlite::memory:").await.unwrap()
    }

    async fn user(storage: &StorageManager, email: &str) -> User {
        storage.create_user(email, "Test", "hash").await.unwrap()
    }

    fn text_message(id: &str, role: Role, text: &str) -> UiMessage {
        UiMessage {
            id: id.to_string(),
            role,
            metadata: None,
            parts: vec![MessagePart::text(text)],
        }
    }

    fn file_message(id: &str, url: &str) -> UiMessage {
        UiMessage {
            id: id.to_string(),
            role: Role::User,
            metadata: None,
            parts: vec![
                MessagePart::text("see file"),
                MessagePart::file(FilePart {
                    url: url.to_string(),
                    media_type: "image/png".to_string(),
                    filename: Some("a.png".to_string()),
                    extra: Default::default(),
                }),
            ],
        }
    }

    async fn attachment(storage: &StorageManager, user_id: &str, storage_id: &str, url: &str) {
        storage
            .insert_attachment(&Attachment {
                storage_id: storage_id.to_string(),
                user_id: user_id.to_string(),
                url: url.to_string(),
                media_type: "image/png".to_string(),
                filename: "a.png".to_string(),
                size: 3,
            })
            .await
            .unwrap();
    }

    async fn seeded_chat(storage: &StorageManager, user_id: &str, chat_id: &str) {
        storage.create_chat(chat_id, user_id).await.unwrap();
        for (id, role, text) in [
            ("m1", Role::User, "hello"),
            ("m2", Role::Assistant, "hi there"),
            ("m3", Role::User, "tell me more"),
            ("m4", Role::Assistant, "sure"),
        ] {
            storage
                .upsert_message(chat_id, user_id, &text_message(&format!("{}-{}", chat_id, id), role, text))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn create_chat_defaults_and_idempotency() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        let bob = user(&storage, "bob@example.com").await;

        let chat = storage.create_chat("c1", &alice.id).await.unwrap();
        assert_eq!(chat.title, "New Chat");
        assert!(!chat.is_branch && !chat.is_pinned && !chat.is_shared);

        let again = storage.create_chat("c1", &alice.id).await.unwrap();
        assert_eq!(again.id, "c1");
        let err = storage.create_chat("c1", &bob.id).await.unwrap_err();
        assert!(err.downcast_ref::<crate::error::Forbidden>().is_some());

        let (first, second) = tokio::join!(storage.create_chat("c2", &alice.id), storage.create_chat("c2", &alice.id));
        assert_eq!(first.unwrap().id, second.unwrap().id);
    }

    #[tokio::test]
    async fn messages_keep_insertion_order_and_upsert_patches_in_place() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        seeded_chat(&storage, &alice.id, "c1").await;

        storage
            .upsert_message("c1", &alice.id, &text_message("c1-m2", Role::Assistant, "edited"))
            .await
            .unwrap();
        let messages = storage.get_chat_messages("c1", &alice.id).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["c1-m1", "c1-m2", "c1-m3", "c1-m4"]);
        assert_eq!(messages[1].parts[0].as_text(), Some("edited"));
    }

    #[tokio::test]
    async fn other_users_cannot_read_or_write_a_chat() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        let bob = user(&storage, "bob@example.com").await;
        seeded_chat(&storage, &alice.id, "c1").await;

        let err = storage.get_chat_messages("c1", &bob.id).await.unwrap_err();
        assert!(err.downcast_ref::<crate::error::NotFound>().is_some());
        assert!(storage
            .upsert_message("c1", &bob.id, &text_message("x", Role::User, "hi"))
            .await
            .is_err());
        assert!(storage.pin_chat("c1", &bob.id, true).await.is_err());
    }

    #[tokio::test]
    async fn list_chats_orders_by_latest_update() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        storage.create_chat("old", &alice.id).await.unwrap();
        storage.create_chat("new", &alice.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        storage
            .upsert_message("old", &alice.id, &text_message("o1", Role::User, "bump"))
            .await
            .unwrap();
        let ids: Vec<_> = storage
            .list_chats(&alice.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, ["old", "new"]);
    }

    #[tokio::test]
    async fn branch_copies_history_up_to_message() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        seeded_chat(&storage, &alice.id, "c1").await;
        storage.rename_chat_title("c1", &alice.id, "  Parent  ").await.unwrap();

        let branch_id = storage
            .branch_off_from_message("c1", "c1-m2", &alice.id)
            .await
            .unwrap();
        let branch = storage.get_owned_chat(&branch_id, &alice.id).await.unwrap();
        assert!(branch.is_branch);
        assert_eq!(branch.parent_chat_id.as_deref(), Some("c1"));
        assert_eq!(branch.title, "Parent");

        let messages = storage.get_chat_messages(&branch_id, &alice.id).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(
            ids,
            [
                format!("c1-m1-branch-{}", branch_id),
                format!("c1-m2-branch-{}", branch_id)
            ]
        );
        // parent untouched
        assert_eq!(storage.get_chat_messages("c1", &alice.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn branch_from_unknown_message_fails_without_creating_a_chat() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        seeded_chat(&storage, &alice.id, "c1").await;
        let err = storage
            .branch_off_from_message("c1", "missing", &alice.id)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<crate::error::NotFound>().is_some());
        assert_eq!(storage.list_chats(&alice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fork_requires_shared_chat_and_copies_everything() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        let bob = user(&storage, "bob@example.com").await;
        seeded_chat(&storage, &alice.id, "c1").await;

        assert!(storage.fork_chat("c1", "f1", &bob.id).await.is_err());
        assert!(storage.toggle_chat_share("c1", &alice.id).await.unwrap());

        storage.fork_chat("c1", "f1", &bob.id).await.unwrap();
        let fork = storage.get_owned_chat("f1", &bob.id).await.unwrap();
        assert!(!fork.is_branch && !fork.is_shared);
        let messages = storage.get_chat_messages("f1", &bob.id).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].id, "c1-m4-fork-f1");

        let err = storage.fork_chat("c1", "f1", &bob.id).await.unwrap_err();
        assert!(err.downcast_ref::<crate::error::BadRequest>().is_some());
    }

    #[tokio::test]
    async fn shared_chat_reports_ownership() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        let bob = user(&storage, "bob@example.com").await;
        seeded_chat(&storage, &alice.id, "c1").await;

        assert!(storage.get_shared_chat("c1", None).await.is_err());
        storage.toggle_chat_share("c1", &alice.id).await.unwrap();

        let as_owner = storage.get_shared_chat("c1", Some(&alice.id)).await.unwrap();
        assert!(as_owner.chat_data.is_owner);
        assert_eq!(as_owner.messages.len(), 4);
        assert!(!storage.get_shared_chat("c1", Some(&bob.id)).await.unwrap().chat_data.is_owner);
        assert!(!storage.get_shared_chat("c1", None).await.unwrap().chat_data.is_owner);

        assert!(!storage.toggle_chat_share("c1", &alice.id).await.unwrap());
        assert!(storage.get_shared_chat("c1", None).await.is_err());
    }

    #[tokio::test]
    async fn delete_messages_is_all_or_nothing() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        seeded_chat(&storage, &alice.id, "c1").await;

        let err = storage
            .delete_messages(&alice.id, &["c1-m3".to_string(), "nope".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Message nope not found");
        assert_eq!(storage.get_chat_messages("c1", &alice.id).await.unwrap().len(), 4);

        storage
            .delete_messages(&alice.id, &["c1-m3".to_string(), "c1-m4".to_string()])
            .await
            .unwrap();
        assert_eq!(storage.get_chat_messages("c1", &alice.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn attachments_shared_with_a_branch_survive_parent_deletion() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        storage.create_chat("c1", &alice.id).await.unwrap();
        attachment(&storage, &alice.id, "blob-1", "http://x/api/files/blob-1").await;
        storage
            .upsert_message("c1", &alice.id, &file_message("m1", "http://x/api/files/blob-1"))
            .await
            .unwrap();

        let branch_id = storage.branch_off_from_message("c1", "m1", &alice.id).await.unwrap();
        let released = storage.delete_chat("c1", &alice.id).await.unwrap();
        assert!(released.is_empty());

        let released = storage.delete_chat(&branch_id, &alice.id).await.unwrap();
        assert_eq!(released, ["blob-1"]);
    }

    #[tokio::test]
    async fn delete_message_releases_its_attachment() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        storage.create_chat("c1", &alice.id).await.unwrap();
        attachment(&storage, &alice.id, "blob-1", "http://x/api/files/blob-1").await;
        storage
            .upsert_message("c1", &alice.id, &file_message("m1", "http://x/api/files/blob-1"))
            .await
            .unwrap();
        let released = storage.delete_messages(&alice.id, &["m1".to_string()]).await.unwrap();
        assert_eq!(released, ["blob-1"]);
    }

    #[tokio::test]
    async fn delete_account_removes_user_and_returns_blobs() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        seeded_chat(&storage, &alice.id, "c1").await;
        attachment(&storage, &alice.id, "draft-blob", "http://x/api/files/draft-blob").await;
        let token = storage.create_session(&alice.id, Duration::days(1)).await.unwrap();

        let blobs = storage.delete_account(&alice.id).await.unwrap();
        assert_eq!(blobs, ["draft-blob"]);
        assert!(storage.get_user(&alice.id).await.unwrap().is_none());
        assert!(storage.user_for_session(&token).await.unwrap().is_none());
        assert!(storage.get_chat("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_sessions_do_not_authenticate() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        let live = storage.create_session(&alice.id, Duration::days(1)).await.unwrap();
        let expired = storage.create_session(&alice.id, Duration::days(-1)).await.unwrap();
        assert_eq!(storage.user_for_session(&live).await.unwrap().unwrap().id, alice.id);
        assert!(storage.user_for_session(&expired).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let storage = storage().await;
        user(&storage, "alice@example.com").await;
        let err = storage.create_user("Alice@Example.com ", "A", "h").await.unwrap_err();
        assert!(err.downcast_ref::<crate::error::BadRequest>().is_some());
    }

    #[tokio::test]
    async fn search_matches_title_and_message_text() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        seeded_chat(&storage, &alice.id, "c1").await;
        storage.create_chat("c2", &alice.id).await.unwrap();
        storage.rename_chat_title("c2", &alice.id, "Borrow checker").await.unwrap();

        let by_text: Vec<_> = storage.search_chats(&alice.id, "TELL ME").await.unwrap();
        assert_eq!(by_text.len(), 1);
        assert_eq!(by_text[0].id, "c1");
        let by_title = storage.search_chats(&alice.id, "borrow").await.unwrap();
        assert_eq!(by_title[0].id, "c2");
        assert!(storage.search_chats(&alice.id, "100%").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_stream_id_round_trip() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        storage.create_chat("c1", &alice.id).await.unwrap();
        storage.set_active_stream_id("c1", &alice.id, Some("s1")).await.unwrap();
        assert_eq!(storage.get_active_stream_id("c1", &alice.id).await.unwrap().as_deref(), Some("s1"));
        storage.set_active_stream_id("c1", &alice.id, None).await.unwrap();
        assert_eq!(storage.get_active_stream_id("c1", &alice.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn generation_lifecycle() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        let bob = user(&storage, "bob@example.com").await;
        let now = Utc::now();
        let generation = ImageGeneration {
            id: "g1".into(),
            user_id: alice.id.clone(),
            prompt: "a cat".into(),
            model: "google/gemini-2.5-flash-image".into(),
            aspect_ratio: None,
            image_size: None,
            reference_image_url: None,
            status: GenerationStatus::Pending,
            result_image_url: None,
            result_storage_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        storage.create_generation(&generation).await.unwrap();
        let dup = storage.create_generation(&generation).await.unwrap_err();
        assert!(dup.downcast_ref::<crate::error::BadRequest>().is_some());
        storage.update_generation_status("g1", GenerationStatus::Processing).await.unwrap();
        storage.complete_generation("g1", "http://x/api/files/b.png", "b.png").await.unwrap();

        let listed = storage.list_generations(&alice.id, 50).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, GenerationStatus::Completed);
        assert_eq!(listed[0].result_storage_id.as_deref(), Some("b.png"));

        assert!(storage.delete_generation("g1", &bob.id).await.is_err());
        assert_eq!(storage.delete_generation("g1", &alice.id).await.unwrap().as_deref(), Some("b.png"));
        assert!(storage.get_generation("g1").await.unwrap().is_none());

        let err = storage
            .complete_generation("g1", "http://x/api/files/c.png", "c.png")
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<crate::error::NotFound>().is_some());
    }

    #[tokio::test]
    async fn chat_config_defaults_then_persists() {
        let storage = storage().await;
        let alice = user(&storage, "alice@example.com").await;
        let mut config = storage.get_chat_config(&alice.id).await.unwrap();
        assert_eq!(config, ChatConfig::default());

        config.draft_message_entry = Some(crate::models::DraftMessageEntry {
            message: "half a thought".into(),
            files: vec![],
        });
        storage.put_chat_config(&alice.id, &config).await.unwrap();
        assert_eq!(storage.get_chat_config(&alice.id).await.unwrap(), config);
    }
}
