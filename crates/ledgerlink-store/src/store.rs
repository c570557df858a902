//! Token store trait and backends.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::token::Token;

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

// ============================================================================
// TokenStore Trait
// ============================================================================

/// Persistence for per-connection OAuth tokens.
///
/// Implementations only ever insert. The latest token for a connection is
/// the one with the greatest `issued_at`; ties go to the most recent insert.
#[async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    /// Most recently issued token for `connection`, if any.
    async fn load_latest(&self, connection: &str) -> Result<Option<Token>>;

    /// Persist a new token row for `connection`.
    async fn save(&self, connection: &str, token: &Token) -> Result<()>;

    /// Up to `limit` tokens for `connection`, newest first.
    async fn history(&self, connection: &str, limit: usize) -> Result<Vec<Token>>;
}

/// Shared token store for use across async contexts.
pub type SharedTokenStore = Arc<dyn TokenStore>;

// ============================================================================
// SqliteTokenStore
// ============================================================================

/// SQLite-backed token store.
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTokenStore").finish_non_exhaustive()
    }
}

impl SqliteTokenStore {
    /// Open or create a token database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Path {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        info!("Token store opened at {:?}", path);
        Ok(store)
    }

    /// Create an in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current_version >= SCHEMA_VERSION {
            debug!("Token schema up to date (version {})", current_version);
            return Ok(());
        }

        conn.execute_batch(
            r#"
            -- One row per issued token; rows are never updated
            CREATE TABLE IF NOT EXISTS oauth_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                connection TEXT NOT NULL,
                realm_id TEXT,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                token_type TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                refresh_expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_oauth_tokens_connection_issued
                ON oauth_tokens(connection, issued_at DESC, id DESC);
            "#,
        )?;

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        info!("Token schema created (version {})", SCHEMA_VERSION);
        Ok(())
    }

    fn query_tokens(&self, connection: &str, limit: usize) -> Result<Vec<Token>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            r#"
            SELECT connection, realm_id, access_token, refresh_token, token_type,
                   issued_at, expires_at, refresh_expires_at
            FROM oauth_tokens
            WHERE connection = ?1
            ORDER BY issued_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![connection, limit as i64], |row| {
            Ok(TokenRow {
                connection: row.get(0)?,
                realm_id: row.get(1)?,
                access_token: row.get(2)?,
                refresh_token: row.get(3)?,
                token_type: row.get(4)?,
                issued_at: row.get(5)?,
                expires_at: row.get(6)?,
                refresh_expires_at: row.get(7)?,
            })
        })?;

        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?.into_token()?);
        }
        Ok(tokens)
    }
}

/// Raw column values before timestamp conversion.
struct TokenRow {
    connection: String,
    realm_id: Option<String>,
    access_token: String,
    refresh_token: String,
    token_type: String,
    issued_at: i64,
    expires_at: i64,
    refresh_expires_at: Option<i64>,
}

impl TokenRow {
    fn into_token(self) -> Result<Token> {
        Ok(Token {
            issued_at: from_millis(self.issued_at, "issued_at")?,
            expires_at: from_millis(self.expires_at, "expires_at")?,
            refresh_expires_at: self
                .refresh_expires_at
                .map(|ms| from_millis(ms, "refresh_expires_at"))
                .transpose()?,
            connection: self.connection,
            realm_id: self.realm_id,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type,
        })
    }
}

fn from_millis(ms: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidData(format!("{} out of range: {}", column, ms)))
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn load_latest(&self, connection: &str) -> Result<Option<Token>> {
        let token = self.query_tokens(connection, 1)?.into_iter().next();
        debug!(connection, found = token.is_some(), "Loaded latest token");
        Ok(token)
    }

    async fn save(&self, connection: &str, token: &Token) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO oauth_tokens (
                connection, realm_id, access_token, refresh_token, token_type,
                issued_at, expires_at, refresh_expires_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                connection,
                token.realm_id,
                token.access_token,
                token.refresh_token,
                token.token_type,
                token.issued_at.timestamp_millis(),
                token.expires_at.timestamp_millis(),
                token.refresh_expires_at.map(|at| at.timestamp_millis()),
            ],
        )?;

        debug!(connection, issued_at = %token.issued_at, "Inserted token row");
        Ok(())
    }

    async fn history(&self, connection: &str, limit: usize) -> Result<Vec<Token>> {
        self.query_tokens(connection, limit)
    }
}

// ============================================================================
// MemoryTokenStore
// ============================================================================

/// In-memory token store, used in tests and for throwaway processes.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    rows: RwLock<HashMap<String, Vec<Token>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows stored for a connection.
    pub fn row_count(&self, connection: &str) -> usize {
        self.rows.read().get(connection).map_or(0, Vec::len)
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load_latest(&self, connection: &str) -> Result<Option<Token>> {
        let rows = self.rows.read();
        // max_by_key returns the last maximum, so later inserts win ties
        Ok(rows
            .get(connection)
            .and_then(|tokens| tokens.iter().max_by_key(|t| t.issued_at))
            .cloned())
    }

    async fn save(&self, connection: &str, token: &Token) -> Result<()> {
        let mut token = token.clone();
        token.connection = connection.to_string();
        self.rows
            .write()
            .entry(connection.to_string())
            .or_default()
            .push(token);
        Ok(())
    }

    async fn history(&self, connection: &str, limit: usize) -> Result<Vec<Token>> {
        let rows = self.rows.read();
        let mut tokens: Vec<Token> = rows.get(connection).cloned().unwrap_or_default();
        // Stable sort keeps insertion order among equal timestamps; reverse
        // afterwards so the newest insert comes first.
        tokens.sort_by_key(|t| t.issued_at);
        tokens.reverse();
        tokens.truncate(limit);
        Ok(tokens)
    }
}

// ============================================================================
// Constructors
// ============================================================================

/// Open a shared SQLite token store.
pub fn create_token_store(path: &Path) -> Result<SharedTokenStore> {
    Ok(Arc::new(SqliteTokenStore::open(path)?))
}

/// Create a shared in-memory token store.
pub fn create_memory_token_store() -> SharedTokenStore {
    Arc::new(MemoryTokenStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn token(access: &str, issued_offset_secs: i64) -> Token {
        let issued = t0() + TimeDelta::seconds(issued_offset_secs);
        Token::new(
            "acme",
            access,
            format!("refresh-{}", access),
            issued,
            issued + TimeDelta::seconds(3600),
        )
    }

    async fn exercise_latest_ordering(store: &dyn TokenStore) {
        assert!(store.load_latest("acme").await.unwrap().is_none());

        store.save("acme", &token("second", 10)).await.unwrap();
        store.save("acme", &token("first", 0)).await.unwrap();
        store.save("acme", &token("third", 20)).await.unwrap();
        store.save("globex", &token("other", 99)).await.unwrap();

        let latest = store.load_latest("acme").await.unwrap().unwrap();
        assert_eq!(latest.access_token, "third");
        assert_eq!(latest.connection, "acme");

        let history = store.history("acme", 10).await.unwrap();
        let order: Vec<_> = history.iter().map(|t| t.access_token.as_str()).collect();
        assert_eq!(order, vec!["third", "second", "first"]);

        assert_eq!(store.history("acme", 2).await.unwrap().len(), 2);
        assert!(store.load_latest("initech").await.unwrap().is_none());
    }

    async fn exercise_tie_break(store: &dyn TokenStore) {
        store.save("acme", &token("old", 0)).await.unwrap();
        store.save("acme", &token("new", 0)).await.unwrap();
        let latest = store.load_latest("acme").await.unwrap().unwrap();
        assert_eq!(latest.access_token, "new");
    }

    #[tokio::test]
    async fn test_sqlite_latest_ordering() {
        let store = SqliteTokenStore::open_in_memory().unwrap();
        exercise_latest_ordering(&store).await;
    }

    #[tokio::test]
    async fn test_memory_latest_ordering() {
        let store = MemoryTokenStore::new();
        exercise_latest_ordering(&store).await;
        assert_eq!(store.row_count("acme"), 3);
    }

    #[tokio::test]
    async fn test_sqlite_tie_break() {
        let store = SqliteTokenStore::open_in_memory().unwrap();
        exercise_tie_break(&store).await;
    }

    #[tokio::test]
    async fn test_memory_tie_break() {
        let store = MemoryTokenStore::new();
        exercise_tie_break(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_preserves_optional_fields() {
        let store = SqliteTokenStore::open_in_memory().unwrap();
        let saved = token("full", 0)
            .with_realm("9130-3571")
            .with_token_type("Bearer")
            .with_refresh_expires_at(t0() + TimeDelta::days(100));
        store.save("acme", &saved).await.unwrap();

        let loaded = store.load_latest("acme").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_sqlite_save_never_overwrites() {
        let store = SqliteTokenStore::open_in_memory().unwrap();
        let row = token("same", 0);
        store.save("acme", &row).await.unwrap();
        store.save("acme", &row).await.unwrap();
        assert_eq!(store.history("acme", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.db");

        {
            let store = SqliteTokenStore::open(&path).unwrap();
            store.save("acme", &token("durable", 0)).await.unwrap();
        }

        let store = SqliteTokenStore::open(&path).unwrap();
        let latest = store.load_latest("acme").await.unwrap().unwrap();
        assert_eq!(latest.access_token, "durable");
    }

    #[tokio::test]
    async fn test_shared_constructors() {
        let dir = tempdir().unwrap();
        let sqlite = create_token_store(&dir.path().join("tokens.db")).unwrap();
        sqlite.save("acme", &token("a", 0)).await.unwrap();
        assert!(sqlite.load_latest("acme").await.unwrap().is_some());

        let memory = create_memory_token_store();
        assert!(memory.load_latest("acme").await.unwrap().is_none());
    }
}
