//! # Database Module
//!
//! SQLite persistence for the entity store, on top of `rusqlite`.
//!
//! ## Layout
//!
//! - `items(id, kind, body)`: one row per entity, `body` is the JSON encoding
//!   of the [`LibraryItem`]
//! - `entry_points(mrl, banned, present)`: the entry-point registry
//! - `settings(key, value)`: the id sequence, so ids are never handed out twice
//!
//! The schema version lives in `PRAGMA user_version`. The store keeps the
//! working set in memory and writes through to this layer on every mutation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let db = Database::open(Path::new("/data/app/medialibrary.db"))?;
//! match db.user_version()? {
//!     0 => db.create_schema()?,
//!     SCHEMA_VERSION => {}
//!     _ => db.recreate_schema()?,
//! }
//! ```

use crate::error::{LibraryError, Result};
use crate::models::{EntryPointRecord, ItemType, LibraryItem, FIRST_FREE_ID};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bump whenever the row format changes; older files are reset.
pub const SCHEMA_VERSION: i32 = 4;

const NEXT_ID_KEY: &str = "next_id";

/// Why a database could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    /// The file exists but is not an SQLite database.
    NotADatabase,
    /// SQLite reports the file as malformed.
    Corrupt,
    /// Anything else: permissions, missing directory, disk errors.
    Io,
}

/// Classify an error raised while opening or probing a database.
pub fn classify_open_error(err: &LibraryError) -> OpenFailure {
    let LibraryError::Database(err) = err else {
        return OpenFailure::Io;
    };
    match err.sqlite_error_code() {
        Some(ErrorCode::NotADatabase) => OpenFailure::NotADatabase,
        Some(ErrorCode::DatabaseCorrupt) => OpenFailure::Corrupt,
        _ => OpenFailure::Io,
    }
}

/// Raw `items` row.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub id: i64,
    pub kind: String,
    pub body: String,
}

impl StoredRow {
    /// Decode the JSON body, checking it agrees with the row's columns.
    pub fn decode(&self) -> Result<LibraryItem> {
        let item: LibraryItem = serde_json::from_str(&self.body)?;
        if item.id as i64 != self.id {
            return Err(LibraryError::Corrupted {
                id: self.id,
                message: format!("body carries id {}", item.id),
            });
        }
        if ItemType::parse(&self.kind) != Some(item.item_type()) {
            return Err(LibraryError::Corrupted {
                id: self.id,
                message: format!("kind column '{}' does not match body", self.kind),
            });
        }
        Ok(item)
    }
}

/// Handle on the SQLite file.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) the database at `path`.
    ///
    /// The file is probed with a read, so a file that is not a database fails
    /// here rather than on first use.
    pub fn open(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Opening database");
        let conn = Connection::open(path)?;
        let db = Self::configure(conn)?;
        db.user_version()?;
        Ok(db)
    }

    /// Private in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn user_version(&self) -> Result<i32> {
        let conn = self.conn.lock();
        let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    fn set_user_version(conn: &Connection, version: i32) -> Result<()> {
        conn.pragma_update(None, "user_version", version)?;
        Ok(())
    }

    /// Run `PRAGMA integrity_check`.
    pub fn integrity_ok(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            warn!(verdict = %verdict, "Integrity check failed");
        }
        Ok(verdict == "ok")
    }

    /// Create the tables, the reserved artists and the id sequence, then stamp
    /// the schema version.
    pub fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        debug!(version = SCHEMA_VERSION, "Creating schema");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id   INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS items_kind ON items(kind);
            CREATE TABLE IF NOT EXISTS entry_points (
                mrl     TEXT PRIMARY KEY,
                banned  INTEGER NOT NULL DEFAULT 0,
                present INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )?;
        for artist in LibraryItem::reserved_artists() {
            Self::upsert_item(&tx, &artist)?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![NEXT_ID_KEY, FIRST_FREE_ID as i64],
        )?;
        tx.commit()?;
        Self::set_user_version(&conn, SCHEMA_VERSION)
    }

    pub fn drop_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        debug!("Dropping schema");
        conn.execute_batch(
            r#"
            DROP TABLE IF EXISTS items;
            DROP TABLE IF EXISTS entry_points;
            DROP TABLE IF EXISTS settings;
            "#,
        )?;
        Self::set_user_version(&conn, 0)
    }

    pub fn recreate_schema(&self) -> Result<()> {
        self.drop_schema()?;
        self.create_schema()
    }

    pub fn load_rows(&self) -> Result<Vec<StoredRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, kind, body FROM items ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    body: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn load_entry_points(&self) -> Result<Vec<EntryPointRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT mrl, banned, present FROM entry_points ORDER BY mrl")?;
        let records = stmt
            .query_map([], |row| {
                Ok(EntryPointRecord {
                    mrl: row.get(0)?,
                    banned: row.get(1)?,
                    present: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn load_next_id(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![NEXT_ID_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| u64::try_from(v).ok()))
    }

    pub fn save_next_id(&self, next: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![NEXT_ID_KEY, next as i64],
        )?;
        Ok(())
    }

    /// Insert or replace `items` in one transaction.
    pub fn save_items<'a, I>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a LibraryItem>,
    {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        for item in items {
            Self::upsert_item(&tx, item)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_items(&self, ids: &[u64]) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM items WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![*id as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn save_entry_point(&self, record: &EntryPointRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entry_points (mrl, banned, present) VALUES (?1, ?2, ?3)
             ON CONFLICT(mrl) DO UPDATE SET banned = excluded.banned, present = excluded.present",
            params![record.mrl, record.banned, record.present],
        )?;
        Ok(())
    }

    pub fn delete_entry_point(&self, mrl: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM entry_points WHERE mrl = ?1", params![mrl])?;
        Ok(())
    }

    fn upsert_item(conn: &Connection, item: &LibraryItem) -> Result<()> {
        let body = serde_json::to_string(item)?;
        conn.execute(
            "INSERT INTO items (id, kind, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, body = excluded.body",
            params![item.id as i64, item.item_type().as_str(), body],
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.conn.lock().path().map(str::to_owned))
            .finish()
    }
}
