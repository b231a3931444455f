use chrono::{DateTime, Utc};
use image::RgbaImage;
use placelog_common::frame::{self, Frame};
use placelog_core::store::{FrameStore, Order, PlaceRegistry, StoreError};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// SQLite-backed frame store.
///
/// Frames are PNG blobs in an append-only `frames` table whose AUTOINCREMENT
/// rowid doubles as the global sequence id. WAL mode is enabled so readers
/// (diff/timelapse requests) and the writer (release tasks) can operate
/// concurrently without blocking each other.
pub struct SqliteFrameStore {
    conn: Mutex<Connection>,
}

/// Frame metadata for listings; blobs stay in the database.
#[derive(Debug, Serialize)]
pub struct FrameSummary {
    pub sequence_id: i64,
    pub captured_at: DateTime<Utc>,
    pub submitter: String,
}

impl SqliteFrameStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        let conn = Connection::open(db_path).map_err(backend)?;
        let store = Self::init(conn)?;
        info!(path = db_path.display().to_string(), "SQLite frame store opened");
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(backend)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS places (
                id INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS frames (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                place_id    INTEGER NOT NULL REFERENCES places(id),
                captured_at INTEGER NOT NULL,
                image_data  BLOB    NOT NULL,
                submitter   TEXT    NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_frames_place
                ON frames(place_id, id);

            PRAGMA foreign_keys = ON;",
        )
        .map_err(backend)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Newest-first metadata page for a place, for listing endpoints.
    pub fn list_page(
        &self,
        place_id: i64,
        before: i64,
        limit: i64,
    ) -> Result<Vec<FrameSummary>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, captured_at, submitter FROM frames
                 WHERE place_id = ?1 AND id < ?2
                 ORDER BY id DESC
                 LIMIT ?3",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![place_id, before, limit.clamp(1, 500)], |row| {
                Ok(FrameSummary {
                    sequence_id: row.get(0)?,
                    captured_at: millis_to_datetime(row.get(1)?),
                    submitter: row.get(2)?,
                })
            })
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }
}

impl FrameStore for SqliteFrameStore {
    fn append(
        &self,
        place_id: i64,
        pixels: &RgbaImage,
        captured_at: DateTime<Utc>,
        submitter: &str,
    ) -> Result<i64, StoreError> {
        let data = frame::encode_png(pixels)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO frames (place_id, captured_at, image_data, submitter)
             VALUES (?1, ?2, ?3, ?4)",
            params![place_id, captured_at.timestamp_millis(), data, submitter],
        )
        .map_err(backend)?;
        let sequence_id = conn.last_insert_rowid();
        debug!(sequence_id, place_id, bytes = data.len(), "appended frame");
        Ok(sequence_id)
    }

    fn latest(&self, place_id: i64) -> Result<Frame, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, place_id, captured_at, image_data, submitter FROM frames
             WHERE place_id = ?1 ORDER BY id DESC LIMIT 1",
            params![place_id],
            row_to_frame,
        )
        .map_err(lookup_err)
    }

    fn by_id(&self, sequence_id: i64) -> Result<Frame, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, place_id, captured_at, image_data, submitter FROM frames
             WHERE id = ?1",
            params![sequence_id],
            row_to_frame,
        )
        .map_err(lookup_err)
    }

    fn range(
        &self,
        place_id: i64,
        from_id: i64,
        to_id: i64,
        order: Order,
    ) -> Result<Vec<Frame>, StoreError> {
        let (lo, hi) = (from_id.min(to_id), from_id.max(to_id));
        let sql = match order {
            Order::Ascending => {
                "SELECT id, place_id, captured_at, image_data, submitter FROM frames
                 WHERE place_id = ?1 AND id >= ?2 AND id <= ?3 ORDER BY id ASC"
            }
            Order::Descending => {
                "SELECT id, place_id, captured_at, image_data, submitter FROM frames
                 WHERE place_id = ?1 AND id >= ?2 AND id <= ?3 ORDER BY id DESC"
            }
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![place_id, lo, hi], row_to_frame)
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }
}

impl PlaceRegistry for SqliteFrameStore {
    fn exists(&self, place_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM places WHERE id = ?1)",
            params![place_id],
            |row| row.get(0),
        )
        .map_err(backend)
    }

    fn register(&self, place_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO places (id) VALUES (?1)",
            params![place_id],
        )
        .map_err(backend)?;
        debug!(place_id, "registered place");
        Ok(())
    }
}

fn row_to_frame(row: &rusqlite::Row<'_>) -> rusqlite::Result<Frame> {
    Ok(Frame {
        sequence_id: row.get(0)?,
        place_id: row.get(1)?,
        captured_at: millis_to_datetime(row.get(2)?),
        data: row.get(3)?,
        submitter: row.get(4)?,
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn lookup_err(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        e => backend(e),
    }
}
