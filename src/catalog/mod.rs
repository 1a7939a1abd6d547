use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::config::BridgeConfig;

/// darktable keeps the star rating in the low three bits of `images.flags`;
/// 6 marks a rejected image.
const RATING_MASK: i64 = 0x7;
const REJECTED_RATING: i64 = 6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSummary {
    pub id: i64,
    pub filename: String,
    pub rating: i64,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog database not found: {0}")]
    Missing(PathBuf),
    #[error("catalog is locked by the host (gave up after {attempts} attempts)")]
    Locked { attempts: u32 },
    #[error("only SELECT statements may run against the catalog")]
    NotReadOnly,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

/// Read-only view of the host's `library.db`. A fresh connection is opened
/// per query because darktable may hold the write lock at any moment.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    db_path: PathBuf,
    retry: RetryPolicy,
}

impl CatalogStore {
    pub fn new(db_path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            db_path: db_path.into(),
            retry,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.db_path.clone(),
            RetryPolicy {
                attempts: config.catalog_retry_attempts.max(1),
                delay: config.catalog_retry_delay,
            },
        )
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn list_recent_images(&self, limit: u32) -> Result<Vec<ImageSummary>, CatalogError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, filename, flags FROM images ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                let flags: i64 = row.get::<_, Option<i64>>(2)?.unwrap_or(0);
                Ok(ImageSummary {
                    id: row.get(0)?,
                    filename: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    rating: rating_from_flags(flags),
                })
            })?;
            rows.collect()
        })
    }

    pub fn image_details(&self, img_id: i64) -> Result<Option<Map<String, Value>>, CatalogError> {
        let rows = self.select_rows("SELECT * FROM images WHERE id = ?1 LIMIT 1", &[&img_id])?;
        Ok(rows.into_iter().next())
    }

    /// Runs an arbitrary `SELECT` (or `WITH ... SELECT`) and returns rows as
    /// JSON objects.
    pub fn select_rows(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Map<String, Value>>, CatalogError> {
        if !is_select_only(sql) {
            return Err(CatalogError::NotReadOnly);
        }
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql)?;
            if !stmt.readonly() {
                return Err(rusqlite::Error::InvalidQuery);
            }
            let columns = column_names(&stmt);
            let rows = stmt.query_map(params, |row| row_to_json(row, columns.as_slice()))?;
            rows.collect()
        })
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, CatalogError>
    where
        F: Fn(&Connection) -> Result<T, rusqlite::Error>,
    {
        if !self.db_path.is_file() {
            return Err(CatalogError::Missing(self.db_path.clone()));
        }
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            let result = Connection::open_with_flags(
                self.db_path.as_path(),
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .and_then(|conn| {
                // Contention is handled by the retry loop below, not by
                // sqlite's own busy handler.
                conn.busy_timeout(Duration::ZERO)?;
                func(&conn)
            });
            match result {
                Ok(value) => return Ok(value),
                Err(err) if is_lock_contention(&err) => {
                    warn!(attempt, attempts, error = %err, "catalog locked, retrying");
                    if attempt < attempts {
                        thread::sleep(self.retry.delay);
                    }
                }
                Err(err) => return Err(CatalogError::Sqlite(err)),
            }
        }
        Err(CatalogError::Locked { attempts })
    }
}

pub fn rating_from_flags(flags: i64) -> i64 {
    match flags & RATING_MASK {
        REJECTED_RATING => -1,
        stars => stars.min(5),
    }
}

fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn is_select_only(sql: &str) -> bool {
    let lowered = sql.trim_start().to_ascii_lowercase();
    lowered.starts_with("select") || lowered.starts_with("with")
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Vec<String> {
    stmt.column_names()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn row_to_json(row: &Row<'_>, columns: &[String]) -> Result<Map<String, Value>, rusqlite::Error> {
    let mut out = Map::new();
    for (idx, name) in columns.iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::from(v),
            ValueRef::Real(v) => Value::from(v),
            ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).to_string()),
            ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}
