//! SQLite connection management.
//!
//! One database file per installation. Write-ahead journaling, normal
//! synchronous mode, in-memory temp store, a 256 MiB mmap hint, and
//! foreign-key enforcement are set on every connection. The pool allows
//! concurrent readers; mutating statements are serialized by SQLite's
//! single-writer discipline.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::error::Result;

const MMAP_SIZE_BYTES: i64 = 256 * 1024 * 1024;

pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        .pragma("temp_store", "MEMORY")
        .pragma("mmap_size", MMAP_SIZE_BYTES.to_string());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
