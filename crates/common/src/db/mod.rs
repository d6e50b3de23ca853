//! Database layer for bMINTY
//!
//! Provides:
//! - SeaORM entity models
//! - Repository pattern for data access
//! - SQLite connection pool management
//! - Writer admission (imports share, restores are exclusive)

pub mod models;
mod repository;
pub mod schema;

pub use repository::{NewAssay, NewStudy, Repository, TableCounts};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use sea_orm::{ConnectionTrait, DatabaseConnection, SqlxSqliteConnector};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    /// SeaORM connection backed by `sqlx`
    conn: DatabaseConnection,

    /// Raw pool for ATTACH, VACUUM and PRAGMA work
    sqlx: SqlitePool,

    /// Database file
    path: PathBuf,

    /// Writer admission. Import ids are allocated as MAX(id) + 1, so
    /// exactly one writer may hold a transaction at a time.
    writers: Arc<Semaphore>,
}

impl DbPool {
    /// Open (creating if missing) the database described by `config`
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!(path = %config.path.display(), "Opening database...");

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let sqlx = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(2))
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to open {}: {}", config.path.display(), e),
            })?;

        let conn = SqlxSqliteConnector::from_sqlx_sqlite_pool(sqlx.clone());
        schema::ensure_schema(&conn).await?;

        info!("Database ready");

        Ok(Self {
            conn,
            sqlx,
            path: config.path.clone(),
            writers: Arc::new(Semaphore::new(1)),
        })
    }

    /// Open a database file with default settings
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(&DatabaseConfig::for_path(path.as_ref())).await
    }

    /// SeaORM connection
    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Raw sqlx pool
    pub fn sqlx(&self) -> &SqlitePool {
        &self.sqlx
    }

    /// Database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Admission for one writer (a bulk import)
    pub async fn write_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.writers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::ServiceUnavailable {
                message: "writer gate closed".into(),
            })
    }

    /// Admission that excludes every other writer (a restore)
    pub async fn exclusive_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.writers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::ServiceUnavailable {
                message: "writer gate closed".into(),
            })
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.conn
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Ping failed: {}", e),
            })?;

        Ok(())
    }

    /// Write a compacted copy of the whole store to `dest`.
    ///
    /// `VACUUM INTO` reads inside a single transaction, so the copy is a
    /// point-in-time snapshot even while imports are running.
    pub async fn vacuum_into(&self, dest: &Path) -> Result<()> {
        if tokio::fs::try_exists(dest).await? {
            tokio::fs::remove_file(dest).await?;
        }
        sqlx::query("VACUUM INTO ?")
            .bind(path_str(dest)?)
            .execute(&self.sqlx)
            .await?;
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.sqlx.close().await;
    }
}

/// How a standalone connection opens its file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Existing file, no writes
    ReadOnly,
    /// Fresh artifact file in rollback-journal mode
    Create,
    /// Existing store, same pragmas as the pool
    ReadWrite,
}

/// Open a dedicated connection outside the pool.
///
/// Export targets, snapshot validation and restores each need one connection
/// that owns its ATTACH state.
pub async fn open_file(path: &Path, mode: FileMode) -> Result<SqliteConnection> {
    let options = SqliteConnectOptions::new().filename(path);
    let options = match mode {
        FileMode::ReadOnly => options.read_only(true),
        FileMode::Create => options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .foreign_keys(true),
        FileMode::ReadWrite => options
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30)),
    };

    SqliteConnection::connect_with(&options)
        .await
        .map_err(|e| AppError::DatabaseConnection {
            message: format!("Failed to open {}: {}", path.display(), e),
        })
}

/// Path as text for ATTACH and VACUUM INTO
pub fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| AppError::InvalidFormat {
        message: format!("path is not valid UTF-8: {}", path.display()),
    })
}

/// `file:` URI opening `path` read-only, for ATTACH
pub fn read_only_uri(path: &Path) -> Result<String> {
    let mut uri = String::from("file:");
    for c in path_str(path)?.chars() {
        match c {
            '%' => uri.push_str("%25"),
            '?' => uri.push_str("%3f"),
            '#' => uri.push_str("%23"),
            c => uri.push(c),
        }
    }
    uri.push_str("?mode=ro");
    Ok(uri)
}
