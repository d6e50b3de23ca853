//! Snapshot restore
//!
//! Replaces the contents of the live store with those of a previously
//! exported snapshot. The snapshot is validated first, the current store is
//! optionally backed up with `VACUUM INTO`, then every table is swapped in a
//! single `BEGIN IMMEDIATE` transaction so a failure leaves the store as it was.

use crate::db::schema::{column_list, quote, TableDef, TABLES};
use crate::db::{open_file, path_str, DbPool, FileMode, TableCounts};
use crate::errors::{AppError, Result};
use crate::metrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument, warn};

const INCOMING: &str = "incoming";

/// Outcome of a successful restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub backup_path: Option<PathBuf>,
    /// Row counts of the store after the swap
    pub counts: TableCounts,
}

/// Restores snapshots into one store
#[derive(Clone)]
pub struct SnapshotService {
    pool: DbPool,
    backup_dir: PathBuf,
}

impl SnapshotService {
    pub fn new(pool: DbPool, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            backup_dir: backup_dir.into(),
        }
    }

    /// Validate `snapshot`, back up the store when asked, then replace its rows.
    ///
    /// Holds the exclusive writer permit, so no import runs during the swap.
    #[instrument(skip(self), fields(snapshot = %snapshot.display()))]
    pub async fn restore(&self, snapshot: &Path, create_backup: bool) -> Result<RestoreReport> {
        let result = self.restore_inner(snapshot, create_backup).await;
        metrics::record_restore(result.is_ok());
        match &result {
            Ok(report) => info!(
                backup = ?report.backup_path,
                studies = report.counts.study,
                signals = report.counts.signal,
                "Restore complete"
            ),
            Err(e) => error!(error = %e, "Restore failed"),
        }
        result
    }

    async fn restore_inner(&self, snapshot: &Path, create_backup: bool) -> Result<RestoreReport> {
        let columns = validate_snapshot(snapshot).await?;

        let _permit = self.pool.exclusive_permit().await?;

        let backup_path = if create_backup {
            Some(self.backup().await?)
        } else {
            None
        };

        let mut conn = open_file(self.pool.path(), FileMode::ReadWrite).await?;
        sqlx::query(&format!("ATTACH DATABASE ? AS {}", INCOMING))
            .bind(path_str(snapshot)?)
            .execute(&mut conn)
            .await?;

        let swapped = swap_tables(&mut conn, &columns).await;
        if swapped.is_err() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut conn).await {
                warn!(error = %e, "Rollback after failed swap");
            }
        }
        sqlx::query(&format!("DETACH DATABASE {}", INCOMING))
            .execute(&mut conn)
            .await?;
        swapped?;

        let counts = TableCounts::fetch(&mut conn, "main").await?;
        conn.close().await?;

        Ok(RestoreReport {
            backup_path,
            counts,
        })
    }

    /// Copy the live store to a timestamped file in the backup directory
    pub async fn backup(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;

        let stem = self
            .pool
            .path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("db");
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let dest = self
            .backup_dir
            .join(format!("{}.{}.backup.sqlite3", stem, stamp));

        self.pool.vacuum_into(&dest).await?;
        info!(path = %dest.display(), "Backup written");
        Ok(dest)
    }
}

/// Check that `snapshot` is an intact catalog database.
///
/// Returns the column names present in each snapshot table.
pub async fn validate_snapshot(snapshot: &Path) -> Result<HashMap<&'static str, HashSet<String>>> {
    if !tokio::fs::try_exists(snapshot).await? {
        return Err(AppError::InvalidSnapshot {
            message: format!("{} does not exist", snapshot.display()),
        });
    }

    let mut conn = open_file(snapshot, FileMode::ReadOnly)
        .await
        .map_err(|e| AppError::InvalidSnapshot {
            message: e.to_string(),
        })?;

    let integrity: Result<(String,)> = sqlx::query_as("PRAGMA integrity_check(1)")
        .fetch_one(&mut conn)
        .await
        .map_err(AppError::from);
    match integrity {
        Ok((status,)) if status == "ok" => {}
        Ok((status,)) => {
            return Err(AppError::InvalidSnapshot {
                message: format!("integrity check failed: {}", status),
            })
        }
        Err(e) => {
            return Err(AppError::InvalidSnapshot {
                message: format!("not a readable SQLite database: {}", e),
            })
        }
    }

    let mut found = HashMap::with_capacity(TABLES.len());
    for table in TABLES.iter() {
        let columns = table_columns(&mut conn, table).await?;
        if columns.is_empty() {
            return Err(AppError::InvalidSnapshot {
                message: format!("missing table '{}'", table.name),
            });
        }
        if let Some(missing) = table.required.iter().find(|c| !columns.contains(**c)) {
            return Err(AppError::InvalidSnapshot {
                message: format!("table '{}' lacks column '{}'", table.name, missing),
            });
        }
        found.insert(table.name, columns);
    }

    Ok(found)
}

async fn table_columns(conn: &mut SqliteConnection, table: &TableDef) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info(?)")
        .bind(table.name)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Delete child-first, insert parent-first, commit
async fn swap_tables(
    conn: &mut SqliteConnection,
    columns: &HashMap<&'static str, HashSet<String>>,
) -> Result<()> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    for table in TABLES.iter().rev() {
        sqlx::query(&format!("DELETE FROM main.{}", quote(table.name)))
            .execute(&mut *conn)
            .await?;
    }

    for table in TABLES.iter() {
        let shared: Vec<&str> = match columns.get(table.name) {
            Some(present) => table
                .columns
                .iter()
                .copied()
                .filter(|c| present.contains(*c))
                .collect(),
            None => continue,
        };
        let list = column_list(&shared, None);
        let copied = sqlx::query(&format!(
            "INSERT INTO main.{t} ({c}) SELECT {c} FROM {s}.{t}",
            t = quote(table.name),
            c = list,
            s = INCOMING
        ))
        .execute(&mut *conn)
        .await?;
        info!(table = table.name, rows = copied.rows_affected(), "Table restored");
    }

    sqlx::query("COMMIT").execute(&mut *conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Repository;
    use tempfile::TempDir;

    async fn store(dir: &TempDir, name: &str) -> DbPool {
        DbPool::open(dir.path().join(name)).await.unwrap()
    }

    async fn seed(pool: &DbPool, studies: i64) {
        for i in 0..studies {
            sqlx::query("INSERT INTO study (external_id, name) VALUES (?, ?)")
                .bind(format!("GSE{}", i))
                .bind(format!("study {}", i))
                .execute(pool.sqlx())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_backup_then_restore_reproduces_counts() {
        let dir = tempfile::tempdir().unwrap();
        let live = store(&dir, "live.sqlite3").await;
        seed(&live, 3).await;

        let service = SnapshotService::new(live.clone(), dir.path().join("backups"));
        let snapshot = service.backup().await.unwrap();
        assert!(snapshot.file_name().unwrap().to_str().unwrap().starts_with("live."));

        seed(&live, 5).await;
        sqlx::query("DELETE FROM study WHERE external_id = 'GSE0'")
            .execute(live.sqlx())
            .await
            .unwrap();

        let report = service.restore(&snapshot, true).await.unwrap();
        assert_eq!(report.counts.study, 3);
        assert!(report.backup_path.unwrap().exists());

        let names: Vec<(String,)> = sqlx::query_as("SELECT external_id FROM study ORDER BY id")
            .fetch_all(live.sqlx())
            .await
            .unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0].0, "GSE0");
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let live = store(&dir, "live.sqlite3").await;
        seed(&live, 2).await;

        let bogus = dir.path().join("bogus.sqlite3");
        std::fs::write(&bogus, b"definitely not a database file").unwrap();

        let service = SnapshotService::new(live.clone(), dir.path().join("backups"));
        let err = service.restore(&bogus, true).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidSnapshot { .. }));

        let counts = Repository::new(live).table_counts().await.unwrap();
        assert_eq!(counts.study, 2);
        assert!(!dir.path().join("backups").exists());
    }

    #[tokio::test]
    async fn test_snapshot_missing_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("partial.sqlite3");
        let mut conn = open_file(&partial, FileMode::Create).await.unwrap();
        for table in TABLES.iter().filter(|t| t.name != "cell") {
            sqlx::query(table.create).execute(&mut conn).await.unwrap();
        }
        drop(conn);

        let err = validate_snapshot(&partial).await.unwrap_err();
        assert!(err.to_string().contains("cell"));
    }
}
