//! Export engine
//!
//! Builds portable single-file SQLite snapshots of the catalog, either the
//! subset selected by a [`FilterPredicate`] or the whole store, optionally
//! with one CSV file per table and an RO-Crate manifest.
//!
//! Filtered snapshots are copied on a dedicated connection that attaches the
//! live store and reads every table inside one transaction; full snapshots
//! use `VACUUM INTO`. Either way the artifact reflects one point in time.

mod archive;
mod csv_dump;
pub mod ro_crate;

pub use archive::sha256_file;

use crate::db::schema::{self, column_list, quote, TABLES};
use crate::db::{open_file, read_only_uri, DbPool, FileMode, TableCounts};
use crate::errors::{AppError, Result};
use crate::filter::{parse_flag, FilterPredicate};
use crate::metrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Connection, SqliteConnection};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{info, instrument};

pub const FULL_DB_NAME: &str = "exported_database.sqlite3";
pub const FILTERED_DB_NAME: &str = "filtered_database.sqlite3";
pub const ARCHIVE_NAME: &str = "bminty_export.zip";

const SOURCE: &str = "source";

/// Artifact shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Filtered single-file database
    #[default]
    Sqlite,
    /// Filtered database plus one CSV per table
    Zip,
    /// One table of the filtered subset
    Csv,
    /// Whole store, filters ignored
    Full,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Sqlite => "sqlite",
            ExportFormat::Zip => "zip",
            ExportFormat::Csv => "csv",
            ExportFormat::Full => "full",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "sqlite" => Ok(ExportFormat::Sqlite),
            "zip" => Ok(ExportFormat::Zip),
            "csv" => Ok(ExportFormat::Csv),
            "full" => Ok(ExportFormat::Full),
            other => Err(AppError::Validation {
                message: format!("unknown export format '{}'", other),
                field: Some("export_format".into()),
            }),
        }
    }
}

/// What to export
#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub format: ExportFormat,
    /// Table for `csv`
    pub table: Option<String>,
    pub ro_crate: bool,
    pub filter: FilterPredicate,
}

impl ExportRequest {
    /// Parse query pairs: `export_format`, `table`, `ro_crate` and the filter vocabulary
    pub fn from_pairs<K, V>(pairs: &[(K, V)]) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut request = ExportRequest {
            filter: FilterPredicate::from_pairs(pairs.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))?,
            ..Default::default()
        };

        for (key, value) in pairs {
            let value = value.as_ref().trim();
            match key.as_ref() {
                "export_format" => request.format = value.parse()?,
                "table" if !value.is_empty() => request.table = Some(value.to_ascii_lowercase()),
                "ro_crate" if !value.is_empty() => {
                    request.ro_crate = parse_flag(value).ok_or_else(|| AppError::Validation {
                        message: format!("ro_crate must be a boolean, got '{}'", value),
                        field: Some("ro_crate".into()),
                    })?;
                }
                _ => {}
            }
        }

        request.validate()?;
        Ok(request)
    }

    /// Full export of the whole store
    pub fn full() -> Self {
        ExportRequest {
            format: ExportFormat::Full,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.format == ExportFormat::Csv {
            self.csv_table()?;
        }
        Ok(())
    }

    fn csv_table(&self) -> Result<&'static schema::TableDef> {
        let name = self.table.as_deref().ok_or_else(|| AppError::MissingField {
            field: "table".into(),
        })?;
        schema::table(name).ok_or_else(|| AppError::Validation {
            message: format!(
                "table must be one of {}",
                schema::table_names().collect::<Vec<_>>().join(", ")
            ),
            field: Some("table".into()),
        })
    }
}

/// A finished export. The file lives in a private temporary directory that
/// is removed when the artifact is dropped.
#[derive(Debug)]
pub struct ExportArtifact {
    _dir: TempDir,
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: &'static str,
    /// Rows per table in the exported database
    pub counts: TableCounts,
}

impl ExportArtifact {
    /// Artifact size in bytes
    pub fn size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Move the file to `dest`, copying when a rename crosses filesystems
    pub async fn persist(self, dest: &Path) -> Result<PathBuf> {
        if tokio::fs::rename(&self.path, dest).await.is_err() {
            tokio::fs::copy(&self.path, dest).await?;
        }
        Ok(dest.to_path_buf())
    }
}

/// Export engine bound to one store
#[derive(Clone)]
pub struct ExportEngine {
    pool: DbPool,
    work_dir: PathBuf,
}

impl ExportEngine {
    pub fn new(pool: DbPool, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            work_dir: work_dir.into(),
        }
    }

    /// Build the artifact described by `request`
    #[instrument(skip(self, request), fields(format = %request.format, ro_crate = request.ro_crate))]
    pub async fn export(&self, request: &ExportRequest) -> Result<ExportArtifact> {
        request.validate()?;
        let started = Instant::now();

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix("bminty-export-")
            .tempdir_in(&self.work_dir)?;

        let db_path = match request.format {
            ExportFormat::Full => {
                let path = dir.path().join(FULL_DB_NAME);
                self.pool.vacuum_into(&path).await?;
                path
            }
            _ => {
                let path = dir.path().join(FILTERED_DB_NAME);
                self.build_filtered(&request.filter, &path).await?;
                path
            }
        };

        let mut conn = open_file(&db_path, FileMode::ReadOnly).await?;
        let counts = TableCounts::fetch(&mut conn, "main").await?;

        let mut parts = Vec::new();
        match request.format {
            ExportFormat::Sqlite | ExportFormat::Full => parts.push(db_path.clone()),
            ExportFormat::Zip => {
                parts.push(db_path.clone());
                for table in TABLES.iter() {
                    let path = dir.path().join(format!("{}.csv", table.name));
                    csv_dump::dump_table(&mut conn, table, &path).await?;
                    parts.push(path);
                }
            }
            ExportFormat::Csv => {
                let table = request.csv_table()?;
                let path = dir.path().join(format!("{}.csv", table.name));
                csv_dump::dump_table(&mut conn, table, &path).await?;
                parts.push(path);
            }
        }

        if request.ro_crate {
            let tables = ro_crate::describe_tables(&mut conn).await?;
            let files = ro_crate::describe_files(parts.clone()).await?;
            let filter = match request.format {
                ExportFormat::Full => json!({}),
                _ => request.filter.to_json(),
            };
            let document = ro_crate::manifest(&files, &tables, &counts, &filter, Utc::now());

            let manifest_path = dir.path().join(ro_crate::MANIFEST_NAME);
            tokio::fs::write(&manifest_path, serde_json::to_vec_pretty(&document)?).await?;
            parts.push(manifest_path);
        }
        conn.close().await?;

        let (path, content_type) = if request.ro_crate || request.format == ExportFormat::Zip {
            let path = dir.path().join(ARCHIVE_NAME);
            let dest = path.clone();
            tokio::task::spawn_blocking(move || archive::write_zip(&dest, &parts))
                .await
                .map_err(|e| AppError::Internal {
                    message: format!("archive task failed: {}", e),
                })??;
            (path, "application/zip")
        } else {
            let content_type = match request.format {
                ExportFormat::Csv => "text/csv",
                _ => "application/vnd.sqlite3",
            };
            (parts.remove(0), content_type)
        };

        let file_name = archive::entry_name(&path)?;
        let elapsed = started.elapsed().as_secs_f64();
        metrics::record_export(elapsed, request.format.as_str());
        info!(
            file = %file_name,
            studies = counts.study,
            assays = counts.assay,
            signals = counts.signal,
            elapsed_secs = elapsed,
            "Export ready"
        );

        Ok(ExportArtifact {
            _dir: dir,
            path,
            file_name,
            content_type,
            counts,
        })
    }

    /// Copy the filtered subset of the live store into a fresh file at `target`
    async fn build_filtered(&self, filter: &FilterPredicate, target: &Path) -> Result<()> {
        let mut conn = open_file(target, FileMode::Create).await?;
        for table in TABLES.iter() {
            sqlx::query(table.create).execute(&mut conn).await?;
        }

        sqlx::query(&format!("ATTACH DATABASE ? AS {}", SOURCE))
            .bind(read_only_uri(self.pool.path())?)
            .execute(&mut conn)
            .await?;

        let copied = copy_selection(&mut conn, filter).await;
        sqlx::query(&format!("DETACH DATABASE {}", SOURCE))
            .execute(&mut conn)
            .await?;
        copied?;

        for index in schema::INDEXES {
            sqlx::query(index).execute(&mut conn).await?;
        }
        conn.close().await?;
        Ok(())
    }
}

/// Copy every selected row parent-first inside one read transaction
async fn copy_selection(conn: &mut SqliteConnection, filter: &FilterPredicate) -> Result<()> {
    let mut tx = conn.begin().await?;

    let studies = filter.count_table(&mut tx, "study", SOURCE).await?;
    let assays = filter.count_table(&mut tx, "assay", SOURCE).await?;
    if studies == 0 || assays == 0 {
        return Err(AppError::Validation {
            message: format!(
                "filters matched {} studies and {} assays; nothing to export",
                studies, assays
            ),
            field: None,
        });
    }

    for table in TABLES.iter() {
        let selection = filter.selection(table.name, SOURCE)?;
        let columns = column_list(table.columns, None);
        let sql = format!(
            "INSERT INTO main.{t} ({c}) SELECT {c} FROM {s}.{t} WHERE \"id\" IN ({sel})",
            t = quote(table.name),
            c = columns,
            s = SOURCE,
            sel = selection.sql
        );
        selection.bind(sqlx::query(&sql)).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Repository;
    use std::fs::File;
    use std::io::Read;

    async fn seeded() -> (TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(dir.path().join("catalog.sqlite3")).await.unwrap();

        let statements = [
            "INSERT INTO study (id, external_id, name, availability) VALUES (1, 'GSE1', 'liver', 1), (2, 'GSE2', 'brain', 0)",
            "INSERT INTO pipeline (id, name, external_url) VALUES (1, 'nf-core', 'https://nf-co.re'), (2, 'cellranger', 'https://10x')",
            "INSERT INTO assay (id, external_id, type, name, treatment, platform, study_id, pipeline_id, tissue) VALUES \
             (1, 'A1', 'RNA-seq', 'bulk liver', 'none', 'illumina', 1, 1, 'liver'), \
             (2, 'A2', 'scRNA-seq', 'sc brain', 'none', 'illumina', 2, 2, 'brain')",
            "INSERT INTO assembly (id, name, version, species) VALUES (1, 'GRCh38', 'p14', 'human'), (2, 'GRCm39', 'v1', 'mouse')",
            "INSERT INTO interval (id, external_id, type, chromosome, start, \"end\", strand, assembly_id) VALUES \
             (1, 'g1', 'gene', 'chr1', 10, 20, '+', 1), (2, 'g2', 'exon', 'chr1', 30, 40, '-', 1), \
             (3, 'm1', 'gene', 'chr2', 5, 9, '+', 2), (4, 'unused', 'gene', 'chr3', 1, 2, '+', 1)",
            "INSERT INTO cell (id, name, type, assay_id) VALUES (1, 'c1', 'cell', 2), (2, 'c2', 'spot', 2)",
            "INSERT INTO signal (signal, assay_id, interval_id, cell_id) VALUES \
             (1.5, 1, 1, NULL), (0.0, 1, 2, NULL), (3.0, 2, 3, 1), (4.0, 2, 3, 2)",
        ];
        for sql in statements {
            sqlx::query(sql).execute(pool.sqlx()).await.unwrap();
        }
        (dir, pool)
    }

    fn request(pairs: &[(&str, &str)]) -> ExportRequest {
        ExportRequest::from_pairs(pairs).unwrap()
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("".parse::<ExportFormat>().unwrap(), ExportFormat::Sqlite);
        assert_eq!("ZIP".parse::<ExportFormat>().unwrap(), ExportFormat::Zip);
        assert!("parquet".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_csv_requires_known_table() {
        assert!(ExportRequest::from_pairs(&[("export_format", "csv")]).is_err());
        assert!(ExportRequest::from_pairs(&[("export_format", "csv"), ("table", "paper")]).is_err());
        let req = request(&[("export_format", "csv"), ("table", "Signal"), ("ro_crate", "yes")]);
        assert_eq!(req.table.as_deref(), Some("signal"));
        assert!(req.ro_crate);
    }

    #[tokio::test]
    async fn test_filtered_counts_match_live_counts() {
        let (dir, pool) = seeded().await;
        let repo = Repository::new(pool.clone());
        let engine = ExportEngine::new(pool, dir.path().join("work"));

        for pairs in [
            vec![],
            vec![("study_name", "liver")],
            vec![("assay_type", "scRNA-seq")],
            vec![("cell_kind", "spot")],
            vec![("interval_type", "gene"), ("assembly_name", "GRCh38")],
        ] {
            let req = request(&pairs);
            let artifact = engine.export(&req).await.unwrap();
            let live = repo.filtered_counts(&req.filter).await.unwrap();
            assert_eq!(artifact.counts, live, "filter {:?}", pairs);
            assert_eq!(artifact.file_name, FILTERED_DB_NAME);
        }
    }

    #[tokio::test]
    async fn test_filtered_export_follows_references() {
        let (dir, pool) = seeded().await;
        let engine = ExportEngine::new(pool, dir.path().join("work"));

        let artifact = engine.export(&request(&[("study_name", "liver")])).await.unwrap();
        assert_eq!(artifact.counts.study, 1);
        assert_eq!(artifact.counts.assay, 1);
        assert_eq!(artifact.counts.pipeline, 1);
        assert_eq!(artifact.counts.assembly, 1);
        assert_eq!(artifact.counts.interval, 2);
        assert_eq!(artifact.counts.cell, 0);
        assert_eq!(artifact.counts.signal, 2);

        let artifact = engine.export(&request(&[("cell_kind", "spot")])).await.unwrap();
        assert_eq!(artifact.counts.study, 1);
        assert_eq!(artifact.counts.cell, 1);
        assert_eq!(artifact.counts.signal, 1);
    }

    #[tokio::test]
    async fn test_zero_match_is_rejected() {
        let (dir, pool) = seeded().await;
        let engine = ExportEngine::new(pool, dir.path().join("work"));

        let err = engine
            .export(&request(&[("study_name", "nothing")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_full_export_ignores_filters() {
        let (dir, pool) = seeded().await;
        let engine = ExportEngine::new(pool, dir.path().join("work"));

        let a = engine
            .export(&request(&[("export_format", "full"), ("study_name", "liver")]))
            .await
            .unwrap();
        let b = engine
            .export(&request(&[("export_format", "full"), ("assay_type", "none")]))
            .await
            .unwrap();

        assert_eq!(a.file_name, FULL_DB_NAME);
        assert_eq!(a.counts.interval, 4);
        assert_eq!(std::fs::read(&a.path).unwrap(), std::fs::read(&b.path).unwrap());
    }

    #[tokio::test]
    async fn test_zip_export_contents() {
        let (dir, pool) = seeded().await;
        let engine = ExportEngine::new(pool, dir.path().join("work"));

        let artifact = engine.export(&request(&[("export_format", "zip")])).await.unwrap();
        assert_eq!(artifact.file_name, ARCHIVE_NAME);
        assert_eq!(artifact.content_type, "application/zip");

        let mut archive = zip::ZipArchive::new(File::open(&artifact.path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "assay.csv", "assembly.csv", "cell.csv", "filtered_database.sqlite3",
                "interval.csv", "pipeline.csv", "signal.csv", "study.csv",
            ]
        );

        let mut signals = String::new();
        archive.by_name("signal.csv").unwrap().read_to_string(&mut signals).unwrap();
        assert_eq!(signals.lines().count(), 5);
    }

    #[tokio::test]
    async fn test_csv_with_ro_crate() {
        let (dir, pool) = seeded().await;
        let engine = ExportEngine::new(pool, dir.path().join("work"));

        let artifact = engine
            .export(&request(&[
                ("export_format", "csv"),
                ("table", "assay"),
                ("ro_crate", "true"),
                ("tissue", "liver"),
            ]))
            .await
            .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&artifact.path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);

        let mut text = String::new();
        archive
            .by_name(ro_crate::MANIFEST_NAME)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        let graph = doc["@graph"].as_array().unwrap();

        let filters = graph.iter().find(|e| e["@id"] == "#export-filters").unwrap();
        assert_eq!(filters["value"], "{\"tissue\":\"liver\"}");

        let file = graph.iter().find(|e| e["@id"] == "assay.csv").unwrap();
        assert_eq!(file["@type"], "File");
        assert_eq!(file["sha256"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_artifact_directory_removed_on_drop() {
        let (dir, pool) = seeded().await;
        let engine = ExportEngine::new(pool, dir.path().join("work"));

        let artifact = engine.export(&ExportRequest::full()).await.unwrap();
        let path = artifact.path.clone();
        assert!(path.exists());
        drop(artifact);
        assert!(!path.exists());
    }
}
