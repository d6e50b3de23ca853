//! Folder importer
//!
//! Imports dataset folders laid out as one directory per dataset:
//! `*interval*.csv` and `*signal*.csv` are required, `*cell*.csv` is
//! optional, and `*study*.csv`, `*pipeline*.csv`, `*assay*.csv`,
//! `*assembly*.csv` supply catalog metadata from their first row.

use crate::errors::IngestionError;
use crate::parser::is_missing;
use crate::pipeline::{BulkImporter, ImportOptions, ImportRequest};
use bminty_common::db::{NewAssay, NewStudy};
use bminty_common::filter::parse_flag;
use bminty_common::jobs::{ImportSummary, ProgressSink};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Files found in one dataset folder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetFiles {
    pub name: String,
    pub intervals: PathBuf,
    pub cells: Option<PathBuf>,
    pub signals: PathBuf,
    pub study: Option<PathBuf>,
    pub pipeline: Option<PathBuf>,
    pub assay: Option<PathBuf>,
    pub assembly: Option<PathBuf>,
}

/// Catalog rows a folder import resolved, plus the import summary
#[derive(Debug, Clone, Serialize)]
pub struct FolderOutcome {
    pub folder: String,
    pub study_id: i64,
    pub pipeline_id: i64,
    pub assay_id: i64,
    pub assembly_id: i64,
    pub summary: ImportSummary,
}

/// Sorted subdirectories of `data_root`
pub fn discover(data_root: &Path) -> Result<Vec<PathBuf>, IngestionError> {
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(data_root)? {
        let path = entry?.path();
        if path.is_dir() {
            folders.push(path);
        }
    }
    folders.sort();
    Ok(folders)
}

/// First `.csv` file in `folder` whose lower-cased name contains `keyword`
pub fn find_csv(folder: &Path, keyword: &str) -> Result<Option<PathBuf>, IngestionError> {
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let name = name.to_lowercase();
        if path.is_file() && name.ends_with(".csv") && name.contains(keyword) {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches.into_iter().next())
}

/// Header-to-value map of a metadata file's first row, missing values dropped
pub fn first_row(path: &Path) -> Result<HashMap<String, String>, IngestionError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let header: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_lowercase())
        .collect();

    let mut row = HashMap::new();
    if let Some(record) = reader.records().next() {
        for (name, value) in header.iter().zip(record?.iter()) {
            if !name.is_empty() && !is_missing(value) {
                row.entry(name.clone()).or_insert_with(|| value.trim().to_string());
            }
        }
    }
    Ok(row)
}

/// Locate the dataset files of `folder`; `None` when a required file is absent
pub fn scan(folder: &Path) -> Result<Option<DatasetFiles>, IngestionError> {
    let (Some(intervals), Some(signals)) = (find_csv(folder, "interval")?, find_csv(folder, "signal")?) else {
        return Ok(None);
    };

    Ok(Some(DatasetFiles {
        name: folder
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "dataset".to_string()),
        intervals,
        cells: find_csv(folder, "cell")?,
        signals,
        study: find_csv(folder, "study")?,
        pipeline: find_csv(folder, "pipeline")?,
        assay: find_csv(folder, "assay")?,
        assembly: find_csv(folder, "assembly")?,
    }))
}

fn metadata(path: Option<&PathBuf>) -> Result<HashMap<String, String>, IngestionError> {
    match path {
        Some(path) => first_row(path),
        None => Ok(HashMap::new()),
    }
}

/// Imports dataset folders through the bulk import pipeline
pub struct FolderImporter {
    importer: BulkImporter,
}

impl FolderImporter {
    pub fn new(importer: BulkImporter) -> Self {
        Self { importer }
    }

    /// Import one folder; `Ok(None)` when it lacks interval or signal files
    #[instrument(skip(self, options, sink), fields(folder = %folder.display()))]
    pub async fn import_folder(
        &self,
        folder: &Path,
        options: ImportOptions,
        sink: &dyn ProgressSink,
    ) -> Result<Option<FolderOutcome>, IngestionError> {
        let Some(files) = scan(folder)? else {
            warn!("Skipping folder without interval and signal files");
            return Ok(None);
        };
        let repo = self.importer.repository();
        let name = files.name.clone();

        let mut study = metadata(files.study.as_ref())?;
        let study = repo
            .get_or_create_study(NewStudy {
                external_id: study.remove("external_id").unwrap_or_else(|| name.clone()),
                name: study.remove("name").unwrap_or_else(|| name.clone()),
                external_repo: study.remove("external_repo"),
                description: study.remove("description"),
                availability: study.get("availability").and_then(|v| parse_flag(v)),
                note: Some(
                    study
                        .remove("note")
                        .unwrap_or_else(|| format!("Imported from {}", folder.display())),
                ),
            })
            .await?;

        let mut pipeline = metadata(files.pipeline.as_ref())?;
        let external_url = pipeline
            .remove("external_url")
            .or_else(|| pipeline.remove("external_id"))
            .unwrap_or_else(|| name.clone());
        let pipeline = repo
            .get_or_create_pipeline(
                &external_url,
                &pipeline.remove("name").unwrap_or_else(|| name.clone()),
                Some(
                    pipeline
                        .remove("description")
                        .unwrap_or_else(|| format!("Pipeline for {}", name)),
                ),
            )
            .await?;

        let mut assay = metadata(files.assay.as_ref())?;
        let external_id = assay
            .remove("external_id")
            .unwrap_or_else(|| format!("{}_assay", name));
        let assay = match repo.find_assay_by_external_id(&external_id).await? {
            Some(existing) => existing,
            None => {
                let unspecified = || "unspecified".to_string();
                repo.create_assay(
                    study.id,
                    pipeline.id,
                    NewAssay {
                        external_id,
                        name: assay.remove("name").unwrap_or_else(|| name.clone()),
                        kind: assay.remove("type").unwrap_or_else(unspecified),
                        treatment: assay.remove("treatment").unwrap_or_else(unspecified),
                        platform: assay.remove("platform").unwrap_or_else(unspecified),
                        target: assay.remove("target"),
                        tissue: assay.remove("tissue"),
                        cell_type: assay.remove("cell_type"),
                        date: assay.remove("date"),
                        kit: assay.remove("kit"),
                        description: assay.remove("description"),
                        availability: assay.get("availability").and_then(|v| parse_flag(v)),
                        note: assay.remove("note"),
                    },
                )
                .await?
            }
        };

        let mut assembly = metadata(files.assembly.as_ref())?;
        let assembly = repo
            .get_or_create_assembly(
                &assembly.remove("name").unwrap_or_else(|| name.clone()),
                &assembly.remove("version").unwrap_or_else(|| "v1".to_string()),
                assembly.remove("species"),
            )
            .await?;

        info!(
            study_id = study.id,
            pipeline_id = pipeline.id,
            assay_id = assay.id,
            assembly_id = assembly.id,
            "Catalog entries resolved"
        );

        let request = ImportRequest {
            assembly_id: assembly.id,
            assay_id: assay.id,
            interval_file: files.intervals,
            cell_file: files.cells,
            signal_file: files.signals,
            options,
        };
        let summary = self.importer.run(&request, sink).await?;

        Ok(Some(FolderOutcome {
            folder: name,
            study_id: study.id,
            pipeline_id: pipeline.id,
            assay_id: assay.id,
            assembly_id: assembly.id,
            summary,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::ImportLocks;
    use bminty_common::config::ImportConfig;
    use bminty_common::db::{DbPool, Repository};
    use bminty_common::jobs::{JobPhase, PhaseProgress};

    struct Quiet;

    #[async_trait::async_trait]
    impl ProgressSink for Quiet {
        async fn phase(&self, _phase: JobPhase, _message: String) {}
        async fn progress(&self, _phase: JobPhase, _progress: PhaseProgress) {}
    }

    fn dataset(root: &Path, name: &str, with_metadata: bool) -> PathBuf {
        let folder = root.join(name);
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(
            folder.join("intervals.csv"),
            "external_id,type,chromosome,start,end,strand\ng1,gene,chr1,1,10,+\ng2,gene,chr1,20,30,-\n",
        )
        .unwrap();
        std::fs::write(folder.join("signals.csv"), "signal,interval_id\n1.5,1\n0,2\n").unwrap();
        if with_metadata {
            std::fs::write(folder.join("study.csv"), "external_id,name,availability\nGSE42,My study,false\n").unwrap();
            std::fs::write(folder.join("assay.csv"), "external_id,name,type,platform\nA42,Bulk,Bulk RNA-seq,NA\n").unwrap();
            std::fs::write(folder.join("assembly.csv"), "name,version,species\nGRCh38,p14,Homo sapiens\n").unwrap();
        }
        folder
    }

    async fn importer(dir: &Path) -> FolderImporter {
        let pool = DbPool::open(dir.join("catalog.sqlite3")).await.unwrap();
        let repo = Repository::new(pool);
        FolderImporter::new(BulkImporter::new(repo, ImportLocks::new(), &ImportConfig::default()))
    }

    #[test]
    fn test_scan_requires_interval_and_signal_files() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dataset(dir.path(), "ds1", false);
        let files = scan(&folder).unwrap().unwrap();
        assert_eq!(files.name, "ds1");
        assert!(files.cells.is_none());

        std::fs::remove_file(folder.join("signals.csv")).unwrap();
        assert!(scan(&folder).unwrap().is_none());
    }

    #[test]
    fn test_first_row_drops_missing_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assay.csv");
        std::fs::write(&path, "External_ID,name,kit\nA1,,NA\nA2,x,y\n").unwrap();
        let row = first_row(&path).unwrap();
        assert_eq!(row.get("external_id").map(String::as_str), Some("A1"));
        assert!(!row.contains_key("name"));
        assert!(!row.contains_key("kit"));
    }

    #[test]
    fn test_discover_lists_sorted_folders() {
        let dir = tempfile::tempdir().unwrap();
        dataset(dir.path(), "b", false);
        dataset(dir.path(), "a", false);
        std::fs::write(dir.path().join("readme.txt"), "x").unwrap();
        let folders = discover(dir.path()).unwrap();
        assert_eq!(folders, vec![dir.path().join("a"), dir.path().join("b")]);
    }

    #[tokio::test]
    async fn test_import_folder_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dataset(dir.path(), "ds1", false);
        let importer = importer(dir.path()).await;

        let outcome = importer
            .import_folder(&folder, ImportOptions::default(), &Quiet)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.summary.intervals, 2);
        assert_eq!(outcome.summary.signals, 2);

        let repo = importer.importer.repository();
        let study = repo.find_study_by_external_id("ds1").await.unwrap().unwrap();
        assert_eq!(study.id, outcome.study_id);
        let assay = repo.find_assay_by_external_id("ds1_assay").await.unwrap().unwrap();
        assert_eq!(assay.kind, "unspecified");
        let assembly = repo.find_assembly(outcome.assembly_id).await.unwrap().unwrap();
        assert_eq!(assembly.version, "v1");
    }

    #[tokio::test]
    async fn test_import_folder_uses_metadata_and_reuses_rows() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dataset(dir.path(), "ds2", true);
        let importer = importer(dir.path()).await;
        let options = ImportOptions { deduplicate_intervals: true, ..Default::default() };

        let first = importer.import_folder(&folder, options, &Quiet).await.unwrap().unwrap();
        let second = importer.import_folder(&folder, options, &Quiet).await.unwrap().unwrap();
        assert_eq!(first.assay_id, second.assay_id);
        assert_eq!(first.assembly_id, second.assembly_id);
        assert_eq!(second.summary.deduplicated_intervals, 2);

        let repo = importer.importer.repository();
        let study = repo.find_study_by_external_id("GSE42").await.unwrap().unwrap();
        assert_eq!(study.name, "My study");
        assert!(!study.availability);
        let assay = repo.find_assay(first.assay_id).await.unwrap().unwrap();
        assert_eq!(assay.platform, "unspecified");
        assert_eq!(assay.interval_count, Some(2));
        assert_eq!(repo.table_counts().await.unwrap().interval, 2);
    }
}
