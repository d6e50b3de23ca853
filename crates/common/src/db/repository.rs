//! Repository pattern for database operations
//!
//! Provides a clean interface for the catalog lookups and get-or-create
//! operations used around bulk imports, plus store-wide row counts.

use crate::db::models::*;
use crate::db::schema;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::filter::FilterPredicate;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

/// Row count of every catalog table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub study: i64,
    pub pipeline: i64,
    pub assay: i64,
    pub assembly: i64,
    pub interval: i64,
    pub cell: i64,
    pub signal: i64,
}

impl TableCounts {
    /// Count by table name
    pub fn get(&self, table: &str) -> Option<i64> {
        match table {
            "study" => Some(self.study),
            "pipeline" => Some(self.pipeline),
            "assay" => Some(self.assay),
            "assembly" => Some(self.assembly),
            "interval" => Some(self.interval),
            "cell" => Some(self.cell),
            "signal" => Some(self.signal),
            _ => None,
        }
    }

    /// Count every table of `schema_name` (`main` or an attached alias)
    pub async fn fetch(conn: &mut SqliteConnection, schema_name: &str) -> Result<Self> {
        let selects = schema::table_names()
            .map(|t| format!("(SELECT COUNT(*) FROM {}.{})", schema_name, schema::quote(t)))
            .collect::<Vec<_>>()
            .join(", ");
        let row: (i64, i64, i64, i64, i64, i64, i64) =
            sqlx::query_as(&format!("SELECT {}", selects))
                .fetch_one(&mut *conn)
                .await?;

        Ok(Self {
            study: row.0,
            pipeline: row.1,
            assay: row.2,
            assembly: row.3,
            interval: row.4,
            cell: row.5,
            signal: row.6,
        })
    }
}

/// Fields for a new study
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewStudy {
    pub external_id: String,
    pub name: String,
    pub external_repo: Option<String>,
    pub description: Option<String>,
    pub availability: Option<bool>,
    pub note: Option<String>,
}

/// Fields for a new assay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAssay {
    pub external_id: String,
    pub name: String,
    pub kind: String,
    pub treatment: String,
    pub platform: String,
    pub target: Option<String>,
    pub tissue: Option<String>,
    pub cell_type: Option<String>,
    pub date: Option<String>,
    pub kit: Option<String>,
    pub description: Option<String>,
    pub availability: Option<bool>,
    pub note: Option<String>,
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn conn(&self) -> &DatabaseConnection {
        self.pool.conn()
    }

    /// Open a transaction on the catalog
    pub async fn begin(&self) -> Result<DatabaseTransaction> {
        self.conn().begin().await.map_err(|e| AppError::Transaction {
            message: format!("Failed to begin transaction: {}", e),
        })
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Study Operations
    // ========================================================================

    /// Find study by external id
    pub async fn find_study_by_external_id(&self, external_id: &str) -> Result<Option<Study>> {
        StudyEntity::find()
            .filter(StudyColumn::ExternalId.eq(external_id))
            .one(self.conn())
            .await
            .map_err(Into::into)
    }

    /// Create a study
    pub async fn create_study(&self, new: NewStudy) -> Result<Study> {
        StudyActiveModel {
            external_id: Set(new.external_id),
            external_repo: Set(new.external_repo),
            name: Set(new.name),
            description: Set(new.description),
            availability: Set(new.availability.unwrap_or(true)),
            note: Set(new.note),
            ..Default::default()
        }
        .insert(self.conn())
        .await
        .map_err(Into::into)
    }

    /// Get a study by external id, creating it or refreshing changed fields
    pub async fn get_or_create_study(&self, new: NewStudy) -> Result<Study> {
        let Some(existing) = self.find_study_by_external_id(&new.external_id).await? else {
            return self.create_study(new).await;
        };

        let mut active: StudyActiveModel = existing.clone().into();
        let mut changed = false;
        if new.name != existing.name && !new.name.is_empty() {
            active.name = Set(new.name);
            changed = true;
        }
        if new.description.is_some() && new.description != existing.description {
            active.description = Set(new.description);
            changed = true;
        }
        if new.external_repo.is_some() && new.external_repo != existing.external_repo {
            active.external_repo = Set(new.external_repo);
            changed = true;
        }
        if let Some(availability) = new.availability.filter(|a| *a != existing.availability) {
            active.availability = Set(availability);
            changed = true;
        }
        if new.note.is_some() && new.note != existing.note {
            active.note = Set(new.note);
            changed = true;
        }

        if changed {
            active.update(self.conn()).await.map_err(Into::into)
        } else {
            Ok(existing)
        }
    }

    // ========================================================================
    // Pipeline Operations
    // ========================================================================

    /// Get a pipeline by external URL, creating it when missing
    pub async fn get_or_create_pipeline(
        &self,
        external_url: &str,
        name: &str,
        description: Option<String>,
    ) -> Result<Pipeline> {
        let existing = PipelineEntity::find()
            .filter(PipelineColumn::ExternalUrl.eq(external_url))
            .one(self.conn())
            .await?;

        match existing {
            Some(pipeline) if pipeline.name == name && (description.is_none() || pipeline.description == description) => {
                Ok(pipeline)
            }
            Some(pipeline) => {
                let mut active: PipelineActiveModel = pipeline.into();
                active.name = Set(name.to_string());
                if description.is_some() {
                    active.description = Set(description);
                }
                active.update(self.conn()).await.map_err(Into::into)
            }
            None => PipelineActiveModel {
                name: Set(name.to_string()),
                description: Set(description),
                external_url: Set(external_url.to_string()),
                ..Default::default()
            }
            .insert(self.conn())
            .await
            .map_err(Into::into),
        }
    }

    // ========================================================================
    // Assay Operations
    // ========================================================================

    /// Find assay by ID
    pub async fn find_assay(&self, id: i64) -> Result<Option<Assay>> {
        AssayEntity::find_by_id(id)
            .one(self.conn())
            .await
            .map_err(Into::into)
    }

    /// Find assay by external id
    pub async fn find_assay_by_external_id(&self, external_id: &str) -> Result<Option<Assay>> {
        AssayEntity::find()
            .filter(AssayColumn::ExternalId.eq(external_id))
            .one(self.conn())
            .await
            .map_err(Into::into)
    }

    /// Create an assay under a study and pipeline
    pub async fn create_assay(&self, study_id: i64, pipeline_id: i64, new: NewAssay) -> Result<Assay> {
        AssayActiveModel {
            external_id: Set(new.external_id),
            kind: Set(new.kind),
            target: Set(new.target),
            name: Set(new.name),
            tissue: Set(new.tissue),
            cell_type: Set(new.cell_type),
            treatment: Set(new.treatment),
            date: Set(new.date),
            platform: Set(new.platform),
            kit: Set(new.kit),
            description: Set(new.description),
            availability: Set(new.availability.unwrap_or(true)),
            note: Set(new.note),
            assemblies: Set(None),
            interval_count: Set(None),
            signal_nonzero: Set(None),
            signal_zero: Set(None),
            cell_total: Set(None),
            study_id: Set(study_id),
            pipeline_id: Set(pipeline_id),
            ..Default::default()
        }
        .insert(self.conn())
        .await
        .map_err(Into::into)
    }

    // ========================================================================
    // Assembly Operations
    // ========================================================================

    /// Find assembly by ID
    pub async fn find_assembly(&self, id: i64) -> Result<Option<Assembly>> {
        AssemblyEntity::find_by_id(id)
            .one(self.conn())
            .await
            .map_err(Into::into)
    }

    /// Get an assembly by name and version, creating it when missing
    pub async fn get_or_create_assembly(
        &self,
        name: &str,
        version: &str,
        species: Option<String>,
    ) -> Result<Assembly> {
        let existing = AssemblyEntity::find()
            .filter(AssemblyColumn::Name.eq(name))
            .filter(AssemblyColumn::Version.eq(version))
            .one(self.conn())
            .await?;
        if let Some(assembly) = existing {
            return Ok(assembly);
        }

        AssemblyActiveModel {
            name: Set(name.to_string()),
            version: Set(version.to_string()),
            species: Set(species),
            ..Default::default()
        }
        .insert(self.conn())
        .await
        .map_err(Into::into)
    }

    // ========================================================================
    // Import Lookups
    // ========================================================================

    /// External id to internal id of every interval of an assembly, in id order
    pub async fn interval_keys(&self, assembly_id: i64) -> Result<Vec<(String, i64)>> {
        IntervalEntity::find()
            .select_only()
            .column(IntervalColumn::ExternalId)
            .column(IntervalColumn::Id)
            .filter(IntervalColumn::AssemblyId.eq(assembly_id))
            .order_by_asc(IntervalColumn::Id)
            .into_tuple::<(String, i64)>()
            .all(self.conn())
            .await
            .map_err(Into::into)
    }

    /// Name to internal id of every cell of an assay, in id order
    pub async fn cell_keys(&self, assay_id: i64) -> Result<Vec<(String, i64)>> {
        CellEntity::find()
            .select_only()
            .column(CellColumn::Name)
            .column(CellColumn::Id)
            .filter(CellColumn::AssayId.eq(assay_id))
            .order_by_asc(CellColumn::Id)
            .into_tuple::<(String, i64)>()
            .all(self.conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Row count of every table
    pub async fn table_counts(&self) -> Result<TableCounts> {
        let mut conn = self.pool.sqlx().acquire().await?;
        TableCounts::fetch(&mut conn, "main").await
    }

    /// Row counts a filtered export of `filter` would contain, evaluated live
    pub async fn filtered_counts(&self, filter: &FilterPredicate) -> Result<TableCounts> {
        let mut conn = self.pool.sqlx().acquire().await?;
        filter.count(&mut conn, "main").await
    }
}
