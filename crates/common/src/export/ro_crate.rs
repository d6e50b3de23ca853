//! RO-Crate 1.2 metadata manifest
//!
//! Describes the data files of an export: per-table schemas with key
//! relationships, row counts and the filter that selected the rows.

use crate::db::schema::TABLES;
use crate::db::TableCounts;
use crate::errors::Result;
use crate::export::archive::{entry_name, sha256_file};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqliteConnection;
use std::path::PathBuf;

pub const MANIFEST_NAME: &str = "ro-crate-metadata.json";

const CONTEXT: &str = "https://w3id.org/ro/crate/1.2/context";
const CONFORMS_TO: &str = "https://w3id.org/ro/crate/1.2";
const LICENSE: &str = "https://creativecommons.org/publicdomain/zero/1.0/";
const KEYWORDS: &str = "high-throughput sequencing, next-generation sequencing, FAIR principles, \
    genomics, transcriptomics, single-cell RNA-seq, spatial transcriptomics, ATAC-seq";

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub table: String,
    pub references: String,
}

/// Schema of one table as stored in the artifact
#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// One data file of the crate
#[derive(Debug, Clone)]
pub struct DataFile {
    pub name: String,
    pub size: u64,
    pub sha256: String,
    pub encoding_format: &'static str,
    /// Tables whose rows the file holds
    pub tables: Vec<String>,
}

/// Read column and foreign key metadata of every catalog table in `main`
pub async fn describe_tables(conn: &mut SqliteConnection) -> Result<Vec<TableSchema>> {
    let mut out = Vec::with_capacity(TABLES.len());

    for table in TABLES.iter() {
        let columns: Vec<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?) ORDER BY cid",
        )
        .bind(table.name)
        .fetch_all(&mut *conn)
        .await?;

        let keys: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?) ORDER BY id, seq",
        )
        .bind(table.name)
        .fetch_all(&mut *conn)
        .await?;

        out.push(TableSchema {
            name: table.name.to_string(),
            columns: columns
                .into_iter()
                .map(|(name, decl_type, not_null, pk)| ColumnInfo {
                    name,
                    decl_type,
                    not_null: not_null != 0 || pk > 0,
                    primary_key: pk > 0,
                })
                .collect(),
            foreign_keys: keys
                .into_iter()
                .map(|(column, table, to)| ForeignKey {
                    column,
                    table,
                    references: to.unwrap_or_else(|| "id".to_string()),
                })
                .collect(),
        });
    }

    Ok(out)
}

/// Size, checksum and format of each file; hashing runs on a blocking thread
pub async fn describe_files(paths: Vec<PathBuf>) -> Result<Vec<DataFile>> {
    tokio::task::spawn_blocking(move || {
        paths
            .iter()
            .map(|path| {
                let name = entry_name(path)?;
                let (encoding_format, tables) = match name.rsplit_once('.') {
                    Some((stem, "csv")) => ("text/csv", vec![stem.to_string()]),
                    _ => (
                        "application/vnd.sqlite3",
                        TABLES.iter().map(|t| t.name.to_string()).collect(),
                    ),
                };
                Ok(DataFile {
                    size: std::fs::metadata(path)?.len(),
                    sha256: sha256_file(path)?,
                    name,
                    encoding_format,
                    tables,
                })
            })
            .collect::<Result<Vec<_>>>()
    })
    .await
    .map_err(|e| crate::errors::AppError::Internal {
        message: format!("checksum task failed: {}", e),
    })?
}

/// Build the `ro-crate-metadata.json` document
pub fn manifest(
    files: &[DataFile],
    tables: &[TableSchema],
    counts: &TableCounts,
    filter: &Value,
    published: DateTime<Utc>,
) -> Value {
    let filtered = filter.as_object().map(|m| !m.is_empty()).unwrap_or(false);
    let description = format!(
        "{} export of the bMINTY catalog: {} studies, {} assays, {} intervals, {} signals.",
        if filtered { "Filtered" } else { "Complete" },
        counts.study,
        counts.assay,
        counts.interval,
        counts.signal
    );

    let mut graph = vec![
        json!({
            "@id": MANIFEST_NAME,
            "@type": "CreativeWork",
            "conformsTo": {"@id": CONFORMS_TO},
            "about": {"@id": "./"}
        }),
        json!({
            "@id": "./",
            "@type": "Dataset",
            "name": "bMINTY export",
            "description": description,
            "datePublished": published.format("%Y-%m-%d").to_string(),
            "license": {"@id": LICENSE},
            "keywords": KEYWORDS,
            "creator": {"@id": "#bminty-software"},
            "hasPart": files.iter().map(|f| json!({"@id": f.name})).collect::<Vec<_>>(),
            "variableMeasured": TABLES
                .iter()
                .map(|t| json!({"@id": format!("#count-{}", t.name)}))
                .collect::<Vec<_>>(),
            "mentions": {"@id": "#export-filters"}
        }),
        json!({
            "@id": "#bminty-software",
            "@type": "SoftwareApplication",
            "name": "bMINTY",
            "version": crate::VERSION
        }),
        json!({
            "@id": LICENSE,
            "@type": "CreativeWork",
            "name": "CC0 1.0 Universal"
        }),
        json!({
            "@id": "#export-filters",
            "@type": "PropertyValue",
            "name": "Export filters",
            "propertyID": "exportFilters",
            "value": filter.to_string()
        }),
    ];

    for table in TABLES.iter() {
        graph.push(json!({
            "@id": format!("#count-{}", table.name),
            "@type": "PropertyValue",
            "name": format!("{} row count", table.name),
            "propertyID": "rowCount",
            "value": counts.get(table.name).unwrap_or(0)
        }));
    }

    for table in tables {
        let table_id = format!("#table-{}", table.name);
        let mut parts = Vec::with_capacity(table.columns.len());

        for col in &table.columns {
            let col_id = format!("{}-col-{}", table_id, col.name);
            graph.push(json!({
                "@id": col_id,
                "@type": "PropertyValue",
                "name": col.name,
                "valueReference": col.decl_type,
                "valueRequired": col.not_null,
                "additionalType": if col.primary_key { "primaryKey" } else { "column" }
            }));
            parts.push(json!({"@id": col_id}));
        }

        let mut keys = Vec::with_capacity(table.foreign_keys.len());
        for fk in &table.foreign_keys {
            let fk_id = format!("{}-fk-{}", table_id, fk.column);
            graph.push(json!({
                "@id": fk_id,
                "@type": "PropertyValue",
                "name": fk.column,
                "propertyID": "foreignKey",
                "valueReference": {"@id": format!("#table-{}-col-{}", fk.table, fk.references)}
            }));
            keys.push(json!({"@id": fk_id}));
        }

        let primary: Vec<&str> = table
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();

        graph.push(json!({
            "@id": table_id,
            "@type": "CreativeWork",
            "name": table.name,
            "description": format!("Schema of the {} table", table.name),
            "hasPart": parts,
            "primaryKey": primary,
            "foreignKeys": keys
        }));
    }

    for file in files {
        graph.push(json!({
            "@id": file.name,
            "@type": "File",
            "name": file.name,
            "encodingFormat": file.encoding_format,
            "contentSize": file.size.to_string(),
            "sha256": file.sha256,
            "conformsTo": file
                .tables
                .iter()
                .map(|t| json!({"@id": format!("#table-{}", t)}))
                .collect::<Vec<_>>()
        }));
    }

    json!({ "@context": CONTEXT, "@graph": graph })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_file, FileMode};

    fn entity<'a>(doc: &'a Value, id: &str) -> &'a Value {
        doc["@graph"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["@id"] == id)
            .unwrap_or_else(|| panic!("missing entity {}", id))
    }

    #[tokio::test]
    async fn test_describe_tables_reads_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_file(&dir.path().join("t.sqlite3"), FileMode::Create).await.unwrap();
        for table in TABLES.iter() {
            sqlx::query(table.create).execute(&mut conn).await.unwrap();
        }

        let tables = describe_tables(&mut conn).await.unwrap();
        assert_eq!(tables.len(), 7);

        let signal = tables.iter().find(|t| t.name == "signal").unwrap();
        let targets: Vec<&str> = signal.foreign_keys.iter().map(|k| k.table.as_str()).collect();
        assert!(targets.contains(&"assay"));
        assert!(targets.contains(&"interval"));
        assert!(targets.contains(&"cell"));

        let id = signal.columns.iter().find(|c| c.name == "id").unwrap();
        assert!(id.primary_key);
        let cell_id = signal.columns.iter().find(|c| c.name == "cell_id").unwrap();
        assert!(!cell_id.not_null);
    }

    #[test]
    fn test_manifest_structure() {
        let files = vec![DataFile {
            name: "study.csv".into(),
            size: 10,
            sha256: "ab".into(),
            encoding_format: "text/csv",
            tables: vec!["study".into()],
        }];
        let tables = vec![TableSchema {
            name: "study".into(),
            columns: vec![ColumnInfo {
                name: "id".into(),
                decl_type: "INTEGER".into(),
                not_null: true,
                primary_key: true,
            }],
            foreign_keys: vec![],
        }];
        let counts = TableCounts { study: 3, ..Default::default() };
        let filter = json!({"study_name": "x"});

        let doc = manifest(&files, &tables, &counts, &filter, Utc::now());

        assert_eq!(doc["@context"], CONTEXT);
        assert_eq!(entity(&doc, MANIFEST_NAME)["conformsTo"]["@id"], CONFORMS_TO);

        let root = entity(&doc, "./");
        assert_eq!(root["@type"], "Dataset");
        assert_eq!(root["hasPart"][0]["@id"], "study.csv");
        assert_eq!(root["mentions"]["@id"], "#export-filters");
        assert!(root["description"].as_str().unwrap().starts_with("Filtered"));

        assert_eq!(entity(&doc, "#count-study")["value"], 3);
        assert_eq!(entity(&doc, "#export-filters")["value"], filter.to_string());
        assert_eq!(entity(&doc, "#table-study")["primaryKey"][0], "id");
        assert_eq!(entity(&doc, "study.csv")["conformsTo"][0]["@id"], "#table-study");
    }
}
