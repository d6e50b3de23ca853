//! Relational schema of the catalog
//!
//! Tables are created idempotently at start-up. The same definitions build
//! export targets and drive restore column mapping.

use crate::errors::Result;
use sea_orm::ConnectionTrait;

/// One catalog table
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    /// Every column, in declaration order
    pub columns: &'static [&'static str],
    /// Columns a snapshot must carry to be restorable
    pub required: &'static [&'static str],
    pub create: &'static str,
}

pub const STUDY: TableDef = TableDef {
    name: "study",
    columns: &["id", "external_id", "external_repo", "name", "description", "availability", "note"],
    required: &["id", "external_id", "name"],
    create: r#"CREATE TABLE IF NOT EXISTS "study" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "external_id" TEXT NOT NULL UNIQUE,
    "external_repo" TEXT,
    "name" TEXT NOT NULL,
    "description" TEXT,
    "availability" BOOLEAN NOT NULL DEFAULT 1,
    "note" TEXT
)"#,
};

pub const PIPELINE: TableDef = TableDef {
    name: "pipeline",
    columns: &["id", "name", "description", "external_url"],
    required: &["id", "name", "external_url"],
    create: r#"CREATE TABLE IF NOT EXISTS "pipeline" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "name" TEXT NOT NULL,
    "description" TEXT,
    "external_url" TEXT NOT NULL
)"#,
};

pub const ASSAY: TableDef = TableDef {
    name: "assay",
    columns: &[
        "id", "external_id", "type", "target", "name", "tissue", "cell_type", "treatment",
        "date", "platform", "kit", "description", "availability", "note", "assemblies",
        "interval_count", "signal_nonzero", "signal_zero", "cell_total", "study_id",
        "pipeline_id",
    ],
    required: &[
        "id", "external_id", "type", "name", "treatment", "platform", "study_id", "pipeline_id",
    ],
    create: r#"CREATE TABLE IF NOT EXISTS "assay" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "external_id" TEXT NOT NULL UNIQUE,
    "type" TEXT NOT NULL,
    "target" TEXT,
    "name" TEXT NOT NULL,
    "tissue" TEXT,
    "cell_type" TEXT,
    "treatment" TEXT NOT NULL,
    "date" TEXT,
    "platform" TEXT NOT NULL,
    "kit" TEXT,
    "description" TEXT,
    "availability" BOOLEAN NOT NULL DEFAULT 1,
    "note" TEXT,
    "assemblies" TEXT,
    "interval_count" INTEGER,
    "signal_nonzero" INTEGER,
    "signal_zero" INTEGER,
    "cell_total" INTEGER,
    "study_id" INTEGER NOT NULL REFERENCES "study" ("id") ON DELETE CASCADE,
    "pipeline_id" INTEGER NOT NULL REFERENCES "pipeline" ("id") ON DELETE CASCADE
)"#,
};

pub const ASSEMBLY: TableDef = TableDef {
    name: "assembly",
    columns: &["id", "name", "version", "species"],
    required: &["id", "name", "version"],
    create: r#"CREATE TABLE IF NOT EXISTS "assembly" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "name" TEXT NOT NULL,
    "version" TEXT NOT NULL,
    "species" TEXT
)"#,
};

pub const INTERVAL: TableDef = TableDef {
    name: "interval",
    columns: &[
        "id", "external_id", "parental_id", "name", "type", "biotype", "chromosome", "start",
        "end", "strand", "summit", "assembly_id",
    ],
    required: &["id", "external_id", "type", "chromosome", "start", "strand", "assembly_id"],
    create: r#"CREATE TABLE IF NOT EXISTS "interval" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "external_id" TEXT NOT NULL,
    "parental_id" TEXT,
    "name" TEXT,
    "type" TEXT NOT NULL,
    "biotype" TEXT,
    "chromosome" TEXT NOT NULL,
    "start" INTEGER NOT NULL,
    "end" INTEGER,
    "strand" TEXT NOT NULL,
    "summit" INTEGER,
    "assembly_id" INTEGER NOT NULL REFERENCES "assembly" ("id") ON DELETE CASCADE
)"#,
};

pub const CELL: TableDef = TableDef {
    name: "cell",
    columns: &[
        "id", "name", "type", "label", "x_coordinate", "y_coordinate", "z_coordinate", "assay_id",
    ],
    required: &["id", "name", "type", "assay_id"],
    create: r#"CREATE TABLE IF NOT EXISTS "cell" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "name" TEXT NOT NULL,
    "type" TEXT NOT NULL,
    "label" TEXT,
    "x_coordinate" INTEGER,
    "y_coordinate" INTEGER,
    "z_coordinate" INTEGER,
    "assay_id" INTEGER NOT NULL REFERENCES "assay" ("id") ON DELETE CASCADE
)"#,
};

pub const SIGNAL: TableDef = TableDef {
    name: "signal",
    columns: &["id", "signal", "p_value", "padj_value", "assay_id", "interval_id", "cell_id"],
    required: &["id", "signal", "assay_id", "interval_id"],
    create: r#"CREATE TABLE IF NOT EXISTS "signal" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "signal" REAL NOT NULL,
    "p_value" REAL,
    "padj_value" REAL,
    "assay_id" INTEGER NOT NULL REFERENCES "assay" ("id") ON DELETE CASCADE,
    "interval_id" INTEGER NOT NULL REFERENCES "interval" ("id") ON DELETE CASCADE,
    "cell_id" INTEGER REFERENCES "cell" ("id") ON DELETE SET NULL
)"#,
};

/// Parent-first order: every table appears after the tables it references
pub const TABLES: [TableDef; 7] = [STUDY, PIPELINE, ASSAY, ASSEMBLY, INTERVAL, CELL, SIGNAL];

/// Secondary indexes used by import lookups and filtered exports
pub const INDEXES: &[&str] = &[
    r#"CREATE INDEX IF NOT EXISTS "idx_assay_study" ON "assay" ("study_id")"#,
    r#"CREATE INDEX IF NOT EXISTS "idx_assay_pipeline" ON "assay" ("pipeline_id")"#,
    r#"CREATE INDEX IF NOT EXISTS "idx_interval_assembly_external" ON "interval" ("assembly_id", "external_id")"#,
    r#"CREATE INDEX IF NOT EXISTS "idx_interval_type" ON "interval" ("type")"#,
    r#"CREATE INDEX IF NOT EXISTS "idx_cell_assay_name" ON "cell" ("assay_id", "name")"#,
    r#"CREATE INDEX IF NOT EXISTS "idx_cell_type" ON "cell" ("type")"#,
    r#"CREATE INDEX IF NOT EXISTS "idx_signal_assay" ON "signal" ("assay_id")"#,
    r#"CREATE INDEX IF NOT EXISTS "idx_signal_interval" ON "signal" ("interval_id")"#,
    r#"CREATE INDEX IF NOT EXISTS "idx_signal_cell" ON "signal" ("cell_id")"#,
];

/// Look up a table by name
pub fn table(name: &str) -> Option<&'static TableDef> {
    TABLES.iter().find(|t| t.name == name)
}

/// Table names in parent-first order
pub fn table_names() -> impl Iterator<Item = &'static str> {
    TABLES.iter().map(|t| t.name)
}

/// Double-quoted identifier
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Comma separated quoted column list, optionally qualified by an alias
pub fn column_list(columns: &[&str], alias: Option<&str>) -> String {
    columns
        .iter()
        .map(|c| match alias {
            Some(a) => format!("{}.{}", a, quote(c)),
            None => quote(c),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Create every table and index if missing
pub async fn ensure_schema<C: ConnectionTrait>(conn: &C) -> Result<()> {
    for table in TABLES.iter() {
        conn.execute_unprepared(table.create).await?;
    }
    for index in INDEXES {
        conn.execute_unprepared(index).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_columns_are_declared() {
        for table in TABLES.iter() {
            for col in table.required {
                assert!(table.columns.contains(col), "{}.{}", table.name, col);
            }
            for col in table.columns {
                assert!(table.create.contains(&quote(col)), "{}.{}", table.name, col);
            }
        }
    }

    #[test]
    fn test_parent_first_order() {
        let pos = |n: &str| TABLES.iter().position(|t| t.name == n).unwrap();
        assert!(pos("study") < pos("assay"));
        assert!(pos("pipeline") < pos("assay"));
        assert!(pos("assembly") < pos("interval"));
        assert!(pos("assay") < pos("cell"));
        assert!(pos("interval") < pos("signal"));
        assert!(pos("cell") < pos("signal"));
    }

    #[test]
    fn test_column_list_quotes_keywords() {
        assert_eq!(column_list(&["start", "end"], Some("i")), r#"i."start", i."end""#);
        assert_eq!(quote("end"), "\"end\"");
    }
}
