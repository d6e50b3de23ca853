//! Per-table CSV files

use crate::db::schema::{column_list, quote, TableDef};
use crate::errors::Result;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};
use std::io::BufWriter;
use std::path::Path;

/// Write every row of `table` (ordered by id) to `dest` with a header line.
/// Returns the number of data rows.
pub async fn dump_table(conn: &mut SqliteConnection, table: &TableDef, dest: &Path) -> Result<u64> {
    let mut writer = csv::Writer::from_writer(BufWriter::new(std::fs::File::create(dest)?));
    writer.write_record(table.columns)?;

    let sql = format!(
        "SELECT {} FROM main.{} ORDER BY \"id\"",
        column_list(table.columns, None),
        quote(table.name)
    );
    let mut rows = sqlx::query(&sql).fetch(&mut *conn);
    let mut record = Vec::with_capacity(table.columns.len());
    let mut written = 0u64;

    while let Some(row) = rows.try_next().await? {
        record.clear();
        for i in 0..table.columns.len() {
            record.push(cell_text(&row, i)?);
        }
        writer.write_record(&record)?;
        written += 1;
    }

    writer.flush()?;
    Ok(written)
}

/// Render one value by its storage class; NULL is the empty string
fn cell_text(row: &SqliteRow, index: usize) -> Result<String> {
    let storage = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(String::new());
        }
        raw.type_info().name().to_string()
    };

    Ok(match storage.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(index)?.to_string(),
        "REAL" => row.try_get_unchecked::<f64, _>(index)?.to_string(),
        "BLOB" => hex::encode(row.try_get_unchecked::<Vec<u8>, _>(index)?),
        _ => row.try_get_unchecked::<String, _>(index)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::STUDY;
    use crate::db::{open_file, FileMode};

    #[tokio::test]
    async fn test_dump_table_renders_nulls_and_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_file(&dir.path().join("t.sqlite3"), FileMode::Create).await.unwrap();
        sqlx::query(STUDY.create).execute(&mut conn).await.unwrap();
        sqlx::query("INSERT INTO study (external_id, name, availability) VALUES ('GSE1', 'a, b', 0)")
            .execute(&mut conn)
            .await
            .unwrap();

        let dest = dir.path().join("study.csv");
        let n = dump_table(&mut conn, &STUDY, &dest).await.unwrap();
        assert_eq!(n, 1);

        let text = std::fs::read_to_string(dest).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,external_id,external_repo,name,description,availability,note"
        );
        assert_eq!(lines.next().unwrap(), "1,GSE1,,\"a, b\",,0,");
    }
}
