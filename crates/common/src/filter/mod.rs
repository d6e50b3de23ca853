//! Export filter predicates
//!
//! A `FilterPredicate` is a conjunction of per-field constraints parsed from
//! the browse/export query vocabulary. It compiles to id selections over any
//! attached schema, so an export copy and a live count share one definition.

use crate::db::models::CellKind;
use crate::db::schema::quote;
use crate::db::TableCounts;
use crate::errors::{AppError, Result};
use serde_json::{Map, Value};
use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::{Row, SqliteConnection};

/// Entity a filter field constrains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Study,
    Assay,
    Cell,
    Interval,
    Assembly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Availability,
    CellKind,
}

#[derive(Debug, PartialEq)]
struct FieldDef {
    param: &'static str,
    aliases: &'static [&'static str],
    scope: Scope,
    column: &'static str,
    kind: FieldKind,
}

static FIELDS: &[FieldDef] = &[
    FieldDef { param: "study_name", aliases: &[], scope: Scope::Study, column: "name", kind: FieldKind::Text },
    FieldDef { param: "study_external_id", aliases: &[], scope: Scope::Study, column: "external_id", kind: FieldKind::Text },
    FieldDef { param: "study_note", aliases: &[], scope: Scope::Study, column: "note", kind: FieldKind::Text },
    FieldDef { param: "study_availability", aliases: &[], scope: Scope::Study, column: "availability", kind: FieldKind::Availability },
    FieldDef { param: "assay_name", aliases: &[], scope: Scope::Assay, column: "name", kind: FieldKind::Text },
    FieldDef { param: "assay_external_id", aliases: &[], scope: Scope::Assay, column: "external_id", kind: FieldKind::Text },
    FieldDef { param: "assay_type", aliases: &[], scope: Scope::Assay, column: "type", kind: FieldKind::Text },
    FieldDef { param: "assay_target", aliases: &[], scope: Scope::Assay, column: "target", kind: FieldKind::Text },
    FieldDef { param: "tissue", aliases: &[], scope: Scope::Assay, column: "tissue", kind: FieldKind::Text },
    FieldDef { param: "assay_cell_type", aliases: &["cell_type"], scope: Scope::Assay, column: "cell_type", kind: FieldKind::Text },
    FieldDef { param: "treatment", aliases: &[], scope: Scope::Assay, column: "treatment", kind: FieldKind::Text },
    FieldDef { param: "platform", aliases: &[], scope: Scope::Assay, column: "platform", kind: FieldKind::Text },
    FieldDef { param: "assay_availability", aliases: &[], scope: Scope::Assay, column: "availability", kind: FieldKind::Availability },
    FieldDef { param: "cell_kind", aliases: &[], scope: Scope::Cell, column: "type", kind: FieldKind::CellKind },
    FieldDef { param: "cell_label", aliases: &[], scope: Scope::Cell, column: "label", kind: FieldKind::Text },
    FieldDef { param: "interval_type", aliases: &[], scope: Scope::Interval, column: "type", kind: FieldKind::Text },
    FieldDef { param: "biotype", aliases: &[], scope: Scope::Interval, column: "biotype", kind: FieldKind::Text },
    FieldDef { param: "assembly_name", aliases: &[], scope: Scope::Assembly, column: "name", kind: FieldKind::Text },
    FieldDef { param: "assembly_species", aliases: &[], scope: Scope::Assembly, column: "species", kind: FieldKind::Text },
];

fn field_for(key: &str) -> Option<&'static FieldDef> {
    let key = key.strip_suffix("[]").unwrap_or(key);
    FIELDS
        .iter()
        .find(|f| f.param == key || f.aliases.contains(&key))
}

/// Parse an availability selector. `None` means no constraint.
pub fn parse_availability(raw: &str) -> Result<Option<bool>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "all" | "any" => Ok(None),
        "1" | "true" | "yes" | "available" | "t" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "unavailable" | "f" | "off" => Ok(Some(false)),
        other => Err(AppError::Validation {
            message: format!("invalid availability value '{}'", other),
            field: None,
        }),
    }
}

/// Parse a boolean request flag (`1/true/yes/on`, `0/false/no/off`)
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "t" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "f" | "off" | "" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Constraint {
    OneOf(Vec<String>),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq)]
struct FieldConstraint {
    field: &'static FieldDef,
    constraint: Constraint,
}

/// Bound SQL parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Bool(bool),
}

/// SQL text with its positional parameters, built in lockstep
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl SqlFragment {
    fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    fn append(&mut self, other: SqlFragment) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
        self
    }

    /// Bind every parameter onto a query built from this fragment
    pub fn bind<'q>(
        &'q self,
        mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        for param in &self.params {
            query = match param {
                SqlParam::Text(s) => query.bind(s.as_str()),
                SqlParam::Bool(b) => query.bind(*b),
            };
        }
        query
    }
}

/// Conjunction of per-field constraints
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPredicate {
    constraints: Vec<FieldConstraint>,
}

impl FilterPredicate {
    /// Build from raw query pairs. Keys outside the filter vocabulary are
    /// ignored, repeated keys and `key[]` accumulate, empty values add nothing.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut predicate = FilterPredicate::default();
        for (key, value) in pairs {
            let Some(field) = field_for(key.as_ref()) else {
                continue;
            };
            predicate.add(field, value.as_ref())?;
        }
        Ok(predicate)
    }

    fn add(&mut self, field: &'static FieldDef, raw: &str) -> Result<()> {
        let raw = raw.trim();
        match field.kind {
            FieldKind::Availability => {
                let Some(flag) = parse_availability(raw).map_err(|_| AppError::Validation {
                    message: format!("invalid value '{}' for {}", raw, field.param),
                    field: Some(field.param.to_string()),
                })?
                else {
                    return Ok(());
                };
                self.constraints.retain(|c| c.field.param != field.param);
                self.constraints.push(FieldConstraint {
                    field,
                    constraint: Constraint::Flag(flag),
                });
            }
            FieldKind::Text | FieldKind::CellKind => {
                if raw.is_empty() {
                    return Ok(());
                }
                let value = if field.kind == FieldKind::CellKind {
                    CellKind::parse(raw)
                        .ok_or_else(|| AppError::Validation {
                            message: format!("invalid cell kind '{}'", raw),
                            field: Some(field.param.to_string()),
                        })?
                        .as_str()
                        .to_string()
                } else {
                    raw.to_string()
                };

                match self.constraints.iter_mut().find(|c| c.field.param == field.param) {
                    Some(FieldConstraint {
                        constraint: Constraint::OneOf(values),
                        ..
                    }) => {
                        if !values.contains(&value) {
                            values.push(value);
                        }
                    }
                    _ => self.constraints.push(FieldConstraint {
                        field,
                        constraint: Constraint::OneOf(vec![value]),
                    }),
                }
            }
        }
        Ok(())
    }

    /// True when no field is constrained
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    fn has_scope(&self, scopes: &[Scope]) -> bool {
        self.constraints.iter().any(|c| scopes.contains(&c.field.scope))
    }

    /// The predicate as a JSON object of parameter name to value(s)
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for c in &self.constraints {
            let value = match &c.constraint {
                Constraint::OneOf(values) if values.len() == 1 => Value::String(values[0].clone()),
                Constraint::OneOf(values) => {
                    Value::Array(values.iter().cloned().map(Value::String).collect())
                }
                Constraint::Flag(b) => Value::Bool(*b),
            };
            map.insert(c.field.param.to_string(), value);
        }
        Value::Object(map)
    }

    /// ` AND alias."col" IN (?, ..)` for each constraint of `scope`
    fn conditions(&self, scope: Scope, alias: &str) -> SqlFragment {
        let mut out = SqlFragment::default();
        for c in self.constraints.iter().filter(|c| c.field.scope == scope) {
            let column = format!("{}.{}", alias, quote(c.field.column));
            match &c.constraint {
                Constraint::OneOf(values) => {
                    let marks = vec!["?"; values.len()].join(", ");
                    out.push(&format!(" AND {} IN ({})", column, marks));
                    out.params
                        .extend(values.iter().cloned().map(SqlParam::Text));
                }
                Constraint::Flag(flag) => {
                    out.push(&format!(" AND {} = ?", column));
                    out.params.push(SqlParam::Bool(*flag));
                }
            }
        }
        out
    }

    fn base_studies(&self, s: &str) -> SqlFragment {
        let mut f = SqlFragment::default();
        f.push(&format!("SELECT st.\"id\" FROM {}.\"study\" st WHERE 1 = 1", s));
        f.append(self.conditions(Scope::Study, "st"));
        f
    }

    fn base_assays(&self, s: &str) -> SqlFragment {
        let mut f = SqlFragment::default();
        f.push(&format!(
            "SELECT a.\"id\" FROM {}.\"assay\" a WHERE a.\"study_id\" IN (",
            s
        ));
        f.append(self.base_studies(s));
        f.push(")");
        f.append(self.conditions(Scope::Assay, "a"));
        f
    }

    /// Selected signals as `(id, assay_id, interval_id, cell_id)` rows
    fn signals(&self, s: &str, columns: &str) -> SqlFragment {
        let mut f = SqlFragment::default();
        f.push(&format!(
            "SELECT {} FROM {}.\"signal\" sig WHERE sig.\"assay_id\" IN (",
            columns, s
        ));
        f.append(self.base_assays(s));
        f.push(")");

        if self.has_scope(&[Scope::Cell]) {
            f.push(&format!(
                " AND sig.\"cell_id\" IN (SELECT c.\"id\" FROM {}.\"cell\" c WHERE 1 = 1",
                s
            ));
            f.append(self.conditions(Scope::Cell, "c"));
            f.push(")");
        }

        if self.has_scope(&[Scope::Interval, Scope::Assembly]) {
            f.push(&format!(
                " AND sig.\"interval_id\" IN (SELECT i.\"id\" FROM {s}.\"interval\" i \
                 JOIN {s}.\"assembly\" asm ON asm.\"id\" = i.\"assembly_id\" WHERE 1 = 1",
                s = s
            ));
            f.append(self.conditions(Scope::Interval, "i"));
            f.append(self.conditions(Scope::Assembly, "asm"));
            f.push(")");
        }
        f
    }

    fn assays(&self, s: &str) -> SqlFragment {
        if !self.has_scope(&[Scope::Cell, Scope::Interval, Scope::Assembly]) {
            return self.base_assays(s);
        }
        let mut f = SqlFragment::default();
        f.push("SELECT DISTINCT sig.\"assay_id\" FROM (");
        f.append(self.signals(s, "sig.\"assay_id\""));
        f.push(") sig");
        f
    }

    /// Ids of `table` rows belonging to the filtered subset, read from schema `s`
    pub fn selection(&self, table: &str, s: &str) -> Result<SqlFragment> {
        let mut f = SqlFragment::default();
        match table {
            "study" => {
                f.append(self.base_studies(s));
                if self.has_scope(&[Scope::Assay, Scope::Cell, Scope::Interval, Scope::Assembly]) {
                    f.push(&format!(
                        " AND st.\"id\" IN (SELECT a2.\"study_id\" FROM {}.\"assay\" a2 WHERE a2.\"id\" IN (",
                        s
                    ));
                    f.append(self.assays(s));
                    f.push("))");
                }
            }
            "assay" => {
                f.append(self.assays(s));
            }
            "pipeline" => {
                f.push(&format!(
                    "SELECT DISTINCT a3.\"pipeline_id\" FROM {}.\"assay\" a3 WHERE a3.\"id\" IN (",
                    s
                ));
                f.append(self.assays(s));
                f.push(")");
            }
            "signal" => {
                f.append(self.signals(s, "sig.\"id\""));
            }
            "interval" => {
                f.push("SELECT DISTINCT sel.\"interval_id\" FROM (");
                f.append(self.signals(s, "sig.\"interval_id\""));
                f.push(") sel");
            }
            "cell" => {
                f.push("SELECT DISTINCT sel.\"cell_id\" FROM (");
                f.append(self.signals(s, "sig.\"cell_id\""));
                f.push(") sel WHERE sel.\"cell_id\" IS NOT NULL");
            }
            "assembly" => {
                f.push(&format!(
                    "SELECT DISTINCT i2.\"assembly_id\" FROM {}.\"interval\" i2 WHERE i2.\"id\" IN (",
                    s
                ));
                f.append(self.signals(s, "sig.\"interval_id\""));
                f.push(")");
            }
            other => {
                return Err(AppError::Validation {
                    message: format!("unknown table '{}'", other),
                    field: Some("table".into()),
                })
            }
        }
        Ok(f)
    }

    /// Number of `table` rows in the filtered subset
    pub async fn count_table(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        s: &str,
    ) -> Result<i64> {
        let selection = self.selection(table, s)?;
        let mut f = SqlFragment::default();
        f.push(&format!(
            "SELECT COUNT(*) FROM {}.{} WHERE \"id\" IN (",
            s,
            quote(table)
        ));
        f.append(selection);
        f.push(")");

        let row = f.bind(sqlx::query(&f.sql)).fetch_one(&mut *conn).await?;
        Ok(row.try_get(0)?)
    }

    /// Row counts of the filtered subset for every table
    pub async fn count(&self, conn: &mut SqliteConnection, s: &str) -> Result<TableCounts> {
        Ok(TableCounts {
            study: self.count_table(conn, "study", s).await?,
            pipeline: self.count_table(conn, "pipeline", s).await?,
            assay: self.count_table(conn, "assay", s).await?,
            assembly: self.count_table(conn, "assembly", s).await?,
            interval: self.count_table(conn, "interval", s).await?,
            cell: self.count_table(conn, "cell", s).await?,
            signal: self.count_table(conn, "signal", s).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pairs_accumulates_and_ignores_unknown() {
        let predicate = FilterPredicate::from_pairs(vec![
            ("tissue", "liver"),
            ("tissue[]", "brain"),
            ("tissue", "liver"),
            ("export_format", "zip"),
            ("assay_type", ""),
            ("study_availability", "all"),
        ])
        .unwrap();

        assert_eq!(
            predicate.to_json(),
            serde_json::json!({ "tissue": ["liver", "brain"] })
        );
    }

    #[test]
    fn test_availability_and_cell_kind_normalization() {
        let predicate = FilterPredicate::from_pairs(vec![
            ("assay_availability", "unavailable"),
            ("cell_kind", "Single-Cell"),
            ("cell_type", "hepatocyte"),
        ])
        .unwrap();

        assert_eq!(
            predicate.to_json(),
            serde_json::json!({
                "assay_availability": false,
                "cell_kind": "cell",
                "assay_cell_type": "hepatocyte",
            })
        );

        assert!(FilterPredicate::from_pairs(vec![("study_availability", "maybe")]).is_err());
        assert!(FilterPredicate::from_pairs(vec![("cell_kind", "nucleus")]).is_err());
    }

    #[test]
    fn test_selection_params_follow_placeholders() {
        let predicate = FilterPredicate::from_pairs(vec![
            ("study_name", "S"),
            ("platform", "10x"),
            ("platform", "Illumina"),
            ("biotype", "protein_coding"),
        ])
        .unwrap();

        for table in ["study", "pipeline", "assay", "assembly", "interval", "cell", "signal"] {
            let f = predicate.selection(table, "source").unwrap();
            assert_eq!(f.sql.matches('?').count(), f.params.len(), "{}", table);
            assert!(f.sql.contains("source."), "{}", table);
        }
        assert!(predicate.selection("users", "main").is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag(""), Some(false));
        assert_eq!(parse_flag("perhaps"), None);
    }
}
