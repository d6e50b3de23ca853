//! Cell entity: a single cell or spatial spot measured by an assay

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Stored value of `cell.type`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Cell,
    Spot,
}

impl CellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Cell => "cell",
            CellKind::Spot => "spot",
        }
    }

    /// Normalize the spellings found in exported matrices and filter input
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cell" | "single cell" | "single-cell" | "singlecell" | "sc" => Some(CellKind::Cell),
            "spot" | "srt" | "spatial" => Some(CellKind::Spot),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cell")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(column_type = "Text")]
    pub name: String,

    #[sea_orm(column_name = "type", column_type = "Text")]
    pub kind: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub label: Option<String>,

    pub x_coordinate: Option<i64>,

    pub y_coordinate: Option<i64>,

    pub z_coordinate: Option<i64>,

    pub assay_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::assay::Entity",
        from = "Column::AssayId",
        to = "super::assay::Column::Id",
        on_delete = "Cascade"
    )]
    Assay,

    #[sea_orm(has_many = "super::signal::Entity")]
    Signal,
}

impl Related<super::assay::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Assay.def()
    }
}

impl Related<super::signal::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Signal.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_kind_spellings() {
        assert_eq!(CellKind::parse("Single-Cell"), Some(CellKind::Cell));
        assert_eq!(CellKind::parse(" srt "), Some(CellKind::Spot));
        assert_eq!(CellKind::parse("spot"), Some(CellKind::Spot));
        assert_eq!(CellKind::parse("nucleus"), None);
    }
}
