//! Signal entity: one measurement tying an interval to an assay

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "signal")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(column_type = "Double")]
    pub signal: f64,

    #[sea_orm(column_type = "Double", nullable)]
    pub p_value: Option<f64>,

    #[sea_orm(column_type = "Double", nullable)]
    pub padj_value: Option<f64>,

    pub assay_id: i64,

    pub interval_id: i64,

    pub cell_id: Option<i64>,
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

    #[sea_orm(
        belongs_to = "super::interval::Entity",
        from = "Column::IntervalId",
        to = "super::interval::Column::Id",
        on_delete = "Cascade"
    )]
    Interval,

    #[sea_orm(
        belongs_to = "super::cell::Entity",
        from = "Column::CellId",
        to = "super::cell::Column::Id",
        on_delete = "SetNull"
    )]
    Cell,
}

impl Related<super::assay::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Assay.def()
    }
}

impl Related<super::interval::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Interval.def()
    }
}

impl Related<super::cell::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Cell.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
