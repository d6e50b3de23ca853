//! Assembly entity: reference genome version

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "assembly")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(column_type = "Text")]
    pub name: String,

    #[sea_orm(column_type = "Text")]
    pub version: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub species: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::interval::Entity")]
    Interval,
}

impl Related<super::interval::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Interval.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
