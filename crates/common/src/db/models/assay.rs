//! Assay entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "assay")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(column_type = "Text", unique)]
    pub external_id: String,

    #[sea_orm(column_name = "type", column_type = "Text")]
    pub kind: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub target: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub name: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub tissue: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub cell_type: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub treatment: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub date: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub platform: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub kit: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    pub availability: bool,

    #[sea_orm(column_type = "Text", nullable)]
    pub note: Option<String>,

    /// Comma separated ids of assemblies this assay has imported against
    #[sea_orm(column_type = "Text", nullable)]
    pub assemblies: Option<String>,

    pub interval_count: Option<i64>,

    pub signal_nonzero: Option<i64>,

    pub signal_zero: Option<i64>,

    pub cell_total: Option<i64>,

    pub study_id: i64,

    pub pipeline_id: i64,
}

impl Model {
    /// Assembly ids recorded in `assemblies`
    pub fn assembly_ids(&self) -> Vec<i64> {
        self.assemblies
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::study::Entity",
        from = "Column::StudyId",
        to = "super::study::Column::Id",
        on_delete = "Cascade"
    )]
    Study,

    #[sea_orm(
        belongs_to = "super::pipeline::Entity",
        from = "Column::PipelineId",
        to = "super::pipeline::Column::Id",
        on_delete = "Cascade"
    )]
    Pipeline,

    #[sea_orm(has_many = "super::cell::Entity")]
    Cell,

    #[sea_orm(has_many = "super::signal::Entity")]
    Signal,
}

impl Related<super::study::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Study.def()
    }
}

impl Related<super::pipeline::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Pipeline.def()
    }
}

impl Related<super::cell::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Cell.def()
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
    fn test_assembly_ids() {
        let mut assay = Model {
            id: 1,
            external_id: "A1".into(),
            kind: "scRNA-seq".into(),
            target: None,
            name: "a".into(),
            tissue: None,
            cell_type: None,
            treatment: "none".into(),
            date: None,
            platform: "10x".into(),
            kit: None,
            description: None,
            availability: true,
            note: None,
            assemblies: None,
            interval_count: None,
            signal_nonzero: None,
            signal_zero: None,
            cell_total: None,
            study_id: 1,
            pipeline_id: 1,
        };
        assert!(assay.assembly_ids().is_empty());

        assay.assemblies = Some("3, 7,x".into());
        assert_eq!(assay.assembly_ids(), vec![3, 7]);
    }
}
