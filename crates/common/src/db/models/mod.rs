//! SeaORM entity models
//!
//! Catalog entities mirroring the tables in `db::schema`

mod assay;
mod assembly;
mod cell;
mod interval;
mod pipeline;
mod signal;
mod study;

pub use study::{
    Entity as StudyEntity,
    Model as Study,
    ActiveModel as StudyActiveModel,
    Column as StudyColumn,
};

pub use pipeline::{
    Entity as PipelineEntity,
    Model as Pipeline,
    ActiveModel as PipelineActiveModel,
    Column as PipelineColumn,
};

pub use assay::{
    Entity as AssayEntity,
    Model as Assay,
    ActiveModel as AssayActiveModel,
    Column as AssayColumn,
};

pub use assembly::{
    Entity as AssemblyEntity,
    Model as Assembly,
    ActiveModel as AssemblyActiveModel,
    Column as AssemblyColumn,
};

pub use interval::{
    Entity as IntervalEntity,
    Model as Interval,
    ActiveModel as IntervalActiveModel,
    Column as IntervalColumn,
};

pub use cell::{
    Entity as CellEntity,
    Model as Cell,
    ActiveModel as CellActiveModel,
    Column as CellColumn,
    CellKind,
};

pub use signal::{
    Entity as SignalEntity,
    Model as Signal,
    ActiveModel as SignalActiveModel,
    Column as SignalColumn,
};
