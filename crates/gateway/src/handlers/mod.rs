//! API handlers module

pub mod export;
pub mod health;
pub mod imports;
pub mod restore;
mod upload;
