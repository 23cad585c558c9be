//! Legacy-table adapters: classification rules and column mappings that turn
//! arbitrary tracker tables into typed rows of the unified schema.

use std::path::PathBuf;

use thiserror::Error;

mod classify;
mod mapping;
mod rules;

pub use classify::{classify_table, Classification, MatchReason};
pub use mapping::{map_table, MappedTable, RowRejection, StagedBatch};
pub use rules::{required_fields, CategoryRule, ConsolidationRules, TableMapping};

pub const CRATE_NAME: &str = "jst-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading rules file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rules: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid rules: {0}")]
    InvalidRules(String),
}
