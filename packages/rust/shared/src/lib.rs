//! Shared types, error model, and configuration for topicsync.
//!
//! This crate is the foundation depended on by all other topicsync crates.
//! It provides:
//! - [`TopicSyncError`]: the unified error type
//! - Domain types ([`StagingTopic`], [`ProductionTopic`], [`EmbeddingRecord`], [`SubjectKey`])
//! - Title normalization used for identity matching ([`normalize_title`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod normalize;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, EmbeddingConfig, FiltersConfig, ReferenceTable, SafetyConfig,
    SummariesConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_api_key,
};
pub use error::{Result, TopicSyncError};
pub use normalize::normalize_title;
pub use types::{
    EmbeddingRecord, ProductionTopic, StagingTopic, Subject, SubjectKey, TopicId,
};
