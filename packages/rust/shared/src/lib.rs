//! Shared types, error model, and configuration for codevec.
//!
//! This crate is the foundation depended on by all other codevec crates.
//! It provides:
//! - [`CodevecError`] — the unified error type
//! - Domain types ([`WorkUnit`], [`UnitPaths`], [`ExitClass`], [`LedgerEntry`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DatasetConfig, DefaultsConfig, ExtractConfig, HistogramPaths, InferenceConfig,
    PipelineConfig, PreprocessConfig, SegmentConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, reference_model_present,
};
pub use error::{CodevecError, Result};
pub use types::{
    ACCOUNTING_FILE_NAME, ContextCount, ExitClass, GROUP_LOG_FILE_NAME, Granularity,
    LEDGER_FILE_NAME, LedgerEntry, RunId, UnitPaths, WorkUnit,
};
