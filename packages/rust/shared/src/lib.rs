//! Shared types, error model, events, and configuration for aipbinder.
//!
//! This crate is the foundation depended on by all other aipbinder crates.
//! It provides:
//! - [`AipBinderError`]: the unified error type
//! - Domain types ([`RetrievalTarget`], [`RunId`])
//! - Diagnostic events ([`PipelineEvent`], [`EventSink`])
//! - Configuration ([`AppConfig`], [`FetchConfig`], config loading)

pub mod config;
pub mod error;
pub mod events;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DEFAULT_INDEX_URL, DefaultsConfig, FetchConfig, FetchSection, SourceConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{AipBinderError, Result};
pub use events::{EventSink, PipelineEvent, SilentSink};
pub use types::{RetrievalTarget, RunId, parse_target_list};
