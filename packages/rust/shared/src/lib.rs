//! Shared types, error model, and configuration for PaperPipe.
//!
//! This crate is the foundation depended on by all other PaperPipe crates.
//! It provides:
//! - [`PaperPipeError`], the unified error type
//! - Domain types ([`PaperMetadata`], [`PaperRecord`], [`Stage`], [`EventStatus`])
//! - Configuration ([`AppConfig`], [`RetryPolicy`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, DownloadConfig, EmbeddingBackend, EmbeddingConfig, RetryPolicy,
    SearchConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_api_key,
};
pub use error::{PaperPipeError, Result};
pub use types::{
    EmbeddingRecord, EventStatus, PaperId, PaperMetadata, PaperRecord, PaperSummary,
    ProcessingEvent, Stage, arxiv_pdf_url,
};
