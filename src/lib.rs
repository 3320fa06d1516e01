//! Tumblr-Vault: an incremental Tumblr blog archiver
//!
//! This crate backs up posts and media from the Tumblr content API (or a
//! previously saved set of API responses) into a local, browsable file
//! archive, with resumable incremental passes and a bounded-concurrency
//! save pipeline.

pub mod archive;
pub mod backup;
pub mod config;
pub mod post;
pub mod render;
pub mod source;

use thiserror::Error;

/// Main error type for Tumblr-Vault operations
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("API error: HTTP {status} {reason}")]
    Api { status: u16, reason: String },

    #[error("{0}")]
    RateLimit(String),

    #[error("Incompatible archive: {0}")]
    IncompatibleArchive(String),

    #[error("Found post with date ({post_date}) newer than before param ({before})")]
    DateInvariant { post_date: i64, before: i64 },

    #[error("post '{0}' not found")]
    PostNotFound(u64),

    #[error("Malformed post record: {0}")]
    MalformedPost(String),

    #[error("Cannot continue empty backup")]
    EmptyArchive,

    #[error("Backup interrupted")]
    Interrupted,

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Invalid filter expression: {0}")]
    InvalidFilter(String),
}

/// Result type alias for Tumblr-Vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use backup::coord::{Coord, FaultKind};
pub use config::Options;
pub use post::{PostKind, PostRecord};
