//! Configuration module for Tumblr-Vault
//!
//! This module holds the run options (the full option set a backup pass is
//! parameterized with), the optional TOML settings file, and the validation
//! and parsing helpers for both.
//!
//! Run options are serializable: a fresh archive records the option set it
//! was started with (`.first_run_options`), and later runs diff themselves
//! against that snapshot before touching the network.

mod file;
mod types;
mod validation;

// Re-export types
pub use types::{
    ImageNames, Options, RequestFilter, BACKUP_CHANGING_OPTIONS, MEDIA_PATH_OPTIONS,
    MUST_MATCH_OPTIONS, PREV_MUST_MATCH_OPTIONS, TAG_ANY, TYPE_ANY,
};

// Re-export file-config functions
pub use file::{compute_config_hash, load_file_config, FileConfig};

// Re-export parsing/validation helpers
pub use validation::{parse_filter, parse_period, parse_request, validate, FilterExpr};
