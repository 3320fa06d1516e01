use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::ConfigError;

/// Static settings loaded from an optional TOML file
///
/// Everything here can also be given on the command line; CLI flags win.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

/// API access settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// API key; get your own at https://www.tumblr.com/oauth/apps
    #[serde(rename = "api-key")]
    pub api_key: Option<String>,

    /// User agent for all outgoing requests
    #[serde(rename = "user-agent")]
    pub user_agent: Option<String>,
}

/// Backup behavior defaults
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupConfig {
    /// Number of post-saving worker threads
    pub threads: Option<usize>,

    /// Root directory blog archives are created under
    #[serde(rename = "output-root")]
    pub output_root: Option<String>,
}

/// Loads and parses a settings file from the given path
pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: FileConfig = toml::from_str(&content)?;

    if let Some(threads) = config.backup.threads {
        if threads < 1 {
            return Err(ConfigError::Validation(format!(
                "threads must be >= 1, got {}",
                threads
            )));
        }
    }
    if let Some(key) = &config.api.api_key {
        if key.is_empty() {
            return Err(ConfigError::Validation(
                "api-key must not be empty".to_string(),
            ));
        }
    }

    Ok(config)
}

/// Computes a SHA-256 hash of the settings file content
///
/// Logged at startup so differing runs can be told apart in diagnostics.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = create_temp_config(
            r#"
[api]
api-key = "abc123"

[backup]
threads = 8
output-root = "./vault"
"#,
        );
        let config = load_file_config(file.path()).unwrap();
        assert_eq!(config.api.api_key.as_deref(), Some("abc123"));
        assert_eq!(config.backup.threads, Some(8));
        assert_eq!(config.backup.output_root.as_deref(), Some("./vault"));
    }

    #[test]
    fn test_load_empty_config() {
        let file = create_temp_config("");
        let config = load_file_config(file.path()).unwrap();
        assert!(config.api.api_key.is_none());
        assert!(config.backup.threads.is_none());
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is not valid TOML {{{");
        assert!(load_file_config(file.path()).is_err());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let file = create_temp_config("[backup]\nthreads = 0\n");
        assert!(matches!(
            load_file_config(file.path()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_config_hash_is_stable() {
        let file = create_temp_config("[api]\napi-key = \"k\"\n");
        let h1 = compute_config_hash(file.path()).unwrap();
        let h2 = compute_config_hash(file.path()).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
