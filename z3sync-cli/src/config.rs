//! Sync configuration file (`z3sync.json`).
//!
//! Every key is optional; missing keys (or a missing file) fall back to the
//! defaults below. Command-line flags override file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use z3_core::{MergePolicy, RetryPolicy};

/// Config file name, looked up next to the database.
pub const CONFIG_FILE_NAME: &str = "z3sync.json";

pub const DEFAULT_API_URL: &str = "https://api.zotero.org";

/// Zotero library family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryType {
    #[default]
    Group,
    User,
}

impl LibraryType {
    /// URL segment of the library prefix (`/groups/{id}`, `/users/{id}`).
    pub fn path_segment(&self) -> &'static str {
        match self {
            LibraryType::Group => "groups",
            LibraryType::User => "users",
        }
    }
}

impl fmt::Display for LibraryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LibraryType::Group => "group",
            LibraryType::User => "user",
        })
    }
}

impl FromStr for LibraryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "group" => Ok(LibraryType::Group),
            "user" => Ok(LibraryType::User),
            other => Err(format!("unknown library type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Conflict policy when `--merge-priority` is not given.
    pub merge_priority: MergePolicy,
    pub remove_deleted: bool,
    pub download_files: bool,
    pub library_type: LibraryType,
    pub api_url: String,
    /// Objects per listing request (the API caps this at 100).
    pub page_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub download_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            merge_priority: MergePolicy::Remote,
            remove_deleted: false,
            download_files: false,
            library_type: LibraryType::Group,
            api_url: DEFAULT_API_URL.to_string(),
            page_size: 100,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            download_concurrency: 4,
        }
    }
}

impl SyncConfig {
    /// Default config location for a database file.
    pub fn default_path(database: &Path) -> PathBuf {
        database.with_file_name(CONFIG_FILE_NAME)
    }

    /// Load the config at `path`, or the defaults if there is none.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read sync config from {:?}", path))?;
        let config: SyncConfig = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse sync config {:?}", path))?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = SyncConfig::load(&temp_dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.retry_policy().max_retries, 3);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{ "merge_priority": "ignore", "library_type": "user", "retry_base_delay_ms": 250 }"#,
        )
        .unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.merge_priority, MergePolicy::Ignore);
        assert_eq!(config.library_type, LibraryType::User);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(250));
        assert_eq!(config.page_size, 100);
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{ "merge_priority": "newest" }"#).unwrap();
        assert!(SyncConfig::load(&path).is_err());
    }

    #[test]
    fn test_default_path_sits_next_to_database() {
        assert_eq!(
            SyncConfig::default_path(Path::new("/srv/z3/library.db")),
            PathBuf::from("/srv/z3/z3sync.json")
        );
        assert_eq!(
            SyncConfig::default_path(Path::new("z3.db")),
            PathBuf::from("z3sync.json")
        );
    }

    #[test]
    fn test_library_type_parse() {
        assert_eq!("User".parse::<LibraryType>().unwrap(), LibraryType::User);
        assert_eq!(LibraryType::Group.path_segment(), "groups");
        assert!("org".parse::<LibraryType>().is_err());
    }
}
