//! Lending configuration
//!
//! Only operational knobs live here. Scoring weights, ledger deltas and the
//! eligibility threshold are fixed in code.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub lending: LendingConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// How long a writer waits for the lock before failing
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LendingConfig {
    /// Loan length granted on approval
    #[serde(default = "default_due_days")]
    pub default_due_days: u32,

    /// Days before the due date at which reminders go out
    #[serde(default = "default_reminder_window")]
    pub reminder_window_days: u32,
}

impl Default for LendingConfig {
    fn default() -> Self {
        Self {
            default_due_days: default_due_days(),
            reminder_window_days: default_reminder_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Defaults
fn default_db_path() -> PathBuf { PathBuf::from("book_lending.db") }
fn default_busy_timeout() -> u64 { 5000 }
fn default_due_days() -> u32 { 14 }
fn default_reminder_window() -> u32 { 2 }
fn default_log_level() -> String { "book_lending=info".to_string() }

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.lending.default_due_days, 14);
        assert_eq!(config.lending.reminder_window_days, 2);
        assert_eq!(config.storage.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[lending]\ndefault_due_days = 21\n\n[storage]\npath = \"library.db\"").unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.lending.default_due_days, 21);
        assert_eq!(config.lending.reminder_window_days, 2);
        assert_eq!(config.storage.path, PathBuf::from("library.db"));
        assert_eq!(config.log.level, "book_lending=info");
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.storage.busy_timeout_ms, 5000);
        assert!(Config::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[lending]\ndefault_due_days = \"soon\"").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("parsing config"));
    }
}
