//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the private control directory inside the sync root. Never
/// watched, never synced.
pub const CONTROL_DIR: &str = ".tandem";

/// Polling cadence while waiting for a file write to stabilize (ms).
pub const DEFAULT_WRITE_POLL_INTERVAL_MS: u64 = 200;

/// How long a file must stay unchanged to count as stable (ms).
pub const DEFAULT_STABILITY_THRESHOLD_MS: u64 = 1000;

/// Fallback polling cadence when native watching is unavailable (ms).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Fallback polling cadence for binary files (ms).
pub const DEFAULT_BINARY_POLL_INTERVAL_MS: u64 = 300;

/// Write-stabilization options: a file is only reported once its size and
/// mtime have stopped changing for the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwaitWriteFinish {
    #[serde(default = "default_write_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold_ms: u64,
}

fn default_write_poll_interval() -> u64 {
    DEFAULT_WRITE_POLL_INTERVAL_MS
}

fn default_stability_threshold() -> u64 {
    DEFAULT_STABILITY_THRESHOLD_MS
}

impl Default for AwaitWriteFinish {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_WRITE_POLL_INTERVAL_MS,
            stability_threshold_ms: DEFAULT_STABILITY_THRESHOLD_MS,
        }
    }
}

/// Configuration for one synced directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Absolute root of the synced tree.
    pub sync_path: PathBuf,
    /// Glob-lite ignore patterns, matched against the basename and the
    /// relative path (a single `*` wildcard is supported).
    #[serde(default)]
    pub ignored_patterns: Vec<String>,
    #[serde(default)]
    pub await_write_finish: AwaitWriteFinish,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_binary_poll_interval")]
    pub binary_poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_binary_poll_interval() -> u64 {
    DEFAULT_BINARY_POLL_INTERVAL_MS
}

impl SyncConfig {
    pub fn new(sync_path: PathBuf) -> Self {
        Self {
            sync_path,
            ignored_patterns: Vec::new(),
            await_write_finish: AwaitWriteFinish::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            binary_poll_interval_ms: DEFAULT_BINARY_POLL_INTERVAL_MS,
        }
    }

    /// Whether a relative path is excluded from watching: the control
    /// directory, or anything matching an ignore pattern.
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        if relative_path == CONTROL_DIR || relative_path.starts_with(&format!("{}/", CONTROL_DIR)) {
            return true;
        }
        let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        self.ignored_patterns
            .iter()
            .any(|pattern| matches_pattern(pattern, name) || matches_pattern(pattern, relative_path))
    }
}

/// Exact match, or a single-`*` wildcard match.
fn matches_pattern(pattern: &str, candidate: &str) -> bool {
    if pattern == candidate {
        return true;
    }
    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            return candidate.starts_with(parts[0])
                && candidate.ends_with(parts[1])
                && candidate.len() >= parts[0].len() + parts[1].len();
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_dir_is_always_ignored() {
        let config = SyncConfig::new(PathBuf::from("/sync"));
        assert!(config.is_ignored(".tandem"));
        assert!(config.is_ignored(".tandem/journal.redb"));
        assert!(!config.is_ignored("notes/a.txt"));
    }

    #[test]
    fn test_ignore_patterns() {
        let mut config = SyncConfig::new(PathBuf::from("/sync"));
        config.ignored_patterns = vec!["*.swp".to_string(), "node_modules".to_string()];

        assert!(config.is_ignored("a.swp"));
        assert!(config.is_ignored("deep/dir/b.swp"));
        assert!(config.is_ignored("node_modules"));
        assert!(!config.is_ignored("a.txt"));
    }

    #[test]
    fn test_defaults_from_partial_json() {
        let config: SyncConfig = serde_json::from_str(r#"{"sync_path": "/sync"}"#).unwrap();
        assert_eq!(config.await_write_finish.poll_interval_ms, 200);
        assert_eq!(config.await_write_finish.stability_threshold_ms, 1000);
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.binary_poll_interval_ms, 300);
    }
}
