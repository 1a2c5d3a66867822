//! Configuration for terminal sessions.
//!
//! This module provides TOML configuration file loading from
//! `~/.sshterm/config.toml`. All fields are optional; missing fields fall
//! back to their defaults.
//!
//! # Configuration File
//!
//! ```toml
//! # Handshake and connect deadline in seconds
//! connect_timeout_secs = 30
//!
//! # Bytes read from the shell channel per poll
//! read_buffer_size = 4096
//!
//! # TERM value requested with the remote PTY
//! term = "xterm-256color"
//! ```

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session settings shared by every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Deadline for TCP connect and the SSH handshake, in seconds
    pub connect_timeout_secs: u64,
    /// Read buffer size for the output pump
    pub read_buffer_size: usize,
    /// TERM requested with the remote PTY
    pub term: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            read_buffer_size: 4096,
            term: "xterm-256color".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from file, falling back to defaults on any failure.
    pub fn load() -> Self {
        if let Some(path) = Self::get_config_path() {
            if path.exists() {
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(settings) = toml::from_str(&content) {
                        return settings;
                    }
                }
            }
        }
        Self::default()
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        if let Some(home) = home_dir() {
            let dir = home.join(".sshterm");
            if !dir.exists() {
                let _ = fs::create_dir_all(&dir);
            }
            return Some(dir.join("config.toml"));
        }
        None
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let settings: Settings = toml::from_str("connect_timeout_secs = 5").unwrap();
        assert_eq!(settings.connect_timeout(), Duration::from_secs(5));
        assert_eq!(settings.read_buffer_size, 4096);
        assert_eq!(settings.term, "xterm-256color");
    }

    #[test]
    fn empty_file_yields_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.connect_timeout_secs, 30);
    }
}
