//! Kernel configuration: one JSON file plus a sibling token file.
//!
//! A missing config file is not an error; boot falls back to safe defaults
//! (safe mode on, canonical blocked-keyword list).

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Canonical blocked-keyword list used when no config overrides it. The
/// trailing spaces on `rm ` and `format ` are deliberate: they keep words
/// like "performance" and "information" from false-positiving.
pub const DEFAULT_BLOCKED_KEYWORDS: [&str; 17] = [
    "delete",
    "rm ",
    "format ",
    "shutdown",
    "reboot",
    "sudo",
    "password",
    "credential",
    "secret",
    "api_key",
    "token",
    "credit_card",
    "ssn",
    "rm -rf",
    "drop_table",
    "delete_all",
    "fdisk",
];

/// Errors raised while reading the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The file exists but is not valid JSON.
    #[error("malformed config: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// `system.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    /// Reported version string.
    pub version: String,
    /// Deployment environment label.
    pub environment: String,
    /// Log filter, e.g. `info` or `info,conscience=debug`.
    pub log_level: String,
    /// Optional log file path; empty means stderr only.
    pub log_file: String,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            environment: "local".to_string(),
            log_level: "info".to_string(),
            log_file: String::new(),
        }
    }
}

/// `network.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Host the kernel binds on.
    pub kernel_host: String,
    /// Port advertised to local collaborators.
    pub kernel_port: u16,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self { kernel_host: "127.0.0.1".to_string(), kernel_port: 50051 }
    }
}

/// `security.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// When set, the kernel refuses to leave SHADOW via config alone.
    pub safe_mode: bool,
    /// Case-insensitive substrings denied by the keyword sweep.
    pub blocked_keywords: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            safe_mode: true,
            blocked_keywords: DEFAULT_BLOCKED_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// `system.*` section.
    pub system: SystemSection,
    /// `network.*` section.
    pub network: NetworkSection,
    /// `security.*` section.
    pub security: SecuritySection,
}

impl KernelConfig {
    /// Load from `path`; a missing file yields defaults, a malformed file
    /// is an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let p = path.as_ref();
        if !p.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(p)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Keyword list with empty entries dropped; falls back to the canonical
    /// list when the config supplies none.
    pub fn effective_keywords(&self) -> Vec<String> {
        let cleaned: Vec<String> = self
            .security
            .blocked_keywords
            .iter()
            .filter(|k| !k.is_empty())
            .cloned()
            .collect();
        if cleaned.is_empty() {
            DEFAULT_BLOCKED_KEYWORDS.iter().map(|s| s.to_string()).collect()
        } else {
            cleaned
        }
    }
}
