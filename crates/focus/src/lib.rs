//! Focused-window tracker.
//!
//! Holds the most recent focus report from the Sentinel. Cross-connection
//! order is last-writer-wins; readers take cheap cloned snapshots and may
//! observe a report one update stale.

#![deny(unsafe_code)]

use kernel_core::ids::now_ms;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Identifier of the OS window the user is currently interacting with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusSnapshot {
    /// Window title as reported by the Sentinel.
    pub window_title: String,
    /// Process owning the window; empty until the first report.
    pub process_name: String,
    /// When this record was last written (ms since epoch).
    pub updated_at_ms: u64,
}

impl Default for FocusSnapshot {
    fn default() -> Self {
        Self {
            window_title: "Unknown".to_string(),
            process_name: String::new(),
            updated_at_ms: 0,
        }
    }
}

impl FocusSnapshot {
    /// Domain key for user-mode resolution: the owning process, else the
    /// global fallback.
    pub fn domain(&self) -> &str {
        if self.process_name.is_empty() {
            "*"
        } else {
            &self.process_name
        }
    }
}

/// Shared tracker. One writer path (focus reports), many readers.
#[derive(Debug, Default)]
pub struct FocusTracker {
    inner: RwLock<FocusSnapshot>,
}

impl FocusTracker {
    /// Tracker starting at the cold-start snapshot (`"Unknown"`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a focus report; returns the stored snapshot.
    pub fn update(&self, window_title: &str, process_name: &str) -> FocusSnapshot {
        let snap = FocusSnapshot {
            window_title: window_title.to_string(),
            process_name: process_name.to_string(),
            updated_at_ms: now_ms(),
        };
        let mut w = self.inner.write().expect("focus lock poisoned");
        *w = snap.clone();
        snap
    }

    /// Current snapshot (cloned; stale by at most one report).
    pub fn snapshot(&self) -> FocusSnapshot {
        self.inner.read().expect("focus lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_start_is_unknown() {
        let t = FocusTracker::new();
        let s = t.snapshot();
        assert_eq!(s.window_title, "Unknown");
        assert_eq!(s.domain(), "*");
    }

    #[test]
    fn last_writer_wins() {
        let t = FocusTracker::new();
        t.update("Terminal", "alacritty");
        t.update("Notes — draft.md", "notes");
        let s = t.snapshot();
        assert_eq!(s.window_title, "Notes — draft.md");
        assert_eq!(s.domain(), "notes");
        assert!(s.updated_at_ms > 0);
    }
}
