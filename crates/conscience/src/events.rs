//! Best-effort event broadcast to ghost-plane clients.

use focus::FocusSnapshot;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::kernel::Kernel;

/// Heartbeat period for the `tick` event.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Events pushed to every connected ghost client.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    /// The Sentinel reported a new foreground window.
    FocusChanged(FocusSnapshot),
    /// A proposal entered the pending queue.
    ApprovalPending {
        /// Proposal id.
        id: String,
        /// Intent as submitted.
        intent: String,
        /// Risk on the 0..100 scale.
        risk_score: u8,
        /// PERMISSION or CLARIFICATION.
        interaction_type: String,
    },
    /// System mode, wake or talk state changed.
    SessionUpdate {
        /// Current system mode wire name.
        mode: String,
        /// Wake-word listening state.
        wake: bool,
        /// Talk-mode state.
        talk: bool,
    },
    /// Periodic heartbeat.
    Tick {
        /// Time since boot (ms).
        uptime_ms: u64,
    },
}

impl KernelEvent {
    /// Event method name on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            KernelEvent::FocusChanged(_) => "focus.changed",
            KernelEvent::ApprovalPending { .. } => "approval.pending",
            KernelEvent::SessionUpdate { .. } => "session.update",
            KernelEvent::Tick { .. } => "tick",
        }
    }

    /// Notification frame (no id; events expect no reply).
    pub fn to_frame(&self) -> JsonValue {
        let params = match self {
            KernelEvent::FocusChanged(snap) => json!({
                "window_title": snap.window_title,
                "process_name": snap.process_name,
                "updated_at_ms": snap.updated_at_ms,
            }),
            KernelEvent::ApprovalPending { id, intent, risk_score, interaction_type } => json!({
                "id": id,
                "intent": intent,
                "risk_score": risk_score,
                "interaction_type": interaction_type,
            }),
            KernelEvent::SessionUpdate { mode, wake, talk } => json!({
                "mode": mode,
                "wake": wake,
                "talk": talk,
            }),
            KernelEvent::Tick { uptime_ms } => json!({ "uptime_ms": uptime_ms }),
        };
        json!({ "version": "2.0", "method": self.method(), "params": params })
    }
}

/// Spawn the 30 s heartbeat. Runs until aborted at shutdown.
pub fn spawn_heartbeat(kernel: Arc<Kernel>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
        // The first tick fires immediately; skip it so uptime is honest.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            kernel.broadcast(KernelEvent::Tick { uptime_ms: kernel.uptime_ms() });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_method_and_params() {
        let e = KernelEvent::Tick { uptime_ms: 1234 };
        let f = e.to_frame();
        assert_eq!(f["version"], "2.0");
        assert_eq!(f["method"], "tick");
        assert_eq!(f["params"]["uptime_ms"], 1234);
        assert!(f.get("id").is_none());
    }

    #[test]
    fn approval_frame_names_the_proposal() {
        let e = KernelEvent::ApprovalPending {
            id: "p1".into(),
            intent: "save draft".into(),
            risk_score: 70,
            interaction_type: "PERMISSION".into(),
        };
        let f = e.to_frame();
        assert_eq!(f["method"], "approval.pending");
        assert_eq!(f["params"]["id"], "p1");
        assert_eq!(f["params"]["risk_score"], 70);
    }
}
