//! Action-out dispatch buffer.
//!
//! Approved proposals decompose into individual commands on a bounded
//! FIFO buffer drained by a single server-stream consumer (the
//! Sentinel). A full buffer drops the newest command with a logged
//! warning; already-enqueued commands are never reordered.

use kernel_core::action::Action;
use std::sync::Arc;
use telemetry::DispatchMetrics;
use tokio::sync::mpsc;
use tracing::warn;

/// Default bound of the in-memory buffer.
pub const ACTION_BUFFER: usize = 100;

/// One command bound for the Sentinel.
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    /// Command id (`cmd-<n>`).
    pub command_id: String,
    /// Proposal the command belongs to.
    pub proposal_id: String,
    /// The gesture to execute.
    pub action: Action,
}

/// Bounded FIFO channel between the approval pipeline and the Sentinel
/// stream. The receiver sits behind an async mutex so exactly one stream
/// drains at a time; a reconnecting Sentinel takes over once the previous
/// stream's lock drops.
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    tx: mpsc::Sender<OutboundCommand>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<OutboundCommand>>>,
    metrics: DispatchMetrics,
}

impl ActionDispatcher {
    /// Dispatcher with the default buffer bound.
    pub fn new(metrics: DispatchMetrics) -> Self {
        Self::with_capacity(ACTION_BUFFER, metrics)
    }

    /// Dispatcher with an explicit bound (tests use small ones).
    pub fn with_capacity(capacity: usize, metrics: DispatchMetrics) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: Arc::new(tokio::sync::Mutex::new(rx)), metrics }
    }

    /// Enqueue one command. Returns false when the buffer is full and the
    /// command was dropped; enqueued commands keep their order.
    pub fn enqueue(&self, command: OutboundCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => {
                self.metrics.record_enqueued();
                true
            }
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                self.metrics.record_dropped();
                warn!(
                    command_id = %cmd.command_id,
                    proposal_id = %cmd.proposal_id,
                    "action buffer full; dropping newest command"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(cmd)) => {
                warn!(command_id = %cmd.command_id, "action channel closed");
                false
            }
        }
    }

    /// Handle to the single-consumer receiver.
    pub fn receiver(&self) -> Arc<tokio::sync::Mutex<mpsc::Receiver<OutboundCommand>>> {
        Arc::clone(&self.rx)
    }

    /// Dispatch counters.
    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }
}
