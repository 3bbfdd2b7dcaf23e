//! Human approval coordinator.
//!
//! Proposals whose disposition requires a human are persisted here,
//! surfaced to the control plane, and resolved by a decision or a
//! free-text reply. Async approval is modelled as persistent state plus
//! polling, not as a suspended task: clients poll and the user may take
//! arbitrarily long. State survives restarts; the in-memory pending map
//! is only a warm cache over `action_proposals`.

#![deny(unsafe_code)]

use kernel_core::action::Proposal;
use kernel_core::ids::now_ms;
use kernel_core::state::{ApprovalStatus, InteractionType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;
use store::{ProposalRow, Store, StoreError};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised by coordinator operations.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No proposal with that id.
    #[error("proposal {0} not found")]
    NotFound(String),
    /// The proposal is not in the status the operation requires.
    #[error("proposal {id} is {actual}, expected {expected}")]
    InvalidTransition {
        /// Proposal id.
        id: String,
        /// Status found.
        actual: String,
        /// Status the operation needs.
        expected: String,
    },
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A persisted payload no longer deserializes.
    #[error("corrupt proposal payload: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// A proposal parked for (or resolved by) human interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Proposal id (shared with the `action_proposals` row).
    pub id: String,
    /// The proposal as submitted.
    pub proposal: Proposal,
    /// Creation time (ms since epoch).
    pub created_at_ms: u64,
    /// PERMISSION or CLARIFICATION.
    pub interaction_type: InteractionType,
    /// Planner's question, on clarifications.
    pub agent_message: Option<String>,
    /// User's free-text reply, once given.
    pub user_response: Option<String>,
    /// Current lifecycle status.
    pub status: ApprovalStatus,
    /// Risk on the Planner-facing 0..100 scale.
    pub risk_score: u8,
    /// Domain the user-mode lookup resolved to.
    pub domain: String,
}

impl PendingApproval {
    fn to_row(&self, approved_at: Option<u64>) -> ProposalRow {
        ProposalRow {
            id: self.id.clone(),
            intent: self.proposal.intent.clone(),
            risk_score: self.risk_score,
            status: self.status.as_str().to_string(),
            payload: serde_json::to_string(&self.proposal).unwrap_or_else(|_| "{}".into()),
            domain: self.domain.clone(),
            created_at: self.created_at_ms,
            updated_at: self.created_at_ms,
            approved_at,
            interaction_type: self.interaction_type.as_str().to_string(),
            agent_message: self.agent_message.clone(),
            user_response: self.user_response.clone(),
        }
    }

    fn from_row(row: ProposalRow) -> Result<Self, ApprovalError> {
        let proposal: Proposal = serde_json::from_str(&row.payload)?;
        Ok(Self {
            id: row.id,
            proposal,
            created_at_ms: row.created_at,
            interaction_type: InteractionType::from_str(&row.interaction_type)
                .unwrap_or(InteractionType::Permission),
            agent_message: row.agent_message,
            user_response: row.user_response,
            status: ApprovalStatus::from_str(&row.status)
                .unwrap_or(ApprovalStatus::WaitingForUser),
            risk_score: row.risk_score,
            domain: row.domain,
        })
    }
}

/// The coordinator. Stateless across restarts aside from cache warm-up.
#[derive(Debug)]
pub struct Coordinator {
    store: Store,
    pending: RwLock<HashMap<String, PendingApproval>>,
}

impl Coordinator {
    /// Coordinator over an open database, with the pending cache warmed
    /// from rows still waiting for the user.
    pub fn new(store: Store) -> Result<Self, ApprovalError> {
        let coordinator = Self { store, pending: RwLock::new(HashMap::new()) };
        coordinator.warm_up()?;
        Ok(coordinator)
    }

    fn warm_up(&self) -> Result<(), ApprovalError> {
        let rows = self.store.list_waiting()?;
        let mut cache = self.pending.write().expect("pending lock poisoned");
        for row in rows {
            match PendingApproval::from_row(row) {
                Ok(p) => {
                    cache.insert(p.id.clone(), p);
                }
                Err(e) => warn!(error = %e, "skipping corrupt pending row during warm-up"),
            }
        }
        if !cache.is_empty() {
            info!(pending = cache.len(), "approval queue warmed from store");
        }
        Ok(())
    }

    /// Park a proposal for a yes/no decision.
    pub fn enqueue_permission(
        &self,
        proposal: Proposal,
        risk_score: u8,
        domain: &str,
    ) -> Result<PendingApproval, ApprovalError> {
        self.enqueue(proposal, risk_score, domain, InteractionType::Permission)
    }

    /// Park a clarification question for a free-text reply.
    pub fn enqueue_clarification(
        &self,
        proposal: Proposal,
        domain: &str,
    ) -> Result<PendingApproval, ApprovalError> {
        self.enqueue(proposal, 0, domain, InteractionType::Clarification)
    }

    fn enqueue(
        &self,
        proposal: Proposal,
        risk_score: u8,
        domain: &str,
        interaction_type: InteractionType,
    ) -> Result<PendingApproval, ApprovalError> {
        let status = match interaction_type {
            InteractionType::Permission => ApprovalStatus::WaitingForUser,
            InteractionType::Clarification => ApprovalStatus::WaitingForContext,
        };
        let pending = PendingApproval {
            id: proposal.id.clone(),
            agent_message: proposal.agent_message.clone(),
            proposal,
            created_at_ms: now_ms(),
            interaction_type,
            user_response: None,
            status,
            risk_score,
            domain: domain.to_string(),
        };
        self.store.insert_proposal(&pending.to_row(None))?;
        self.pending
            .write()
            .expect("pending lock poisoned")
            .insert(pending.id.clone(), pending.clone());
        Ok(pending)
    }

    /// Persist a proposal the validator resolved on its own (approved or
    /// denied); it never enters the pending queue.
    pub fn record_resolved(
        &self,
        proposal: &Proposal,
        risk_score: u8,
        domain: &str,
        status: ApprovalStatus,
    ) -> Result<(), ApprovalError> {
        let now = now_ms();
        let row = ProposalRow {
            id: proposal.id.clone(),
            intent: proposal.intent.clone(),
            risk_score,
            status: status.as_str().to_string(),
            payload: serde_json::to_string(proposal)?,
            domain: domain.to_string(),
            created_at: now,
            updated_at: now,
            approved_at: (status == ApprovalStatus::Approved).then_some(now),
            interaction_type: InteractionType::Permission.as_str().to_string(),
            agent_message: None,
            user_response: None,
        };
        self.store.insert_proposal(&row)?;
        Ok(())
    }

    /// All proposals still waiting for the user, oldest first.
    pub fn list_pending(&self) -> Result<Vec<PendingApproval>, ApprovalError> {
        let mut waiting: Vec<PendingApproval> = self
            .pending
            .read()
            .expect("pending lock poisoned")
            .values()
            .filter(|p| p.status.is_waiting())
            .cloned()
            .collect();
        waiting.sort_by(|a, b| {
            a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id))
        });
        Ok(waiting)
    }

    /// Latest state of one proposal, pending or not.
    pub fn get_by_id(&self, id: &str) -> Result<Option<PendingApproval>, ApprovalError> {
        if let Some(p) = self.pending.read().expect("pending lock poisoned").get(id) {
            return Ok(Some(p.clone()));
        }
        match self.store.get_proposal(id)? {
            Some(row) => Ok(Some(PendingApproval::from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Apply the user's yes/no to a proposal waiting for one. Returns the
    /// updated record; an approved proposal is ready for dispatch.
    pub fn decide(&self, id: &str, approved: bool) -> Result<PendingApproval, ApprovalError> {
        let mut pending = self
            .get_by_id(id)?
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        if pending.status != ApprovalStatus::WaitingForUser {
            return Err(ApprovalError::InvalidTransition {
                id: id.to_string(),
                actual: pending.status.as_str().to_string(),
                expected: ApprovalStatus::WaitingForUser.as_str().to_string(),
            });
        }
        let now = now_ms();
        pending.status =
            if approved { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
        self.store.set_proposal_status(
            id,
            pending.status.as_str(),
            approved.then_some(now),
        )?;
        self.pending.write().expect("pending lock poisoned").remove(id);
        info!(id, approved, "approval decided");
        Ok(pending)
    }

    /// Store the user's reply to a clarification and reactivate the
    /// proposal so the Planner can resume.
    pub fn reply(&self, id: &str, message: &str) -> Result<PendingApproval, ApprovalError> {
        let mut pending = self
            .get_by_id(id)?
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        if pending.status != ApprovalStatus::WaitingForContext {
            return Err(ApprovalError::InvalidTransition {
                id: id.to_string(),
                actual: pending.status.as_str().to_string(),
                expected: ApprovalStatus::WaitingForContext.as_str().to_string(),
            });
        }
        pending.user_response = Some(message.to_string());
        pending.status = ApprovalStatus::Pending;
        self.store
            .set_user_response(id, message, ApprovalStatus::Pending.as_str())?;
        self.pending.write().expect("pending lock poisoned").remove(id);
        info!(id, "clarification answered");
        Ok(pending)
    }

    /// Mark an approved proposal as on the action stream.
    pub fn mark_executing(&self, id: &str) -> Result<(), ApprovalError> {
        self.store
            .set_proposal_status(id, ApprovalStatus::Executing.as_str(), None)?;
        Ok(())
    }

    /// Apply the Sentinel's terminal report. Returns the updated record so
    /// the caller can feed the trust ledger.
    pub fn apply_outcome(
        &self,
        id: &str,
        success: bool,
    ) -> Result<PendingApproval, ApprovalError> {
        let mut current = self
            .get_by_id(id)?
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        if !current.status.is_dispatchable() {
            return Err(ApprovalError::InvalidTransition {
                id: id.to_string(),
                actual: current.status.as_str().to_string(),
                expected: ApprovalStatus::Executing.as_str().to_string(),
            });
        }
        current.status =
            if success { ApprovalStatus::Completed } else { ApprovalStatus::Failed };
        self.store
            .set_proposal_status(id, current.status.as_str(), None)?;
        Ok(current)
    }
}
