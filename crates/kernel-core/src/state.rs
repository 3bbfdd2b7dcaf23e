//! Mode and lifecycle enums shared by the validator, coordinator and
//! control plane.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Global agency switch. Defaults to SHADOW on a fresh install: the kernel
/// evaluates and records everything but never forwards an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemMode {
    /// Full agency: approved actions flow to the Sentinel.
    Active,
    /// Evaluate and log only; the action stream stays silent.
    Shadow,
    /// Deny every proposal with reason "paused".
    Paused,
}

impl Default for SystemMode {
    fn default() -> Self {
        SystemMode::Shadow
    }
}

impl SystemMode {
    /// Canonical upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Active => "ACTIVE",
            SystemMode::Shadow => "SHADOW",
            SystemMode::Paused => "PAUSED",
        }
    }
}

impl FromStr for SystemMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ACTIVE" => Ok(SystemMode::Active),
            "SHADOW" => Ok(SystemMode::Shadow),
            "PAUSED" => Ok(SystemMode::Paused),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-domain preference for how much autonomy the kernel gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserMode {
    /// Auto-approve low-risk proposals.
    Auto,
    /// Always hold for a human.
    Manual,
}

impl Default for UserMode {
    fn default() -> Self {
        UserMode::Auto
    }
}

impl UserMode {
    /// Canonical upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            UserMode::Auto => "AUTO",
            UserMode::Manual => "MANUAL",
        }
    }
}

impl FromStr for UserMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AUTO" => Ok(UserMode::Auto),
            "MANUAL" => Ok(UserMode::Manual),
            _ => Err(()),
        }
    }
}

/// Lifecycle of a persisted proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// Reactivated and waiting for the Planner to resume.
    Pending,
    /// Held for a human yes/no.
    WaitingForUser,
    /// Held for a human free-text reply.
    WaitingForContext,
    /// Cleared for dispatch.
    Approved,
    /// Refused by policy or by the user.
    Rejected,
    /// Commands are on the action stream.
    Executing,
    /// Every command reported success.
    Completed,
    /// At least one command reported failure.
    Failed,
}

impl ApprovalStatus {
    /// Canonical wire name, e.g. `WAITING_FOR_USER`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::WaitingForUser => "WAITING_FOR_USER",
            ApprovalStatus::WaitingForContext => "WAITING_FOR_CONTEXT",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
            ApprovalStatus::Executing => "EXECUTING",
            ApprovalStatus::Completed => "COMPLETED",
            ApprovalStatus::Failed => "FAILED",
        }
    }

    /// Statuses surfaced by `listPending`.
    pub fn is_waiting(&self) -> bool {
        matches!(self, ApprovalStatus::WaitingForUser | ApprovalStatus::WaitingForContext)
    }

    /// Statuses whose actions may enter the action-out stream.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, ApprovalStatus::Approved | ApprovalStatus::Executing)
    }
}

impl FromStr for ApprovalStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(ApprovalStatus::Pending),
            "WAITING_FOR_USER" => Ok(ApprovalStatus::WaitingForUser),
            "WAITING_FOR_CONTEXT" => Ok(ApprovalStatus::WaitingForContext),
            "APPROVED" => Ok(ApprovalStatus::Approved),
            "REJECTED" => Ok(ApprovalStatus::Rejected),
            "EXECUTING" => Ok(ApprovalStatus::Executing),
            "COMPLETED" => Ok(ApprovalStatus::Completed),
            "FAILED" => Ok(ApprovalStatus::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a proposal is sitting in the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InteractionType {
    /// Needs a yes/no from the user.
    Permission,
    /// Needs a free-text reply from the user.
    Clarification,
}

impl InteractionType {
    /// Canonical upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Permission => "PERMISSION",
            InteractionType::Clarification => "CLARIFICATION",
        }
    }
}

impl FromStr for InteractionType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PERMISSION" => Ok(InteractionType::Permission),
            "CLARIFICATION" => Ok(InteractionType::Clarification),
            _ => Err(()),
        }
    }
}

/// Advertised role of a connected control-plane client; determines its
/// capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// The Planner.
    Brain,
    /// The OS integration layer.
    Sentinel,
    /// Wake-word / speech front-end.
    Ears,
    /// Anything else; reduced read-only set.
    External,
}

impl ClientType {
    /// Canonical lower-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Brain => "brain",
            ClientType::Sentinel => "sentinel",
            ClientType::Ears => "ears",
            ClientType::External => "external",
        }
    }
}

impl FromStr for ClientType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "brain" => Ok(ClientType::Brain),
            "sentinel" => Ok(ClientType::Sentinel),
            "ears" => Ok(ClientType::Ears),
            "external" => Ok(ClientType::External),
            _ => Err(()),
        }
    }
}
