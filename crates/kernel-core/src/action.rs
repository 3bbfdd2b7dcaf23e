//! Proposal, action and decision schema shared across the kernel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Base risk levels on the per-action 0..10 scale.
pub mod risk {
    /// No side effects.
    pub const NONE: u8 = 0;
    /// Read-only or reversible side effects.
    pub const LOW: u8 = 1;
    /// Input injection into the focused application.
    pub const MEDIUM: u8 = 3;
    /// Persistent mutation; requires an explicit override.
    pub const HIGH: u8 = 7;
    /// Maximum; assigned to denied or unknown actions.
    pub const CRITICAL: u8 = 10;
}

/// Multiplier from the per-action 0..10 scale to the Planner-facing
/// 0..100 proposal scale.
pub const PROPOSAL_RISK_SCALE: u8 = 10;

/// Proposal risk (0..100) below which AUTO mode may approve without a human.
pub const AUTO_APPROVE_RISK_CEILING: u8 = 30;

/// Successful completions after which a plan is cached as a reflex.
pub const REFLEX_TRUST_THRESHOLD: u64 = 5;

/// Closed allowlist of gesture kinds the kernel will consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Key,
    Type,
    Click,
    Wait,
    Speak,
    Memorize,
    Scan,
    List,
    Read,
    Search,
    Write,
    Edit,
}

impl ActionKind {
    /// All members, in declaration order.
    pub const ALL: [ActionKind; 12] = [
        ActionKind::Key,
        ActionKind::Type,
        ActionKind::Click,
        ActionKind::Wait,
        ActionKind::Speak,
        ActionKind::Memorize,
        ActionKind::Scan,
        ActionKind::List,
        ActionKind::Read,
        ActionKind::Search,
        ActionKind::Write,
        ActionKind::Edit,
    ];

    /// Canonical upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Key => "KEY",
            ActionKind::Type => "TYPE",
            ActionKind::Click => "CLICK",
            ActionKind::Wait => "WAIT",
            ActionKind::Speak => "SPEAK",
            ActionKind::Memorize => "MEMORIZE",
            ActionKind::Scan => "SCAN",
            ActionKind::List => "LIST",
            ActionKind::Read => "READ",
            ActionKind::Search => "SEARCH",
            ActionKind::Write => "WRITE",
            ActionKind::Edit => "EDIT",
        }
    }

    /// Default risk on the 0..10 action scale for this kind.
    pub fn base_risk(&self) -> u8 {
        match self {
            ActionKind::Wait => risk::NONE,
            ActionKind::Speak
            | ActionKind::Memorize
            | ActionKind::Scan
            | ActionKind::List
            | ActionKind::Read
            | ActionKind::Search => risk::LOW,
            ActionKind::Key | ActionKind::Type | ActionKind::Click => risk::MEDIUM,
            ActionKind::Write | ActionKind::Edit => risk::HIGH,
        }
    }

    /// Kinds that touch the filesystem and therefore carry a path payload.
    pub fn touches_files(&self) -> bool {
        matches!(
            self,
            ActionKind::Read
                | ActionKind::Write
                | ActionKind::Edit
                | ActionKind::List
                | ActionKind::Search
        )
    }
}

impl FromStr for ActionKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        ActionKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == upper)
            .ok_or(())
    }
}

/// One proposed gesture. `kind` stays a raw string so that unknown kinds
/// survive deserialization long enough to be denied by the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Wire name of the gesture kind (upper-case for known kinds).
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-dependent payload; `path` (or `directory`) for file kinds.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    /// Explicit per-action risk on the 0..10 scale, overriding the kind default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<u8>,
}

impl Action {
    /// Construct an action of a known kind.
    pub fn new(kind: ActionKind) -> Self {
        Self { kind: kind.as_str().to_string(), payload: BTreeMap::new(), risk: None }
    }

    /// Builder-style payload entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.payload.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse the raw kind against the closed allowlist.
    pub fn parsed_kind(&self) -> Option<ActionKind> {
        self.kind.parse().ok()
    }

    /// Effective risk: explicit per-action value, else the kind default,
    /// else CRITICAL for unknown kinds.
    pub fn effective_risk(&self) -> u8 {
        if let Some(r) = self.risk {
            return r.min(risk::CRITICAL);
        }
        self.parsed_kind().map_or(risk::CRITICAL, |k| k.base_risk())
    }
}

/// An intent plus an ordered action list awaiting a decision. Immutable
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Opaque 128-bit id (UUID v4 string).
    pub id: String,
    /// Natural-language statement of what the Planner wants to achieve.
    pub intent: String,
    /// Ordered gestures realising the intent.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Window title substring the Planner expects to be focused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_window: Option<String>,
    /// Correlation id supplied by the Planner.
    #[serde(default)]
    pub trace_id: String,
    /// Unlocks high-risk actions; never bypasses allowlist or path checks.
    #[serde(rename = "override", default)]
    pub override_requested: bool,
    /// Non-empty on clarification requests (actions must be empty).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_message: Option<String>,
}

impl Proposal {
    /// True when this proposal is a clarification request rather than a
    /// permission request: a message for the user and no actions.
    pub fn is_clarification(&self) -> bool {
        self.actions.is_empty()
            && self.agent_message.as_deref().is_some_and(|m| !m.trim().is_empty())
    }

    /// Maximum effective risk across actions, on the 0..10 scale.
    pub fn max_risk(&self) -> u8 {
        self.actions.iter().map(Action::effective_risk).max().unwrap_or(risk::NONE)
    }

    /// Risk on the Planner-facing 0..100 proposal scale.
    pub fn proposal_risk(&self) -> u8 {
        self.max_risk().saturating_mul(PROPOSAL_RISK_SCALE)
    }

    /// Serialised plan cached by the trust store on success.
    pub fn serialized_plan(&self) -> String {
        serde_json::to_string(&self.actions).unwrap_or_default()
    }
}
