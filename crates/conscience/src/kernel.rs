//! The kernel: one stateful pipeline behind both transports.
//!
//! Owns every piece of shared state (focus, trust, pending map, audit
//! ring, client registry, system mode, dispatch buffer) and exposes the
//! operations the transports adapt. Each piece of state is mutated only
//! through the owning component and read via RW locks or snapshots.

use approval::{ApprovalError, Coordinator, PendingApproval};
use audit_log::{AuditEntry, AuditLog};
use dashmap::DashMap;
use focus::{FocusSnapshot, FocusTracker};
use kernel_core::action::Proposal;
use kernel_core::codes;
use kernel_core::ids::{new_command_id, new_request_id, now_ms};
use kernel_core::state::{ApprovalStatus, SystemMode, UserMode};
use policy::{Disposition, Engine, Evaluation, RuleCode};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::RwLock;
use store::{ArtifactRow, CommandRow, Store, StoreError};
use telemetry::DispatchMetrics;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use trust::TrustStore;

use crate::dispatch::{ActionDispatcher, OutboundCommand};
use crate::events::KernelEvent;
use crate::registry::ClientRegistry;

/// Errors surfaced by kernel operations. Policy denials are not errors;
/// they come back inside a [`PermissionVerdict`].
#[derive(Debug, Error)]
pub enum KernelError {
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Coordinator operation failed.
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    /// The validator panicked; an audit entry was written.
    #[error("validator error")]
    Validator,
    /// Mode string outside ACTIVE/SHADOW/PAUSED.
    #[error("unknown system mode: {0}")]
    UnknownMode(String),
    /// Outcome report for a command the kernel never dispatched.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// Wake/talk toggles owned by the ears client.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VoiceState {
    /// Wake-word listening.
    pub wake: bool,
    /// Continuous talk mode.
    pub talk: bool,
}

/// What the Planner gets back from one permission request.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionVerdict {
    /// Request id (generated when the Planner omitted one).
    pub request_id: String,
    /// True unless the proposal was blocked outright.
    pub approved: bool,
    /// True when a rule rejected the proposal.
    pub blocked: bool,
    /// Reason naming the failing rule or the hold.
    pub reason: Option<String>,
    /// Maximum action risk (0..10).
    pub risk_level: u8,
    /// Successful completions of (intent, focus), clamped to 100.
    pub trust_score: u8,
    /// Lifecycle status after this call.
    pub status: ApprovalStatus,
    /// Domain error code for blocked verdicts.
    pub error_code: Option<i64>,
    /// Reflex plan for the intent, once trust crossed the threshold.
    pub cached_plan: Option<String>,
}

/// Everything the session snapshot reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Current system mode wire name.
    pub mode: String,
    /// Current focus.
    pub focus: FocusSnapshot,
    /// Proposals waiting on the user, oldest first.
    pub pending: Vec<PendingApproval>,
    /// Time since boot (ms).
    pub uptime_ms: u64,
    /// Voice toggles.
    pub voice: VoiceState,
}

/// The kernel service state. Cheap to share behind an `Arc`.
pub struct Kernel {
    store: Store,
    focus: FocusTracker,
    trust: TrustStore,
    coordinator: Coordinator,
    engine: Engine,
    audit: AuditLog,
    registry: ClientRegistry,
    dispatcher: ActionDispatcher,
    events: broadcast::Sender<KernelEvent>,
    mode: RwLock<SystemMode>,
    voice: RwLock<VoiceState>,
    in_flight: DashMap<String, usize>,
    started_at_ms: u64,
    token: String,
}

impl Kernel {
    /// Assemble the kernel over an open store. The persisted system mode
    /// is restored; the pending queue warms from the database.
    pub fn new(
        store: Store,
        audit: AuditLog,
        blocked_keywords: Vec<String>,
        token: String,
    ) -> Result<Self, KernelError> {
        let mode = SystemMode::from_str(&store.system_mode()?).unwrap_or_default();
        let coordinator = Coordinator::new(store.clone())?;
        let trust = TrustStore::new(store.clone());
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            trust,
            coordinator,
            engine: Engine::with_keywords(blocked_keywords),
            audit,
            registry: ClientRegistry::new(),
            dispatcher: ActionDispatcher::new(DispatchMetrics::new()),
            events,
            mode: RwLock::new(mode),
            voice: RwLock::new(VoiceState::default()),
            in_flight: DashMap::new(),
            started_at_ms: now_ms(),
            token,
            focus: FocusTracker::new(),
            store,
        })
    }

    /// The shared secret both transports authenticate against.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Current system mode.
    pub fn mode(&self) -> SystemMode {
        *self.mode.read().expect("mode lock poisoned")
    }

    /// Milliseconds since boot.
    pub fn uptime_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at_ms)
    }

    /// Connected-client registry.
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// The action-out dispatcher.
    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// The approval coordinator.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// The audit trail.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Subscribe to the event plane.
    pub fn subscribe_events(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    /// Best-effort broadcast; a lagging or absent receiver is not an error.
    pub fn broadcast(&self, event: KernelEvent) {
        let _ = self.events.send(event);
    }

    // ---- focus ----

    /// Apply one focus report and fan out the change event.
    pub fn report_focus(&self, window_title: &str, process_name: &str) -> FocusSnapshot {
        let snap = self.focus.update(window_title, process_name);
        self.broadcast(KernelEvent::FocusChanged(snap.clone()));
        snap
    }

    /// Current focus snapshot.
    pub fn focus_snapshot(&self) -> FocusSnapshot {
        self.focus.snapshot()
    }

    // ---- modes ----

    /// Parse and apply a mode string from the wire.
    pub fn set_mode_from(&self, raw: &str) -> Result<SystemMode, KernelError> {
        let mode = SystemMode::from_str(raw)
            .map_err(|_| KernelError::UnknownMode(raw.to_string()))?;
        self.set_mode(mode)?;
        Ok(mode)
    }

    /// Persist and apply a system-mode change.
    pub fn set_mode(&self, mode: SystemMode) -> Result<(), KernelError> {
        self.store.set_system_mode(mode.as_str())?;
        *self.mode.write().expect("mode lock poisoned") = mode;
        info!(mode = mode.as_str(), "system mode changed");
        self.broadcast_session_update();
        Ok(())
    }

    /// Resolve the user mode for a domain, falling back to the global row.
    pub fn user_mode_for(&self, domain: &str) -> Result<UserMode, KernelError> {
        if let Some(raw) = self.store.user_mode(domain)? {
            if let Ok(mode) = UserMode::from_str(&raw) {
                return Ok(mode);
            }
        }
        if domain != "*" {
            if let Some(raw) = self.store.user_mode("*")? {
                if let Ok(mode) = UserMode::from_str(&raw) {
                    return Ok(mode);
                }
            }
        }
        Ok(UserMode::default())
    }

    /// Upsert one domain's user mode.
    pub fn set_user_mode(&self, domain: &str, mode: UserMode) -> Result<(), KernelError> {
        self.store.set_user_mode(domain, mode.as_str())?;
        Ok(())
    }

    // ---- voice ----

    /// Current wake/talk toggles.
    pub fn voice(&self) -> VoiceState {
        *self.voice.read().expect("voice lock poisoned")
    }

    /// Toggle wake-word listening.
    pub fn set_wake(&self, enabled: bool) -> VoiceState {
        let state = {
            let mut v = self.voice.write().expect("voice lock poisoned");
            v.wake = enabled;
            *v
        };
        self.broadcast_session_update();
        state
    }

    /// Toggle talk mode.
    pub fn set_talk(&self, enabled: bool) -> VoiceState {
        let state = {
            let mut v = self.voice.write().expect("voice lock poisoned");
            v.talk = enabled;
            *v
        };
        self.broadcast_session_update();
        state
    }

    fn broadcast_session_update(&self) {
        let voice = self.voice();
        self.broadcast(KernelEvent::SessionUpdate {
            mode: self.mode().as_str().to_string(),
            wake: voice.wake,
            talk: voice.talk,
        });
    }

    // ---- the permission pipeline ----

    /// Validate one proposal and act on the disposition. Exactly one
    /// audit entry is written per call, before the verdict is returned.
    pub fn request_permission(
        &self,
        mut proposal: Proposal,
    ) -> Result<PermissionVerdict, KernelError> {
        if proposal.id.is_empty() {
            proposal.id = new_request_id();
        }
        let focus_now = self.focus.snapshot();
        let system_mode = self.mode();
        let domain = focus_now.domain().to_string();
        let user_mode = self.user_mode_for(&domain)?;

        let evaluation = match catch_unwind(AssertUnwindSafe(|| {
            self.engine.evaluate(&proposal, &focus_now, system_mode, user_mode, &self.trust)
        })) {
            Ok(e) => e,
            Err(_) => {
                error!(request_id = %proposal.id, trace_id = %proposal.trace_id, "validator panicked");
                self.write_audit(&proposal, 10, true, "validator error");
                return Err(KernelError::Validator);
            }
        };

        match evaluation.disposition {
            Disposition::Deny => self.resolve_denied(&proposal, &domain, &evaluation),
            Disposition::Clarify => self.resolve_clarify(proposal, &domain, &evaluation),
            Disposition::Hold => self.resolve_hold(proposal, &domain, &evaluation),
            Disposition::AutoApprove => self.resolve_auto(proposal, &domain, &evaluation),
        }
    }

    fn resolve_denied(
        &self,
        proposal: &Proposal,
        domain: &str,
        evaluation: &Evaluation,
    ) -> Result<PermissionVerdict, KernelError> {
        let reason = evaluation.reason.clone().unwrap_or_else(|| "denied".to_string());
        self.coordinator.record_resolved(
            proposal,
            evaluation.risk.saturating_mul(10).min(100),
            domain,
            ApprovalStatus::Rejected,
        )?;
        self.write_audit(proposal, evaluation.risk, true, &reason);
        Ok(PermissionVerdict {
            request_id: proposal.id.clone(),
            approved: false,
            blocked: true,
            reason: Some(reason),
            risk_level: evaluation.risk,
            trust_score: evaluation.trust_score,
            status: ApprovalStatus::Rejected,
            error_code: evaluation.code.map(rule_error_code),
            cached_plan: None,
        })
    }

    fn resolve_clarify(
        &self,
        proposal: Proposal,
        domain: &str,
        evaluation: &Evaluation,
    ) -> Result<PermissionVerdict, KernelError> {
        let request_id = proposal.id.clone();
        let intent = proposal.intent.clone();
        let pending = self.coordinator.enqueue_clarification(proposal, domain)?;
        self.write_audit(&pending.proposal, 0, false, "clarification requested");
        self.broadcast(KernelEvent::ApprovalPending {
            id: pending.id.clone(),
            intent,
            risk_score: 0,
            interaction_type: pending.interaction_type.as_str().to_string(),
        });
        Ok(PermissionVerdict {
            request_id,
            approved: true,
            blocked: false,
            reason: pending.agent_message.clone(),
            risk_level: 0,
            trust_score: evaluation.trust_score,
            status: ApprovalStatus::WaitingForContext,
            error_code: None,
            cached_plan: None,
        })
    }

    fn resolve_hold(
        &self,
        proposal: Proposal,
        domain: &str,
        evaluation: &Evaluation,
    ) -> Result<PermissionVerdict, KernelError> {
        let reason = evaluation
            .reason
            .clone()
            .unwrap_or_else(|| "held for user approval".to_string());
        let risk_score = evaluation.risk.saturating_mul(10).min(100);
        let pending =
            self.coordinator.enqueue_permission(proposal, risk_score, domain)?;
        self.write_audit(&pending.proposal, evaluation.risk, false, &reason);
        self.broadcast(KernelEvent::ApprovalPending {
            id: pending.id.clone(),
            intent: pending.proposal.intent.clone(),
            risk_score,
            interaction_type: pending.interaction_type.as_str().to_string(),
        });
        Ok(PermissionVerdict {
            request_id: pending.id.clone(),
            approved: true,
            blocked: false,
            reason: Some(reason),
            risk_level: evaluation.risk,
            trust_score: evaluation.trust_score,
            status: ApprovalStatus::WaitingForUser,
            error_code: None,
            cached_plan: None,
        })
    }

    fn resolve_auto(
        &self,
        proposal: Proposal,
        domain: &str,
        evaluation: &Evaluation,
    ) -> Result<PermissionVerdict, KernelError> {
        self.coordinator.record_resolved(
            &proposal,
            evaluation.risk.saturating_mul(10).min(100),
            domain,
            ApprovalStatus::Approved,
        )?;
        self.write_audit(&proposal, evaluation.risk, false, "auto-approved");
        self.dispatch_proposal(&proposal)?;
        let cached_plan = self
            .trust
            .get_reflex(&proposal.intent)
            .unwrap_or(None)
            .map(|r| r.plan);
        Ok(PermissionVerdict {
            request_id: proposal.id.clone(),
            approved: true,
            blocked: false,
            reason: None,
            risk_level: evaluation.risk,
            trust_score: evaluation.trust_score,
            status: ApprovalStatus::Approved,
            error_code: None,
            cached_plan,
        })
    }

    fn write_audit(&self, proposal: &Proposal, risk: u8, blocked: bool, reason: &str) {
        let entry = AuditEntry::now(
            &proposal.id,
            &proposal.intent,
            risk,
            blocked,
            reason,
            proposal.override_requested,
        );
        if let Err(e) = self.audit.record(entry) {
            warn!(error = %e, "audit sink write failed; ring retains the entry");
        }
    }

    // ---- approval resolution and dispatch ----

    /// Apply the user's yes/no; an approved proposal goes to the stream.
    pub fn decide_approval(
        &self,
        id: &str,
        approved: bool,
    ) -> Result<PendingApproval, KernelError> {
        let decided = self.coordinator.decide(id, approved)?;
        if approved {
            self.dispatch_proposal(&decided.proposal)?;
        }
        Ok(decided)
    }

    /// Store the user's reply to a clarification; the proposal returns to
    /// PENDING so the Planner can resume.
    pub fn reply_clarification(
        &self,
        id: &str,
        message: &str,
    ) -> Result<PendingApproval, KernelError> {
        Ok(self.coordinator.reply(id, message)?)
    }

    /// Decompose an approved proposal into commands on the out-stream.
    /// Never forwards unless the system is ACTIVE.
    fn dispatch_proposal(&self, proposal: &Proposal) -> Result<(), KernelError> {
        if self.mode() != SystemMode::Active {
            info!(
                id = %proposal.id,
                mode = self.mode().as_str(),
                "approved but not forwarded outside ACTIVE"
            );
            return Ok(());
        }
        if proposal.actions.is_empty() {
            return Ok(());
        }
        self.coordinator.mark_executing(&proposal.id)?;
        self.in_flight.insert(proposal.id.clone(), proposal.actions.len());
        for action in &proposal.actions {
            let command_id = new_command_id();
            let payload =
                serde_json::to_string(&action.payload).unwrap_or_else(|_| "{}".to_string());
            let sent = self.dispatcher.enqueue(OutboundCommand {
                command_id: command_id.clone(),
                proposal_id: proposal.id.clone(),
                action: action.clone(),
            });
            self.store.insert_command(&CommandRow {
                id: command_id,
                action: action.kind.clone(),
                target: proposal.id.clone(),
                payload,
                status: if sent { "QUEUED".to_string() } else { "DROPPED".to_string() },
                created_at: now_ms(),
                executed_at: None,
            })?;
        }
        Ok(())
    }

    /// Apply the Sentinel's terminal report for one command. A completed
    /// last command completes the proposal and bumps trust; any failure
    /// fails the proposal and invalidates the intent's reflex.
    pub fn report_outcome(&self, command_id: &str, success: bool) -> Result<(), KernelError> {
        let Some(command) = self.store.get_command(command_id)? else {
            return Err(KernelError::UnknownCommand(command_id.to_string()));
        };
        self.store
            .set_command_status(command_id, if success { "COMPLETED" } else { "FAILED" })?;
        let proposal_id = command.target;

        if !success {
            self.in_flight.remove(&proposal_id);
            // A sibling command may already have failed the proposal.
            let already_terminal = self
                .coordinator
                .get_by_id(&proposal_id)?
                .is_some_and(|p| !p.status.is_dispatchable());
            if !already_terminal {
                let updated = self.coordinator.apply_outcome(&proposal_id, false)?;
                self.trust.invalidate_reflex(&updated.proposal.intent)?;
                warn!(proposal_id = %proposal_id, command_id, "command failed; reflex invalidated");
            }
            return Ok(());
        }

        let finished = match self.in_flight.get_mut(&proposal_id) {
            Some(mut entry) => {
                let remaining = entry.value_mut();
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if finished {
            self.in_flight.remove(&proposal_id);
            let updated = self.coordinator.apply_outcome(&proposal_id, true)?;
            let focus_now = self.focus.snapshot();
            self.trust.record_success(
                &updated.proposal.intent,
                &focus_now.window_title,
                &updated.proposal.serialized_plan(),
            )?;
            info!(proposal_id = %proposal_id, "proposal completed");
        }
        Ok(())
    }

    // ---- memory ----

    /// Store one artifact, filling id and timestamp when absent.
    pub fn memory_store(&self, mut artifact: ArtifactRow) -> Result<String, KernelError> {
        if artifact.id.is_empty() {
            artifact.id = new_request_id();
        }
        if artifact.timestamp == 0 {
            artifact.timestamp = now_ms();
        }
        self.store.insert_artifact(&artifact)?;
        Ok(artifact.id)
    }

    /// Substring search over stored artifacts, newest first.
    pub fn memory_search(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<ArtifactRow>, KernelError> {
        Ok(self.store.search_artifacts(query, limit)?)
    }

    // ---- snapshots ----

    /// Full state snapshot for the control plane.
    pub fn session_snapshot(&self) -> Result<SessionSnapshot, KernelError> {
        Ok(SessionSnapshot {
            mode: self.mode().as_str().to_string(),
            focus: self.focus.snapshot(),
            pending: self.coordinator.list_pending()?,
            uptime_ms: self.uptime_ms(),
            voice: self.voice(),
        })
    }
}

/// Wire error code for a denial's rule family.
fn rule_error_code(code: RuleCode) -> i64 {
    match code {
        RuleCode::FocusMismatch => codes::FOCUS_MISMATCH,
        RuleCode::Paused
        | RuleCode::Allowlist
        | RuleCode::UnsafePath
        | RuleCode::BlockedKeyword
        | RuleCode::RiskGate => codes::RISK_BLOCKED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::action::{Action, ActionKind};

    fn kernel() -> Kernel {
        let store = Store::open_in_memory().unwrap();
        Kernel::new(
            store,
            AuditLog::in_memory(),
            kernel_core::config::DEFAULT_BLOCKED_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            "tok".to_string(),
        )
        .unwrap()
    }

    fn active_kernel() -> Kernel {
        let k = kernel();
        k.set_mode(SystemMode::Active).unwrap();
        k
    }

    fn write_proposal(id: &str, override_requested: bool) -> Proposal {
        Proposal {
            id: id.to_string(),
            intent: "save draft".to_string(),
            actions: vec![Action::new(ActionKind::Write)
                .with("path", "data/draft.md")
                .with("content", "hi")],
            expected_window: None,
            trace_id: "t".to_string(),
            override_requested,
            agent_message: None,
        }
    }

    #[tokio::test]
    async fn safe_write_needs_override_then_forwards() {
        let k = active_kernel();
        k.report_focus("Notes — draft.md", "notes");

        // Without override: held, audited blocked=false at risk 7.
        let held = k.request_permission(write_proposal("p1", false)).unwrap();
        assert!(held.approved && !held.blocked);
        assert_eq!(held.status, ApprovalStatus::WaitingForUser);
        assert_eq!(held.risk_level, 7);

        // With override: forwarded to the stream.
        let auto = k.request_permission(write_proposal("p2", true)).unwrap();
        assert_eq!(auto.status, ApprovalStatus::Approved);
        let rx = k.dispatcher().receiver();
        let cmd = rx.lock().await.recv().await.unwrap();
        assert_eq!(cmd.proposal_id, "p2");
        assert_eq!(cmd.action.kind, "WRITE");

        let audit = k.audit().recent();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|e| e.risk_level == 7 && !e.blocked));
    }

    #[tokio::test]
    async fn absolute_path_is_blocked_and_never_dispatched() {
        let k = active_kernel();
        let mut p = write_proposal("p1", true);
        p.actions[0].payload.insert("path".into(), "/etc/passwd".into());
        let verdict = k.request_permission(p).unwrap();
        assert!(!verdict.approved && verdict.blocked);
        assert!(verdict.reason.unwrap().contains("unsafe path"));
        assert_eq!(verdict.risk_level, 10);

        let audit = k.audit().recent();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].blocked);

        // Nothing on the stream.
        let rx = k.dispatcher().receiver();
        assert!(rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn focus_mismatch_has_its_error_code() {
        let k = active_kernel();
        k.report_focus("Terminal", "alacritty");
        let mut p = write_proposal("p1", true);
        p.expected_window = Some("Gmail".into());
        let verdict = k.request_permission(p).unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.error_code, Some(codes::FOCUS_MISMATCH));
    }

    #[tokio::test]
    async fn paused_denies_and_leaves_trust_alone() {
        let k = kernel();
        k.set_mode(SystemMode::Paused).unwrap();
        let verdict = k.request_permission(write_proposal("p1", true)).unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.reason.as_deref(), Some("paused"));
        let audit = k.audit().recent();
        assert!(audit[0].blocked);
    }

    #[tokio::test]
    async fn completion_feeds_trust_and_builds_a_reflex() {
        let k = active_kernel();
        k.report_focus("Notes", "notes");
        for i in 0..6 {
            let mut p = write_proposal(&format!("p{i}"), true);
            p.intent = "compose morning report".to_string();
            let verdict = k.request_permission(p).unwrap();
            assert_eq!(verdict.status, ApprovalStatus::Approved);

            let rx = k.dispatcher().receiver();
            let cmd = rx.lock().await.recv().await.unwrap();
            k.report_outcome(&cmd.command_id, true).unwrap();
        }
        // Sixth success crossed the threshold: the next request sees the plan.
        let mut p = write_proposal("p7", true);
        p.intent = "compose morning report".to_string();
        let verdict = k.request_permission(p).unwrap();
        assert_eq!(verdict.trust_score, 6);
        assert!(verdict.cached_plan.is_some());
    }

    #[tokio::test]
    async fn failure_fails_the_proposal_and_invalidates_the_reflex() {
        let k = active_kernel();
        k.report_focus("Notes", "notes");
        for i in 0..6 {
            let mut p = write_proposal(&format!("p{i}"), true);
            p.intent = "compose morning report".to_string();
            k.request_permission(p).unwrap();
            let rx = k.dispatcher().receiver();
            let cmd = rx.lock().await.recv().await.unwrap();
            k.report_outcome(&cmd.command_id, true).unwrap();
        }
        let mut p = write_proposal("pf", true);
        p.intent = "compose morning report".to_string();
        k.request_permission(p).unwrap();
        let rx = k.dispatcher().receiver();
        let cmd = rx.lock().await.recv().await.unwrap();
        k.report_outcome(&cmd.command_id, false).unwrap();

        let failed = k.coordinator().get_by_id("pf").unwrap().unwrap();
        assert_eq!(failed.status, ApprovalStatus::Failed);
        let mut p = write_proposal("p8", true);
        p.intent = "compose morning report".to_string();
        let verdict = k.request_permission(p).unwrap();
        assert!(verdict.cached_plan.is_none(), "reflex must be gone after a failure");
    }

    #[tokio::test]
    async fn shadow_mode_holds_and_approval_does_not_forward() {
        let k = kernel();
        assert_eq!(k.mode(), SystemMode::Shadow);
        let verdict = k.request_permission(write_proposal("p1", true)).unwrap();
        assert_eq!(verdict.status, ApprovalStatus::WaitingForUser);

        k.decide_approval("p1", true).unwrap();
        // Approved, but SHADOW never forwards.
        let rx = k.dispatcher().receiver();
        assert!(rx.lock().await.try_recv().is_err());
        let row = k.coordinator().get_by_id("p1").unwrap().unwrap();
        assert_eq!(row.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn clarification_loop_reactivates_the_proposal() {
        let k = active_kernel();
        let p = Proposal {
            id: "c1".into(),
            intent: "book flight".into(),
            actions: vec![],
            expected_window: None,
            trace_id: "t".into(),
            override_requested: false,
            agent_message: Some("from which airport?".into()),
        };
        let verdict = k.request_permission(p).unwrap();
        assert_eq!(verdict.status, ApprovalStatus::WaitingForContext);

        let pending = k.coordinator().list_pending().unwrap();
        assert_eq!(pending[0].status, ApprovalStatus::WaitingForContext);

        k.reply_clarification("c1", "JFK").unwrap();
        let polled = k.coordinator().get_by_id("c1").unwrap().unwrap();
        assert_eq!(polled.status, ApprovalStatus::Pending);
        assert_eq!(polled.user_response.as_deref(), Some("JFK"));
    }

    #[tokio::test]
    async fn empty_action_list_auto_approves() {
        let k = active_kernel();
        let p = Proposal {
            id: "p1".into(),
            intent: "think quietly".into(),
            actions: vec![],
            expected_window: None,
            trace_id: "t".into(),
            override_requested: false,
            agent_message: None,
        };
        let verdict = k.request_permission(p).unwrap();
        assert_eq!(verdict.status, ApprovalStatus::Approved);
        assert_eq!(verdict.risk_level, 0);
        assert_eq!(k.audit().recent().len(), 1);
    }

    #[tokio::test]
    async fn speak_delete_is_approved_but_type_delete_is_not() {
        let k = active_kernel();
        let speak = Proposal {
            id: "s1".into(),
            intent: "announce the cleanup plan".into(),
            actions: vec![Action::new(ActionKind::Speak)
                .with("text", "shall I delete the old drafts?")],
            expected_window: None,
            trace_id: "t".into(),
            override_requested: false,
            agent_message: None,
        };
        let verdict = k.request_permission(speak).unwrap();
        assert!(verdict.approved, "SPEAK payload is exempt: {:?}", verdict.reason);

        let typed = Proposal {
            id: "t1".into(),
            intent: "announce the cleanup plan".into(),
            actions: vec![Action::new(ActionKind::Type)
                .with("text", "shall I delete the old drafts?")],
            expected_window: None,
            trace_id: "t".into(),
            override_requested: false,
            agent_message: None,
        };
        let verdict = k.request_permission(typed).unwrap();
        assert!(verdict.blocked);
        assert!(verdict.reason.unwrap().contains("delete"));
    }

    #[tokio::test]
    async fn manual_domain_always_holds() {
        let k = active_kernel();
        k.report_focus("Inbox — Gmail", "firefox");
        k.set_user_mode("firefox", UserMode::Manual).unwrap();
        let p = Proposal {
            id: "p1".into(),
            intent: "glance at inbox".into(),
            actions: vec![Action::new(ActionKind::Scan)],
            expected_window: None,
            trace_id: "t".into(),
            override_requested: false,
            agent_message: None,
        };
        let verdict = k.request_permission(p).unwrap();
        assert_eq!(verdict.status, ApprovalStatus::WaitingForUser);
    }

    #[tokio::test]
    async fn memory_store_and_search() {
        let k = kernel();
        let id = k
            .memory_store(ArtifactRow {
                id: String::new(),
                timestamp: 0,
                content: "meeting notes about the quarterly review".into(),
                kind: "screen_text".into(),
                bounding_box: "{}".into(),
                classification: None,
                summary: None,
                embedding: None,
            })
            .unwrap();
        assert!(!id.is_empty());
        let hits = k.memory_search("quarterly", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }
}
