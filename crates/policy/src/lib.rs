//! Conscience Kernel policy validator.
//!
//! A deterministic, fail-closed validator for action proposals. Given a
//! proposal plus snapshots of focus, trust, system mode and user mode, it
//! produces exactly one disposition. The security baseline is deny-first:
//! a paused system rejects everything, unknown action kinds are denied at
//! maximum risk, and high-risk work needs an explicit override.
//!
//! Check precedence (fixed; short-circuits on the first denial, and the
//! surfaced reason names the failing rule):
//! 1) System pause
//! 2) Action-kind allowlist
//! 3) Path safety for file-touching kinds
//! 4) Blocked-keyword sweep (SPEAK payloads exempt)
//! 5) Risk scoring (max across actions; explicit per-action risk wins)
//! 6) Focus gate against the expected window
//! 7) Override gate: high risk without an override is parked for the
//!    human rather than rejected
//! 8) Auto-approve condition, else hold for a human
//!
//! Clarification requests (a question for the user, no actions) skip 3–7
//! and are always held for context.
//!
//! All evaluations are deterministic for a given input snapshot.

#![deny(unsafe_code)]

use focus::FocusSnapshot;
use kernel_core::action::{
    risk, Action, ActionKind, Proposal, AUTO_APPROVE_RISK_CEILING,
};
use kernel_core::state::{SystemMode, UserMode};
use serde::Serialize;
use trust::TrustReader;

/// Which rule family produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleCode {
    /// System mode is PAUSED.
    Paused,
    /// Action kind outside the closed allowlist.
    Allowlist,
    /// Missing, absolute, drive-letter or traversing path payload.
    UnsafePath,
    /// A configured keyword matched.
    BlockedKeyword,
    /// High risk without an explicit override.
    RiskGate,
    /// Expected window is not focused.
    FocusMismatch,
}

/// What the kernel should do with the proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Disposition {
    /// Forward to the action stream without a human.
    AutoApprove,
    /// Enqueue as a PERMISSION approval and wait.
    Hold,
    /// Enqueue as a CLARIFICATION and wait for free text.
    Clarify,
    /// Reject outright.
    Deny,
}

/// Result of one validation pass.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    /// The verdict.
    pub disposition: Disposition,
    /// Maximum action risk on the 0..10 scale.
    pub risk: u8,
    /// Reason naming the failing rule (always set on Deny and Hold).
    pub reason: Option<String>,
    /// Rule family behind a denial.
    pub code: Option<RuleCode>,
    /// Successful completions of (intent, focused window), clamped to 100.
    pub trust_score: u8,
}

impl Evaluation {
    /// True when the proposal may proceed (now or after approval).
    pub fn permitted(&self) -> bool {
        !matches!(self.disposition, Disposition::Deny)
    }
}

/// Deterministic policy engine. Construction lower-cases the keyword list
/// once; evaluation allocates nothing on the happy path beyond reasons.
#[derive(Debug, Clone)]
pub struct Engine {
    keywords: Vec<String>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine with the canonical blocked-keyword list.
    #[must_use]
    pub fn new() -> Self {
        Self::with_keywords(
            kernel_core::config::DEFAULT_BLOCKED_KEYWORDS.iter().map(|s| s.to_string()),
        )
    }

    /// Engine with a configured keyword list (case folded here).
    pub fn with_keywords<I: IntoIterator<Item = String>>(keywords: I) -> Self {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Validate one proposal against the current snapshots.
    pub fn evaluate(
        &self,
        proposal: &Proposal,
        focus_now: &FocusSnapshot,
        system_mode: SystemMode,
        user_mode: UserMode,
        trust: &dyn TrustReader,
    ) -> Evaluation {
        let trust_score =
            trust.trust_for(&proposal.intent, &focus_now.window_title).min(100) as u8;

        if system_mode == SystemMode::Paused {
            return Evaluation {
                disposition: Disposition::Deny,
                risk: risk::NONE,
                reason: Some("paused".to_string()),
                code: Some(RuleCode::Paused),
                trust_score,
            };
        }

        if proposal.is_clarification() {
            return Evaluation {
                disposition: Disposition::Clarify,
                risk: risk::NONE,
                reason: proposal.agent_message.clone(),
                code: None,
                trust_score,
            };
        }

        let mut kinds = Vec::with_capacity(proposal.actions.len());
        for action in &proposal.actions {
            match action.parsed_kind() {
                Some(kind) => kinds.push(kind),
                None => {
                    return self.deny(
                        RuleCode::Allowlist,
                        risk::CRITICAL,
                        format!("action type \"{}\" is not allowlisted", action.kind),
                        trust_score,
                    )
                }
            }
        }

        for (action, kind) in proposal.actions.iter().zip(&kinds) {
            if let Some(violation) = path_violation(action, *kind) {
                return self.deny(RuleCode::UnsafePath, risk::CRITICAL, violation, trust_score);
            }
        }

        if let Some(hit) = self.keyword_hit(proposal) {
            return self.deny(RuleCode::BlockedKeyword, risk::CRITICAL, hit, trust_score);
        }

        let max_risk = proposal.max_risk();
        // The override gate never rejects outright: lacking an override,
        // a high-risk proposal is parked for the human, whose approval is
        // the override. The focus gate below still gets its say first.
        let needs_override = max_risk >= risk::HIGH && !proposal.override_requested;

        if let Some(expected) = proposal.expected_window.as_deref() {
            if !expected.is_empty()
                && !focus_now
                    .window_title
                    .to_lowercase()
                    .contains(&expected.to_lowercase())
            {
                return self.deny(
                    RuleCode::FocusMismatch,
                    max_risk,
                    format!(
                        "focus mismatch: expected \"{}\", focused \"{}\"",
                        expected, focus_now.window_title
                    ),
                    trust_score,
                );
            }
        }

        if needs_override {
            return Evaluation {
                disposition: Disposition::Hold,
                risk: max_risk,
                reason: Some("high-risk action requires explicit override".to_string()),
                code: Some(RuleCode::RiskGate),
                trust_score,
            };
        }

        if user_mode == UserMode::Auto
            && system_mode == SystemMode::Active
            && (proposal.proposal_risk() < AUTO_APPROVE_RISK_CEILING
                || proposal.override_requested)
        {
            return Evaluation {
                disposition: Disposition::AutoApprove,
                risk: max_risk,
                reason: None,
                code: None,
                trust_score,
            };
        }

        Evaluation {
            disposition: Disposition::Hold,
            risk: max_risk,
            reason: Some("held for user approval".to_string()),
            code: None,
            trust_score,
        }
    }

    fn deny(&self, code: RuleCode, risk: u8, reason: String, trust_score: u8) -> Evaluation {
        Evaluation {
            disposition: Disposition::Deny,
            risk,
            reason: Some(reason),
            code: Some(code),
            trust_score,
        }
    }

    /// First keyword match across (upper-cased kind, payload values, the
    /// intent). SPEAK payload values are exempt: spoken text legitimately
    /// contains words the sweep would flag.
    fn keyword_hit(&self, proposal: &Proposal) -> Option<String> {
        for action in &proposal.actions {
            let kind_is_speak = action.parsed_kind() == Some(ActionKind::Speak);
            if let Some(kw) = self.find_keyword(&action.kind.to_uppercase()) {
                return Some(format!("blocked keyword \"{kw}\" in action type"));
            }
            if kind_is_speak {
                continue;
            }
            for (key, value) in &action.payload {
                if let Some(kw) = self.find_keyword(value) {
                    return Some(format!("blocked keyword \"{kw}\" in payload \"{key}\""));
                }
            }
        }
        self.find_keyword(&proposal.intent)
            .map(|kw| format!("blocked keyword \"{kw}\" in intent"))
    }

    fn find_keyword(&self, haystack: &str) -> Option<&str> {
        let folded = haystack.to_lowercase();
        self.keywords.iter().find(|kw| folded.contains(kw.as_str())).map(String::as_str)
    }
}

/// Path-safety rule for file-touching kinds. SEARCH reads `directory`;
/// LIST prefers `directory` and falls back to `path`; the rest use `path`.
fn path_violation(action: &Action, kind: ActionKind) -> Option<String> {
    if !kind.touches_files() {
        return None;
    }
    let (key, value) = match kind {
        ActionKind::Search => ("directory", action.payload.get("directory")),
        ActionKind::List => match action.payload.get("directory") {
            Some(v) => ("directory", Some(v)),
            None => ("path", action.payload.get("path")),
        },
        _ => ("path", action.payload.get("path")),
    };
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return Some(format!("unsafe path: missing \"{key}\" for {}", kind.as_str()));
    };
    if value.starts_with('/') || value.starts_with('\\') {
        return Some(format!("unsafe path: absolute path \"{value}\""));
    }
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Some(format!("unsafe path: drive-letter path \"{value}\""));
    }
    if value.split(['/', '\\']).any(|segment| segment == "..") {
        return Some(format!("unsafe path: parent traversal in \"{value}\""));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedTrust(HashMap<(String, String), u64>);

    impl FixedTrust {
        fn empty() -> Self {
            Self(HashMap::new())
        }

        fn with(intent: &str, window: &str, count: u64) -> Self {
            let mut m = HashMap::new();
            m.insert((intent.to_string(), window.to_string()), count);
            Self(m)
        }
    }

    impl TrustReader for FixedTrust {
        fn trust_for(&self, intent: &str, focused_window: &str) -> u64 {
            self.0
                .get(&(intent.to_string(), focused_window.to_string()))
                .copied()
                .unwrap_or(0)
        }
    }

    fn focused(title: &str) -> FocusSnapshot {
        FocusSnapshot {
            window_title: title.to_string(),
            process_name: String::new(),
            updated_at_ms: 1,
        }
    }

    fn proposal(intent: &str, actions: Vec<Action>) -> Proposal {
        Proposal {
            id: "p".into(),
            intent: intent.into(),
            actions,
            expected_window: None,
            trace_id: "t".into(),
            override_requested: false,
            agent_message: None,
        }
    }

    fn eval(engine: &Engine, p: &Proposal, mode: SystemMode) -> Evaluation {
        engine.evaluate(p, &focused("Notes — draft.md"), mode, UserMode::Auto, &FixedTrust::empty())
    }

    #[test]
    fn paused_denies_everything() {
        let engine = Engine::new();
        let p = proposal("anything", vec![Action::new(ActionKind::Wait)]);
        let e = eval(&engine, &p, SystemMode::Paused);
        assert_eq!(e.disposition, Disposition::Deny);
        assert_eq!(e.code, Some(RuleCode::Paused));
        assert_eq!(e.reason.as_deref(), Some("paused"));
    }

    #[test]
    fn unknown_kind_is_denied_at_max_risk() {
        let engine = Engine::new();
        let p = proposal(
            "poke around",
            vec![Action { kind: "DESTROY".into(), payload: Default::default(), risk: None }],
        );
        let e = eval(&engine, &p, SystemMode::Active);
        assert_eq!(e.disposition, Disposition::Deny);
        assert_eq!(e.code, Some(RuleCode::Allowlist));
        assert_eq!(e.risk, risk::CRITICAL);
    }

    #[test]
    fn absolute_path_is_unsafe() {
        let engine = Engine::new();
        let p = proposal(
            "save draft",
            vec![Action::new(ActionKind::Write).with("path", "/etc/passwd").with("content", "hi")],
        );
        let e = eval(&engine, &p, SystemMode::Active);
        assert_eq!(e.disposition, Disposition::Deny);
        assert_eq!(e.code, Some(RuleCode::UnsafePath));
        assert!(e.reason.unwrap().contains("unsafe path"));
        assert_eq!(e.risk, risk::CRITICAL);
    }

    #[test]
    fn drive_letter_and_traversal_are_unsafe() {
        let engine = Engine::new();
        for bad in ["C:\\Windows\\system32", "notes/../../../etc/shadow", "\\share"] {
            let p = proposal(
                "read file",
                vec![Action::new(ActionKind::Read).with("path", bad)],
            );
            let e = eval(&engine, &p, SystemMode::Active);
            assert_eq!(e.disposition, Disposition::Deny, "path {bad:?} must be denied");
            assert_eq!(e.code, Some(RuleCode::UnsafePath));
        }
    }

    #[test]
    fn missing_path_key_is_denied() {
        let engine = Engine::new();
        let p = proposal("list dir", vec![Action::new(ActionKind::List)]);
        let e = eval(&engine, &p, SystemMode::Active);
        assert_eq!(e.code, Some(RuleCode::UnsafePath));
    }

    #[test]
    fn search_uses_directory_and_list_falls_back_to_path() {
        let engine = Engine::new();
        let search = proposal(
            "find notes",
            vec![Action::new(ActionKind::Search).with("directory", "notes").with("query", "q")],
        );
        assert!(eval(&engine, &search, SystemMode::Active).permitted());

        let search_with_path_only = proposal(
            "find notes",
            vec![Action::new(ActionKind::Search).with("path", "notes")],
        );
        assert_eq!(
            eval(&engine, &search_with_path_only, SystemMode::Active).code,
            Some(RuleCode::UnsafePath)
        );

        let list_via_path =
            proposal("list dir", vec![Action::new(ActionKind::List).with("path", "notes")]);
        assert!(eval(&engine, &list_via_path, SystemMode::Active).permitted());
    }

    #[test]
    fn speak_payload_is_exempt_from_the_sweep() {
        let engine = Engine::new();
        // "please confirm" would itself trip "rm " if it were swept.
        let speak = proposal(
            "announce the cleanup plan",
            vec![Action::new(ActionKind::Speak)
                .with("text", "please confirm: I will delete the old drafts")],
        );
        let e = eval(&engine, &speak, SystemMode::Active);
        assert!(e.permitted(), "SPEAK payload must not trip the sweep: {:?}", e.reason);

        let typed = proposal(
            "announce the cleanup plan",
            vec![Action::new(ActionKind::Type).with("text", "I will delete the old drafts")],
        );
        let e = eval(&engine, &typed, SystemMode::Active);
        assert_eq!(e.disposition, Disposition::Deny);
        assert_eq!(e.code, Some(RuleCode::BlockedKeyword));
        assert!(e.reason.unwrap().contains("delete"));
    }

    #[test]
    fn intent_is_swept_even_for_speak_proposals() {
        let engine = Engine::new();
        let p = proposal(
            "read back the password",
            vec![Action::new(ActionKind::Speak).with("text", "okay")],
        );
        let e = eval(&engine, &p, SystemMode::Active);
        assert_eq!(e.code, Some(RuleCode::BlockedKeyword));
        assert!(e.reason.unwrap().contains("intent"));
    }

    #[test]
    fn keyword_spacing_avoids_false_positives() {
        let engine = Engine::new();
        // "information" contains "format" but not "format "; "performance"
        // contains "rm" but not "rm ".
        let p = proposal(
            "summarize information",
            vec![Action::new(ActionKind::Type).with("text", "performance summary")],
        );
        let e = eval(&engine, &p, SystemMode::Active);
        assert!(e.permitted(), "spaced keywords must not match inside words: {:?}", e.reason);
    }

    #[test]
    fn high_risk_without_override_is_held() {
        let engine = Engine::new();
        let mut p = proposal(
            "save draft",
            vec![Action::new(ActionKind::Write).with("path", "data/draft.md").with("content", "hi")],
        );
        let e = eval(&engine, &p, SystemMode::Active);
        assert_eq!(e.disposition, Disposition::Hold);
        assert_eq!(e.code, Some(RuleCode::RiskGate));
        assert_eq!(e.risk, risk::HIGH);
        assert_eq!(e.reason.as_deref(), Some("high-risk action requires explicit override"));

        // With the override asserted, AUTO + ACTIVE forwards it.
        p.override_requested = true;
        let e = eval(&engine, &p, SystemMode::Active);
        assert_eq!(e.disposition, Disposition::AutoApprove);
        assert_eq!(e.risk, risk::HIGH);
    }

    #[test]
    fn explicit_risk_overrides_kind_default() {
        let engine = Engine::new();
        let mut a = Action::new(ActionKind::Wait);
        a.risk = Some(risk::HIGH);
        let p = proposal("wait dangerously", vec![a]);
        let e = eval(&engine, &p, SystemMode::Active);
        assert_eq!(e.disposition, Disposition::Hold);
        assert_eq!(e.code, Some(RuleCode::RiskGate));
    }

    #[test]
    fn focus_mismatch_wins_over_override_hold() {
        let engine = Engine::new();
        let mut p = proposal(
            "save draft",
            vec![Action::new(ActionKind::Write).with("path", "data/draft.md")],
        );
        p.expected_window = Some("Gmail".into());
        let e = engine.evaluate(
            &p,
            &focused("Terminal"),
            SystemMode::Active,
            UserMode::Auto,
            &FixedTrust::empty(),
        );
        assert_eq!(e.disposition, Disposition::Deny);
        assert_eq!(e.code, Some(RuleCode::FocusMismatch));
    }

    #[test]
    fn focus_gate_is_case_insensitive_substring() {
        let engine = Engine::new();
        let mut p = proposal("check inbox", vec![Action::new(ActionKind::Scan)]);
        p.expected_window = Some("gmail".into());
        let e = engine.evaluate(
            &p,
            &focused("Inbox — Gmail — Firefox"),
            SystemMode::Active,
            UserMode::Auto,
            &FixedTrust::empty(),
        );
        assert!(e.permitted());

        let e = engine.evaluate(
            &p,
            &focused("Terminal"),
            SystemMode::Active,
            UserMode::Auto,
            &FixedTrust::empty(),
        );
        assert_eq!(e.disposition, Disposition::Deny);
        assert_eq!(e.code, Some(RuleCode::FocusMismatch));
    }

    #[test]
    fn empty_action_list_auto_approves_in_auto_active() {
        let engine = Engine::new();
        let p = proposal("noop", vec![]);
        let e = eval(&engine, &p, SystemMode::Active);
        assert_eq!(e.disposition, Disposition::AutoApprove);
        assert_eq!(e.risk, risk::NONE);
    }

    #[test]
    fn manual_mode_always_holds() {
        let engine = Engine::new();
        let p = proposal("noop", vec![Action::new(ActionKind::Wait)]);
        let e = engine.evaluate(
            &p,
            &focused("Notes"),
            SystemMode::Active,
            UserMode::Manual,
            &FixedTrust::empty(),
        );
        assert_eq!(e.disposition, Disposition::Hold);
    }

    #[test]
    fn shadow_mode_never_auto_approves() {
        let engine = Engine::new();
        let p = proposal("noop", vec![Action::new(ActionKind::Wait)]);
        let e = eval(&engine, &p, SystemMode::Shadow);
        assert_eq!(e.disposition, Disposition::Hold);
    }

    #[test]
    fn medium_risk_is_held_even_in_auto() {
        let engine = Engine::new();
        // MEDIUM = 3 → 30 on the proposal scale, not strictly below the ceiling.
        let p = proposal("type greeting", vec![Action::new(ActionKind::Type).with("text", "hello")]);
        let e = eval(&engine, &p, SystemMode::Active);
        assert_eq!(e.disposition, Disposition::Hold);
    }

    #[test]
    fn clarification_bypasses_gates() {
        let engine = Engine::new();
        let mut p = proposal("book flight", vec![]);
        p.agent_message = Some("from which airport?".into());
        // Even with a mismatching expected window, clarifications pass through.
        p.expected_window = Some("Gmail".into());
        let e = engine.evaluate(
            &p,
            &focused("Terminal"),
            SystemMode::Active,
            UserMode::Auto,
            &FixedTrust::empty(),
        );
        assert_eq!(e.disposition, Disposition::Clarify);
    }

    #[test]
    fn trust_score_is_clamped_and_reported() {
        let engine = Engine::new();
        let p = proposal("compose morning report", vec![]);
        let e = engine.evaluate(
            &p,
            &focused("Notes"),
            SystemMode::Active,
            UserMode::Auto,
            &FixedTrust::with("compose morning report", "Notes", 250),
        );
        assert_eq!(e.trust_score, 100);
    }

    #[test]
    fn identical_inputs_yield_identical_decisions() {
        let engine = Engine::new();
        let p = proposal(
            "save draft",
            vec![Action::new(ActionKind::Write).with("path", "data/draft.md")],
        );
        let focus_now = focused("Notes — draft.md");
        let first = engine.evaluate(
            &p,
            &focus_now,
            SystemMode::Active,
            UserMode::Auto,
            &FixedTrust::empty(),
        );
        for _ in 0..10 {
            let again = engine.evaluate(
                &p,
                &focus_now,
                SystemMode::Active,
                UserMode::Auto,
                &FixedTrust::empty(),
            );
            assert_eq!(again.disposition, first.disposition);
            assert_eq!(again.risk, first.risk);
            assert_eq!(again.reason, first.reason);
        }
    }
}
