//! Rule-based role classification.
//!
//! A profile is flattened into a fixed-shape [`Evidence`] record and checked
//! against [`RULES`] in order; the first rule that matches assigns the role.
//! Penalties for degraded input are applied afterwards and the confidence is
//! clamped to `[0, 1]`.

use std::fmt;

use serde::Serialize;

use crate::callgraph::NodeStatus;
use crate::profile::{BehaviorProfile, Reachability};

/// Functional role of a script.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Long-running engine-driven behavior, usually a main loop.
    Role,
    /// Body of a user interaction.
    Action,
    /// Availability test for an interaction, or a tiny shared predicate.
    Guard,
    /// Straight-line helper called from many places.
    Utility,
    /// Orchestration that sequences calls into other scripts.
    Flow,
    /// Not classified, for example because decoding failed.
    Unknown,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Role => "ROLE",
            Role::Action => "ACTION",
            Role::Guard => "GUARD",
            Role::Utility => "UTILITY",
            Role::Flow => "FLOW",
            Role::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every fact a rule may look at. All fields are always present.
#[derive(Clone, Debug, PartialEq)]
pub struct Evidence {
    pub is_lifecycle_entry: bool,
    pub is_interaction_action: bool,
    pub is_interaction_guard: bool,
    pub is_entry_point: bool,
    pub has_loops: bool,
    pub can_yield: bool,
    pub has_branching: bool,
    pub uses_unknown_opcode: bool,
    pub has_dead_code: bool,
    pub is_unreachable: bool,
    pub truncated: bool,
    pub instruction_count: usize,
    pub caller_count: u32,
    pub outbound_calls: u32,
    pub validation_errors: usize,
}

impl Evidence {
    pub fn from_profile(profile: &BehaviorProfile) -> Self {
        let relationships = &profile.relationships;
        Self {
            is_lifecycle_entry: relationships.is_lifecycle_entry(),
            is_interaction_action: relationships.is_interaction_action(),
            is_interaction_guard: relationships.is_interaction_guard,
            is_entry_point: relationships.is_entry_point(),
            has_loops: profile.dynamics.has_loops,
            can_yield: profile.dynamics.can_yield,
            has_branching: profile.structure.has_branching,
            uses_unknown_opcode: profile.structure.uses_unknown_opcode(),
            has_dead_code: profile.reachability == Reachability::HasDeadCode,
            is_unreachable: relationships.graph_status == Some(NodeStatus::Orphan),
            truncated: profile.structure.truncated,
            instruction_count: profile.structure.instruction_count,
            caller_count: relationships.inbound_calls,
            outbound_calls: relationships.outbound_calls,
            validation_errors: profile.validation_errors,
        }
    }
}

/// One row of the rule table.
pub struct ClassificationRule {
    pub name: &'static str,
    pub role: Role,
    pub base_confidence: f64,
    pub matches: fn(&Evidence) -> bool,
    /// Confidence once the rule matched; may raise the base.
    pub refine: fn(&Evidence, f64) -> f64,
}

impl fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("base_confidence", &self.base_confidence)
            .finish()
    }
}

pub const DEFAULT_RULE: &str = "default";
pub const DEFAULT_CONFIDENCE: f64 = 0.50;

const DEAD_CODE_PENALTY: f64 = 0.10;
const UNKNOWN_OPCODE_PENALTY: f64 = 0.15;
const VALIDATION_PENALTY: f64 = 0.05;

/// Rules in priority order.
pub static RULES: [ClassificationRule; 5] = [
    ClassificationRule {
        name: "lifecycle_loop",
        role: Role::Role,
        base_confidence: 0.90,
        matches: |e| e.is_lifecycle_entry && e.has_loops,
        refine: |e, base| {
            if e.can_yield { 0.95 } else { base }
        },
    },
    ClassificationRule {
        name: "interaction_action",
        role: Role::Action,
        base_confidence: 0.85,
        matches: |e| e.is_interaction_action && !e.has_loops,
        refine: |e, base| {
            if e.caller_count <= 1 { 0.90 } else { base }
        },
    },
    ClassificationRule {
        name: "availability_guard",
        role: Role::Guard,
        base_confidence: 0.80,
        matches: |e| {
            e.is_interaction_guard
                || (e.instruction_count <= 5
                    && e.caller_count >= 3
                    && !e.can_yield
                    && !e.is_interaction_action)
        },
        refine: |e, base| match (e.is_interaction_guard, e.instruction_count <= 5) {
            (true, true) => 0.90,
            (true, false) => 0.85,
            _ => base,
        },
    },
    ClassificationRule {
        name: "shared_utility",
        role: Role::Utility,
        base_confidence: 0.75,
        matches: |e| {
            !e.is_entry_point && e.caller_count >= 5 && !e.has_branching && !e.is_interaction_action
        },
        refine: |_, base| base,
    },
    ClassificationRule {
        name: "call_sequence",
        role: Role::Flow,
        base_confidence: 0.70,
        matches: |e| {
            !e.is_entry_point && e.outbound_calls > 0 && (6..=15).contains(&e.instruction_count)
        },
        refine: |_, base| base,
    },
];

/// Classification of one script.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub id: u16,
    pub role: Role,
    pub confidence: f64,
    pub matched_rule: &'static str,
    /// Set when no rule matched and the role is a fallback.
    pub low_confidence: bool,
    /// Facts that supported the match.
    pub evidence: Vec<String>,
    /// Penalties and contradictions.
    pub notes: Vec<String>,
}

impl ClassificationResult {
    /// Placeholder for scripts that never produced a profile.
    pub fn unknown(id: u16, reason: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::Unknown,
            confidence: 0.0,
            matched_rule: DEFAULT_RULE,
            low_confidence: true,
            evidence: Vec::new(),
            notes: vec![reason.into()],
        }
    }
}

#[derive(Clone, Debug)]
pub struct Classifier {
    rules: &'static [ClassificationRule],
}

impl Default for Classifier {
    fn default() -> Self {
        Self { rules: &RULES }
    }
}

impl Classifier {
    pub fn rules(&self) -> &'static [ClassificationRule] {
        self.rules
    }

    pub fn classify(&self, profile: &BehaviorProfile) -> ClassificationResult {
        let evidence = Evidence::from_profile(profile);
        let matched = self.rules.iter().find(|rule| (rule.matches)(&evidence));

        let (role, mut confidence, matched_rule, low_confidence) = match matched {
            Some(rule) => (
                rule.role,
                (rule.refine)(&evidence, rule.base_confidence),
                rule.name,
                false,
            ),
            None => (Role::Flow, DEFAULT_CONFIDENCE, DEFAULT_RULE, true),
        };

        let mut notes = Vec::new();
        if low_confidence {
            notes.push("no rule matched; FLOW is a coarse fallback".to_string());
        }
        if evidence.has_dead_code {
            confidence -= DEAD_CODE_PENALTY;
            notes.push(format!(
                "dead code: {} unreachable instruction(s) (-{DEAD_CODE_PENALTY:.2})",
                profile.structure.dead_instruction_count
            ));
        }
        if role == Role::Utility && evidence.uses_unknown_opcode {
            confidence -= UNKNOWN_OPCODE_PENALTY;
            notes.push(format!(
                "utility uses {} unknown opcode(s) (-{UNKNOWN_OPCODE_PENALTY:.2})",
                profile.structure.unknown_opcode_count
            ));
        }
        if evidence.validation_errors > 0 {
            confidence -= VALIDATION_PENALTY * evidence.validation_errors as f64;
            notes.push(format!(
                "{} validation error(s) (-{VALIDATION_PENALTY:.2} each)",
                evidence.validation_errors
            ));
        }
        notes.extend(contradictions(&evidence, role));

        ClassificationResult {
            id: profile.identity.id,
            role,
            confidence: round(confidence.clamp(0.0, 1.0)),
            matched_rule,
            low_confidence,
            evidence: supporting_facts(&evidence),
            notes,
        }
    }
}

fn contradictions(evidence: &Evidence, role: Role) -> Vec<String> {
    let mut notes = Vec::new();
    if role == Role::Role && !evidence.can_yield {
        notes.push("lifecycle loop has no yield-capable primitive".to_string());
    }
    if evidence.is_interaction_action && evidence.has_loops {
        notes.push("interaction action contains a loop".to_string());
    }
    if role == Role::Action && evidence.caller_count > 1 {
        notes.push(format!(
            "interaction action is also called by {} scripts",
            evidence.caller_count
        ));
    }
    if evidence.is_interaction_guard && evidence.can_yield {
        notes.push("availability guard can yield".to_string());
    }
    if evidence.is_unreachable {
        notes.push("no caller or hook reaches this script".to_string());
    }
    if evidence.truncated {
        notes.push("decoded from a truncated buffer".to_string());
    }
    notes
}

fn supporting_facts(evidence: &Evidence) -> Vec<String> {
    let mut facts = Vec::new();
    let flags = [
        (evidence.is_lifecycle_entry, "lifecycle hook"),
        (evidence.is_interaction_action, "interaction action"),
        (evidence.is_interaction_guard, "interaction guard"),
        (evidence.has_loops, "loop"),
        (evidence.can_yield, "can yield"),
        (evidence.has_branching, "branches"),
    ];
    facts.extend(
        flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, fact)| fact.to_string()),
    );
    facts.push(format!("{} instruction(s)", evidence.instruction_count));
    facts.push(format!("{} caller(s)", evidence.caller_count));
    facts.push(format!("{} outbound call(s)", evidence.outbound_calls));
    facts
}

/// Two decimals keep repeated runs textually identical.
fn round(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
