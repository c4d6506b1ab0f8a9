//! Relational facts about scripts that come from outside the bytecode:
//! engine hook bindings, interaction bindings and call counts.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Inbound-call count reserved for "known interaction guard".
pub const KNOWN_GUARD_CALLS: u32 = 999;

/// Engine-driven entry point.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleHook {
    Init,
    Main,
    Cleanup,
    Load,
    Reset,
}

impl fmt::Display for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleHook::Init => "init",
            LifecycleHook::Main => "main",
            LifecycleHook::Cleanup => "cleanup",
            LifecycleHook::Load => "load",
            LifecycleHook::Reset => "reset",
        })
    }
}

/// User-interaction binding.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionBinding {
    /// Runs when the user picks the interaction.
    Action,
    /// Decides whether the interaction is offered.
    Guard,
}

/// Everything known about a script from outside its bytecode. Every field is
/// optional; the default value means "nothing known".
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RelationalEvidence {
    pub lifecycle_hook: Option<LifecycleHook>,
    pub interaction: Option<InteractionBinding>,
    /// Calls from other scripts; `999` marks a known interaction guard.
    pub inbound_calls: Option<u32>,
    /// A pause was observed at runtime.
    pub observed_yield: bool,
    pub max_iterations: Option<u32>,
}

static ABSENT: RelationalEvidence = RelationalEvidence {
    lifecycle_hook: None,
    interaction: None,
    inbound_calls: None,
    observed_yield: false,
    max_iterations: None,
};

impl RelationalEvidence {
    pub fn is_interaction_action(&self) -> bool {
        self.interaction == Some(InteractionBinding::Action)
    }

    pub fn is_interaction_guard(&self) -> bool {
        self.interaction == Some(InteractionBinding::Guard)
            || self.inbound_calls == Some(KNOWN_GUARD_CALLS)
    }

    /// Inbound call count, with the guard sentinel filtered out.
    pub fn caller_count(&self) -> Option<u32> {
        self.inbound_calls.filter(|count| *count != KNOWN_GUARD_CALLS)
    }

    /// Bound to any external hook.
    pub fn has_hook(&self) -> bool {
        self.lifecycle_hook.is_some() || self.interaction.is_some() || self.is_interaction_guard()
    }

    /// Engine-facing bindings, in a stable order.
    pub fn hooks(&self) -> Vec<HookBinding> {
        let mut hooks = Vec::new();
        if let Some(hook) = self.lifecycle_hook {
            hooks.push(HookBinding::Lifecycle(hook));
        }
        if self.is_interaction_action() {
            hooks.push(HookBinding::InteractionAction);
        }
        if self.is_interaction_guard() {
            hooks.push(HookBinding::InteractionGuard);
        }
        hooks
    }
}

/// One external binding of a script.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(tag = "kind", content = "hook", rename_all = "snake_case")]
pub enum HookBinding {
    Lifecycle(LifecycleHook),
    InteractionAction,
    InteractionGuard,
}

impl fmt::Display for HookBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookBinding::Lifecycle(hook) => write!(f, "lifecycle:{hook}"),
            HookBinding::InteractionAction => f.write_str("interaction:action"),
            HookBinding::InteractionGuard => f.write_str("interaction:guard"),
        }
    }
}

/// Evidence keyed by script id.
#[derive(Clone, Debug, Default)]
pub struct EvidenceTable {
    by_id: BTreeMap<u16, RelationalEvidence>,
}

impl EvidenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u16, evidence: RelationalEvidence) {
        self.by_id.insert(id, evidence);
    }

    /// Evidence for `id`; absent ids get the empty record.
    pub fn get(&self, id: u16) -> &RelationalEvidence {
        self.by_id.get(&id).unwrap_or(&ABSENT)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl FromIterator<(u16, RelationalEvidence)> for EvidenceTable {
    fn from_iter<T: IntoIterator<Item = (u16, RelationalEvidence)>>(iter: T) -> Self {
        Self {
            by_id: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_evidence_is_absent_not_error() {
        let table = EvidenceTable::new();
        let evidence = table.get(0x1234);
        assert_eq!(&RelationalEvidence::default(), evidence);
        assert!(!evidence.has_hook());
        assert_eq!(None, evidence.caller_count());
    }

    #[test]
    fn guard_sentinel_is_not_a_caller_count() {
        let evidence = RelationalEvidence {
            inbound_calls: Some(KNOWN_GUARD_CALLS),
            ..RelationalEvidence::default()
        };
        assert!(evidence.is_interaction_guard());
        assert_eq!(None, evidence.caller_count());
        assert_eq!(vec![HookBinding::InteractionGuard], evidence.hooks());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let evidence: RelationalEvidence =
            serde_json::from_str(r#"{"lifecycle_hook":"main"}"#).expect("parse evidence");
        assert_eq!(Some(LifecycleHook::Main), evidence.lifecycle_hook);
        assert!(!evidence.observed_yield);
        assert_eq!(
            vec![HookBinding::Lifecycle(LifecycleHook::Main)],
            evidence.hooks()
        );
    }
}
