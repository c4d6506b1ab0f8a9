//! Behavior profiles: structural facts from the CFG merged with relational
//! evidence into one record per script.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::callgraph::{CallGraph, NodeStatus};
use crate::engine::AnalysisContext;
use crate::evidence::{InteractionBinding, LifecycleHook, RelationalEvidence};
use crate::ir::{EdgeTarget, Flow};
use crate::opcodes;
use crate::scope::ScriptScope;

/// Whether the script and all of its instructions can run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    FullyReachable,
    /// Some instructions cannot be reached from the entry block.
    HasDeadCode,
    /// Nothing calls the script and no hook binds it. Dead code outranks
    /// this state; the orphan fact stays in `Relationships::graph_status`.
    Unreachable,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Identity {
    pub id: u16,
    pub owner: String,
    pub scope: ScriptScope,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Structure {
    pub instruction_count: usize,
    pub declared_instruction_count: usize,
    pub arg_count: u8,
    pub local_count: u8,
    pub unknown_opcode_count: usize,
    pub has_branching: bool,
    pub dead_instruction_count: usize,
    pub truncated: bool,
}

impl Structure {
    pub fn uses_unknown_opcode(&self) -> bool {
        self.unknown_opcode_count > 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Dynamics {
    pub has_loops: bool,
    pub can_yield: bool,
    pub observed_yield: bool,
    /// Instructions whose primitive is in the yield-capable set.
    pub yield_sites: Vec<usize>,
    pub max_iterations: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Relationships {
    pub inbound_calls: u32,
    /// Call instructions in the script.
    pub outbound_calls: u32,
    pub lifecycle_hook: Option<LifecycleHook>,
    pub interaction: Option<InteractionBinding>,
    pub is_interaction_guard: bool,
    pub graph_status: Option<NodeStatus>,
}

impl Relationships {
    pub fn is_lifecycle_entry(&self) -> bool {
        self.lifecycle_hook.is_some()
    }

    pub fn is_interaction_action(&self) -> bool {
        self.interaction == Some(InteractionBinding::Action)
    }

    /// Bound to any engine hook or interaction.
    pub fn is_entry_point(&self) -> bool {
        self.is_lifecycle_entry() || self.interaction.is_some() || self.is_interaction_guard
    }
}

/// Structural and relational signature of one script.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BehaviorProfile {
    pub identity: Identity,
    pub structure: Structure,
    pub dynamics: Dynamics,
    pub relationships: Relationships,
    pub reachability: Reachability,
    pub validation_errors: usize,
}

/// Builds profiles. Holds the static yield set so callers can swap it.
#[derive(Clone, Debug)]
pub struct Profiler {
    yield_set: BTreeSet<u16>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::with_yield_set(opcodes::yield_capable_opcodes())
    }
}

impl Profiler {
    pub fn with_yield_set(opcodes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            yield_set: opcodes.into_iter().collect(),
        }
    }

    pub fn profile(
        &self,
        context: &AnalysisContext,
        evidence: &RelationalEvidence,
        graph: Option<&CallGraph>,
    ) -> BehaviorProfile {
        let instructions = &context.decoded.instructions;
        let cfg = &context.cfg;
        let count = instructions.len();

        let has_branching = instructions.iter().any(|inst| {
            cfg.reachable[inst.index]
                && inst.flow() == Flow::Branch
                && inst.true_target(count) != inst.false_target(count)
        });
        let dead_instruction_count = cfg.dead_instructions().len();
        let yield_sites: Vec<usize> = instructions
            .iter()
            .filter(|inst| self.yield_set.contains(&inst.opcode))
            .map(|inst| inst.index)
            .collect();
        let invalid_targets = cfg
            .edges
            .iter()
            .filter(|edge| matches!(edge.to, EdgeTarget::Invalid { .. }))
            .count();
        let validation_errors = context.decoded.operand_issue_count()
            + invalid_targets
            + usize::from(context.decoded.is_truncated());

        let graph_status = graph.and_then(|graph| graph.status_of(context.id));
        let inbound_calls = evidence
            .caller_count()
            .unwrap_or_else(|| graph.map_or(0, |graph| graph.caller_count(context.id) as u32));
        let outbound_calls = instructions
            .iter()
            .filter(|inst| inst.call_target().is_some())
            .count() as u32;

        let reachability = if dead_instruction_count > 0 {
            Reachability::HasDeadCode
        } else if graph_status == Some(NodeStatus::Orphan) {
            Reachability::Unreachable
        } else {
            Reachability::FullyReachable
        };

        BehaviorProfile {
            identity: Identity {
                id: context.id,
                owner: context.owner.clone(),
                scope: ScriptScope::of(context.id),
            },
            structure: Structure {
                instruction_count: count,
                declared_instruction_count: context.decoded.declared_count,
                arg_count: context.arg_count,
                local_count: context.local_count,
                unknown_opcode_count: context.decoded.unknown_opcode_count(),
                has_branching,
                dead_instruction_count,
                truncated: context.decoded.is_truncated(),
            },
            dynamics: Dynamics {
                has_loops: cfg.has_loops(),
                can_yield: evidence.observed_yield || !yield_sites.is_empty(),
                observed_yield: evidence.observed_yield,
                yield_sites,
                max_iterations: evidence.max_iterations,
            },
            relationships: Relationships {
                inbound_calls,
                outbound_calls,
                lifecycle_hook: evidence.lifecycle_hook,
                interaction: evidence.interaction,
                is_interaction_guard: evidence.is_interaction_guard(),
                graph_status,
            },
            reachability,
            validation_errors,
        }
    }
}
