//! Cross-script call graph.
//!
//! Nodes live in a flat arena addressed by [`NodeId`]; edges are pairs of
//! handles. Per-script call extraction is independent and can run in
//! parallel; [`CallGraph::build`] is the single merge step.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;

use crate::evidence::{EvidenceTable, HookBinding};
use crate::ir::Instruction;
use crate::scope::ScriptScope;

/// Callers needed before a script counts as a utility.
pub const UTILITY_CALLERS: usize = 3;

/// Handle into the node arena.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NodeId(pub u32);

/// Calls made by one script, extracted from its instructions.
#[derive(Clone, Debug)]
pub struct ScriptCalls {
    pub script_id: u16,
    pub owner: String,
    pub instruction_count: usize,
    /// Target ids with the number of call sites for each.
    pub callees: BTreeMap<u16, usize>,
}

/// Collect subroutine-call targets from a script's instructions.
pub fn extract_calls(
    script_id: u16,
    owner: &str,
    instructions: &[Instruction],
) -> ScriptCalls {
    let mut callees = BTreeMap::new();
    for target in instructions.iter().filter_map(Instruction::call_target) {
        *callees.entry(target).or_insert(0) += 1;
    }
    ScriptCalls {
        script_id,
        owner: owner.to_string(),
        instruction_count: instructions.len(),
        callees,
    }
}

/// One script in the graph.
#[derive(Clone, Debug, Serialize)]
pub struct CallGraphNode {
    pub id: NodeId,
    pub script_id: u16,
    pub owner: Option<String>,
    pub scope: ScriptScope,
    pub instruction_count: usize,
    /// Called from the corpus but not part of it.
    pub external: bool,
    /// Calls itself.
    pub recursive: bool,
    pub callers: BTreeSet<NodeId>,
    pub callees: BTreeSet<NodeId>,
    pub hooks: Vec<HookBinding>,
}

/// Structural role of a node in the graph.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// No callers, at least one external hook.
    Entry,
    /// Three or more callers.
    Utility,
    /// Neither callers nor hooks.
    Orphan,
    Internal,
}

/// How control gets from the source to the callee.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Call,
    LifecycleHook,
    InteractionAction,
    InteractionGuard,
}

impl CallKind {
    fn of_hook(hook: HookBinding) -> Self {
        match hook {
            HookBinding::Lifecycle(_) => CallKind::LifecycleHook,
            HookBinding::InteractionAction => CallKind::InteractionAction,
            HookBinding::InteractionGuard => CallKind::InteractionGuard,
        }
    }

    /// Graphviz `style` and `color` attributes.
    pub fn style(self) -> (&'static str, &'static str) {
        match self {
            CallKind::Call => ("solid", "black"),
            CallKind::LifecycleHook => ("bold", "firebrick"),
            CallKind::InteractionAction => ("dashed", "royalblue"),
            CallKind::InteractionGuard => ("dotted", "darkorange"),
        }
    }
}

/// Origin of an edge.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum CallSource {
    Script(NodeId),
    Engine(HookBinding),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CallEdge {
    pub source: CallSource,
    pub callee: NodeId,
    pub kind: CallKind,
    /// Call sites behind this edge; 1 for hook edges.
    pub sites: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CallGraph {
    pub nodes: Vec<CallGraphNode>,
    pub edges: Vec<CallEdge>,
    #[serde(skip)]
    by_script: BTreeMap<u16, NodeId>,
}

impl CallGraph {
    /// Merge per-script call lists and hook evidence into one graph.
    pub fn build(scripts: Vec<ScriptCalls>, evidence: &EvidenceTable) -> Self {
        let mut graph = CallGraph::default();
        let mut scripts = scripts;
        scripts.sort_by_key(|script| script.script_id);

        for script in &scripts {
            let id = graph.intern(script.script_id);
            let node = &mut graph.nodes[id.0 as usize];
            node.owner = Some(script.owner.clone());
            node.instruction_count = script.instruction_count;
            node.external = false;
        }

        for script in &scripts {
            let caller = graph.by_script[&script.script_id];
            for (&target, &sites) in &script.callees {
                let callee = graph.intern(target);
                if callee == caller {
                    graph.nodes[caller.0 as usize].recursive = true;
                } else {
                    graph.nodes[caller.0 as usize].callees.insert(callee);
                    graph.nodes[callee.0 as usize].callers.insert(caller);
                }
                graph.edges.push(CallEdge {
                    source: CallSource::Script(caller),
                    callee,
                    kind: CallKind::Call,
                    sites,
                });
            }
        }

        let scripted: Vec<(u16, NodeId)> = graph
            .by_script
            .iter()
            .map(|(script_id, node)| (*script_id, *node))
            .collect();
        for (script_id, node) in scripted {
            let hooks = evidence.get(script_id).hooks();
            for hook in &hooks {
                graph.edges.push(CallEdge {
                    source: CallSource::Engine(*hook),
                    callee: node,
                    kind: CallKind::of_hook(*hook),
                    sites: 1,
                });
            }
            graph.nodes[node.0 as usize].hooks = hooks;
        }

        graph
    }

    fn intern(&mut self, script_id: u16) -> NodeId {
        if let Some(id) = self.by_script.get(&script_id) {
            return *id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(CallGraphNode {
            id,
            script_id,
            owner: None,
            scope: ScriptScope::of(script_id),
            instruction_count: 0,
            external: true,
            recursive: false,
            callers: BTreeSet::new(),
            callees: BTreeSet::new(),
            hooks: Vec::new(),
        });
        self.by_script.insert(script_id, id);
        id
    }

    pub fn node(&self, id: NodeId) -> &CallGraphNode {
        &self.nodes[id.0 as usize]
    }

    pub fn lookup(&self, script_id: u16) -> Option<&CallGraphNode> {
        self.by_script.get(&script_id).map(|id| self.node(*id))
    }

    pub fn status(&self, id: NodeId) -> NodeStatus {
        let node = self.node(id);
        match (node.callers.len(), node.hooks.is_empty()) {
            (0, false) => NodeStatus::Entry,
            (0, true) => NodeStatus::Orphan,
            (callers, _) if callers >= UTILITY_CALLERS => NodeStatus::Utility,
            _ => NodeStatus::Internal,
        }
    }

    pub fn status_of(&self, script_id: u16) -> Option<NodeStatus> {
        self.by_script.get(&script_id).map(|id| self.status(*id))
    }

    pub fn caller_count(&self, script_id: u16) -> usize {
        self.lookup(script_id).map_or(0, |node| node.callers.len())
    }

    pub fn callee_count(&self, script_id: u16) -> usize {
        self.lookup(script_id).map_or(0, |node| node.callees.len())
    }

    pub fn with_status(&self, status: NodeStatus) -> Vec<&CallGraphNode> {
        self.nodes
            .iter()
            .filter(|node| !node.external && self.status(node.id) == status)
            .collect()
    }

    pub fn entry_points(&self) -> Vec<&CallGraphNode> {
        self.with_status(NodeStatus::Entry)
    }

    pub fn utilities(&self) -> Vec<&CallGraphNode> {
        self.with_status(NodeStatus::Utility)
    }

    pub fn orphans(&self) -> Vec<&CallGraphNode> {
        self.with_status(NodeStatus::Orphan)
    }

    /// Renderer-neutral node and edge lists.
    pub fn export(&self) -> GraphExport {
        let nodes = self
            .nodes
            .iter()
            .map(|node| ExportNode {
                key: node_key(node.id),
                label: match &node.owner {
                    Some(owner) => format!("{:#06x}\n{owner}", node.script_id),
                    None => format!("{:#06x}", node.script_id),
                },
                scope: node.scope,
                color: node.scope.color(),
                status: self.status(node.id),
                external: node.external,
            })
            .collect();

        let edges = self
            .edges
            .iter()
            .map(|edge| {
                let (style, color) = edge.kind.style();
                ExportEdge {
                    source: match edge.source {
                        CallSource::Script(id) => node_key(id),
                        CallSource::Engine(hook) => format!("engine:{hook}"),
                    },
                    target: node_key(edge.callee),
                    kind: edge.kind,
                    style,
                    color,
                }
            })
            .collect();

        GraphExport { nodes, edges }
    }

    /// Graphviz rendering of [`CallGraph::export`].
    pub fn to_dot(&self) -> String {
        self.export().to_dot()
    }
}

fn node_key(id: NodeId) -> String {
    format!("n{}", id.0)
}

#[derive(Clone, Debug, Serialize)]
pub struct ExportNode {
    pub key: String,
    pub label: String,
    pub scope: ScriptScope,
    pub color: &'static str,
    pub status: NodeStatus,
    pub external: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExportEdge {
    pub source: String,
    pub target: String,
    pub kind: CallKind,
    pub style: &'static str,
    pub color: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct GraphExport {
    pub nodes: Vec<ExportNode>,
    pub edges: Vec<ExportEdge>,
}

impl GraphExport {
    pub fn to_dot(&self) -> String {
        let mut out = String::from(
            "digraph calls {\n    rankdir=LR;\n    node [shape=box, style=filled];\n",
        );
        let engines: BTreeSet<&str> = self
            .edges
            .iter()
            .filter(|edge| edge.source.starts_with("engine:"))
            .map(|edge| edge.source.as_str())
            .collect();
        for engine in engines {
            let _ = writeln!(
                out,
                "    \"{}\" [shape=ellipse, style=solid, label=\"{}\"];",
                escape_dot(engine),
                escape_dot(engine.trim_start_matches("engine:"))
            );
        }
        for node in &self.nodes {
            let style = if node.external { "filled,dashed" } else { "filled" };
            let _ = writeln!(
                out,
                "    {} [label=\"{}\", fillcolor={}, style=\"{style}\"];",
                node.key,
                escape_dot(&node.label),
                node.color
            );
        }
        for edge in &self.edges {
            let _ = writeln!(
                out,
                "    \"{}\" -> {} [style={}, color={}];",
                escape_dot(&edge.source),
                edge.target,
                edge.style,
                edge.color
            );
        }
        out.push_str("}\n");
        out
    }
}

/// Escapes text for a quoted Graphviz string. Newlines become `\n` line breaks.
fn escape_dot(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{InteractionBinding, LifecycleHook, RelationalEvidence};

    fn calls(script_id: u16, targets: &[u16]) -> ScriptCalls {
        let mut callees = BTreeMap::new();
        for target in targets {
            *callees.entry(*target).or_insert(0) += 1;
        }
        ScriptCalls {
            script_id,
            owner: "fridge".to_string(),
            instruction_count: 4,
            callees,
        }
    }

    #[test]
    fn callers_and_callees_are_recorded() {
        let graph = CallGraph::build(
            vec![calls(0x1000, &[0x1001, 0x1001]), calls(0x1001, &[])],
            &EvidenceTable::new(),
        );
        assert_eq!(1, graph.caller_count(0x1001));
        assert_eq!(1, graph.callee_count(0x1000));
        assert_eq!(1, graph.edges.len());
        assert_eq!(2, graph.edges[0].sites);
    }

    #[test]
    fn statuses_follow_callers_and_hooks() {
        let mut evidence = EvidenceTable::new();
        evidence.insert(
            0x1000,
            RelationalEvidence {
                lifecycle_hook: Some(LifecycleHook::Main),
                ..RelationalEvidence::default()
            },
        );
        let graph = CallGraph::build(
            vec![
                calls(0x1000, &[0x0100]),
                calls(0x1001, &[0x0100]),
                calls(0x1002, &[0x0100]),
                calls(0x1003, &[]),
                calls(0x0100, &[]),
            ],
            &evidence,
        );

        assert_eq!(Some(NodeStatus::Entry), graph.status_of(0x1000));
        assert_eq!(Some(NodeStatus::Utility), graph.status_of(0x0100));
        assert_eq!(Some(NodeStatus::Orphan), graph.status_of(0x1003));
        let orphans: Vec<u16> = graph.orphans().iter().map(|n| n.script_id).collect();
        assert_eq!(vec![0x1001, 0x1002, 0x1003], orphans);
    }

    #[test]
    fn unknown_callees_become_external_nodes() {
        let graph = CallGraph::build(vec![calls(0x2000, &[0x0123])], &EvidenceTable::new());
        let node = graph.lookup(0x0123).expect("placeholder node");
        assert!(node.external);
        assert_eq!(ScriptScope::Global, node.scope);
        assert!(graph.orphans().iter().all(|n| n.script_id != 0x0123));
    }

    #[test]
    fn recursion_does_not_count_as_a_caller() {
        let graph = CallGraph::build(vec![calls(0x1000, &[0x1000])], &EvidenceTable::new());
        let node = graph.lookup(0x1000).expect("node");
        assert!(node.recursive);
        assert!(node.callers.is_empty());
        assert_eq!(Some(NodeStatus::Orphan), graph.status_of(0x1000));
    }

    #[test]
    fn dot_export_colors_scopes_and_styles_hooks() {
        let mut evidence = EvidenceTable::new();
        evidence.insert(
            0x1000,
            RelationalEvidence {
                interaction: Some(InteractionBinding::Guard),
                ..RelationalEvidence::default()
            },
        );
        let graph = CallGraph::build(vec![calls(0x1000, &[0x2001])], &evidence);
        let dot = graph.to_dot();

        assert!(dot.starts_with("digraph calls {"));
        assert!(dot.contains("fillcolor=lightgreen"));
        assert!(dot.contains("fillcolor=khaki"));
        assert!(
            dot.contains("\"engine:interaction:guard\" -> n0 [style=dotted, color=darkorange];")
        );
        assert!(dot.contains("\"n0\" -> n1 [style=solid, color=black];"));
    }

    #[test]
    fn dot_labels_escape_quotes_and_backslashes() {
        let script = ScriptCalls {
            owner: "Chair \"Deluxe\" C:\\seat".to_string(),
            ..calls(0x1000, &[])
        };
        let graph = CallGraph::build(vec![script], &EvidenceTable::new());

        assert_eq!(
            "0x1000\nChair \"Deluxe\" C:\\seat",
            graph.export().nodes[0].label
        );
        let dot = graph.to_dot();
        assert!(dot.contains(
            "n0 [label=\"0x1000\\nChair \\\"Deluxe\\\" C:\\\\seat\", fillcolor=lightgreen"
        ));
    }

    #[test]
    fn build_is_order_independent() {
        let forward = CallGraph::build(
            vec![calls(0x1000, &[0x1001]), calls(0x1001, &[])],
            &EvidenceTable::new(),
        );
        let reversed = CallGraph::build(
            vec![calls(0x1001, &[]), calls(0x1000, &[0x1001])],
            &EvidenceTable::new(),
        );
        assert_eq!(forward.to_dot(), reversed.to_dot());
    }
}
