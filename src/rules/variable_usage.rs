use std::collections::{BTreeMap, BTreeSet};

use crate::engine::AnalysisContext;
use crate::operand::{Operand, VariableRef, VariableScope};
use crate::rules::{Category, Finding, Rule, RuleMetadata, Severity};

/// Rule that orders reads and writes of locals and temporaries.
///
/// Reachable instructions are visited in index order; within one
/// instruction the operands it reads are visited before the one it writes.
/// Parameters are only bounds-checked since the caller always sets them.
pub(crate) struct VariableUsageRule;

type Slot = (VariableScope, u16);

impl Rule for VariableUsageRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: "VARIABLE_USAGE",
            name: "Variable usage",
            description: "Reads before writes, writes never read, and out-of-range variable slots",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Vec<Finding> {
        let metadata = self.metadata();
        let mut findings = Vec::new();
        let mut written: BTreeMap<Slot, usize> = BTreeMap::new();
        let mut read: BTreeSet<Slot> = BTreeSet::new();
        let mut out_of_range: BTreeSet<Slot> = BTreeSet::new();

        let instructions = context
            .decoded
            .instructions
            .iter()
            .filter(|inst| context.cfg.reachable[inst.index]);
        for inst in instructions {
            let Operand::Expression(expr) = inst.operand else {
                continue;
            };
            let mut reads = Vec::new();
            if expr.operator.reads_lhs() {
                reads.push(expr.lhs);
            }
            if expr.operator.reads_rhs() {
                reads.push(expr.rhs);
            }
            let write = expr.operator.writes_lhs().then_some(expr.lhs);

            for var in reads.iter().chain(write.iter()) {
                if let Some(finding) = check_bounds(&metadata, context, inst.index, var) {
                    if var.slot().is_some_and(|slot| out_of_range.insert(slot)) {
                        findings.push(finding);
                    }
                }
            }

            for var in &reads {
                let Some(slot) = tracked_slot(var) else {
                    continue;
                };
                let first_read = read.insert(slot);
                if !first_read || written.contains_key(&slot) {
                    continue;
                }
                match slot.0 {
                    VariableScope::Local => findings.push(
                        Finding::new(
                            &metadata,
                            inst.index,
                            Severity::Warning,
                            Category::VariableUsage,
                            format!("{var} is read before any write"),
                        )
                        .with_suggestion("assign the local before this instruction"),
                    ),
                    _ if context.options.report_temp_reads => findings.push(Finding::new(
                        &metadata,
                        inst.index,
                        Severity::Info,
                        Category::VariableUsage,
                        format!("{var} is read before any write; the caller may set it"),
                    )),
                    _ => {}
                }
            }

            if let Some(slot) = write.as_ref().and_then(tracked_slot) {
                written.entry(slot).or_insert(inst.index);
            }
        }

        // Callees can read temporaries, so unread temps only count when the
        // script makes no calls.
        let makes_calls = context
            .decoded
            .instructions
            .iter()
            .any(|inst| inst.call_target().is_some());
        for (slot, index) in written {
            if read.contains(&slot) {
                continue;
            }
            let var = VariableRef::Indexed {
                scope: slot.0,
                index: slot.1,
            };
            match slot.0 {
                VariableScope::Local => findings.push(Finding::new(
                    &metadata,
                    index,
                    Severity::Warning,
                    Category::VariableUsage,
                    format!("{var} is written but never read"),
                )),
                _ if !makes_calls => findings.push(Finding::new(
                    &metadata,
                    index,
                    Severity::Info,
                    Category::VariableUsage,
                    format!("{var} is written but never read"),
                )),
                _ => {}
            }
        }

        findings
    }
}

fn tracked_slot(var: &VariableRef) -> Option<Slot> {
    var.slot()
        .filter(|(scope, _)| matches!(scope, VariableScope::Local | VariableScope::Temporary))
}

fn check_bounds(
    metadata: &RuleMetadata,
    context: &AnalysisContext,
    index: usize,
    var: &VariableRef,
) -> Option<Finding> {
    let (scope, slot) = var.slot()?;
    let (declared, what) = match scope {
        VariableScope::Local => (context.local_count, "locals"),
        VariableScope::Parameter => (context.arg_count, "arguments"),
        _ => return None,
    };
    if slot < u16::from(declared) {
        return None;
    }
    Some(Finding::new(
        metadata,
        index,
        Severity::Error,
        Category::VariableUsage,
        format!("{var} is out of range; the script declares {declared} {what}"),
    ))
}
