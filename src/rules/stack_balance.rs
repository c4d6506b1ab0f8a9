use std::collections::{BTreeSet, VecDeque};

use crate::engine::AnalysisContext;
use crate::ir::{EdgeTarget, Instruction};
use crate::rules::{Category, Finding, Rule, RuleMetadata, Severity};

/// Rule that simulates the found-action stack depth along every path.
pub(crate) struct StackBalanceRule;

impl Rule for StackBalanceRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: "STACK_BALANCE",
            name: "Stack balance",
            description: "Stack underflow, excessive depth, or paths joining at different depths",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Vec<Finding> {
        let metadata = self.metadata();
        let instructions = &context.decoded.instructions;
        if instructions.is_empty() {
            return Vec::new();
        }

        let max_depth = context.options.max_stack_depth;
        let mut depth_at: Vec<Option<i32>> = vec![None; instructions.len()];
        let mut underflow = BTreeSet::new();
        let mut overflow = BTreeSet::new();
        let mut mismatched = BTreeSet::new();
        let mut findings = Vec::new();

        depth_at[0] = Some(0);
        let mut queue = VecDeque::from([0usize]);
        while let Some(index) = queue.pop_front() {
            let Some(depth) = depth_at[index] else {
                continue;
            };
            let inst = &instructions[index];
            let after = depth + inst.stack_effect();
            if after < 0 && underflow.insert(index) {
                findings.push(underflow_finding(&metadata, inst, depth));
            }
            if after > max_depth && overflow.insert(index) {
                findings.push(Finding::new(
                    &metadata,
                    index,
                    Severity::Warning,
                    Category::StackBalance,
                    format!("stack depth reaches {after}, above the limit of {max_depth}"),
                ));
            }

            for edge in context.cfg.edges_from(index) {
                let EdgeTarget::Block { index: next, .. } = edge.to else {
                    continue;
                };
                match depth_at[next] {
                    None => {
                        depth_at[next] = Some(after);
                        queue.push_back(next);
                    }
                    Some(seen) if seen != after && mismatched.insert(next) => {
                        findings.push(mismatch_finding(&metadata, next, seen, after));
                    }
                    Some(_) => {}
                }
            }
        }

        findings
    }
}

fn mismatch_finding(metadata: &RuleMetadata, index: usize, seen: i32, after: i32) -> Finding {
    Finding::new(
        metadata,
        index,
        Severity::Warning,
        Category::StackBalance,
        format!("paths reach instruction {index} with stack depths {seen} and {after}"),
    )
    .with_suggestion("balance pushes and pops on every path into this instruction")
}

fn underflow_finding(metadata: &RuleMetadata, inst: &Instruction, depth: i32) -> Finding {
    Finding::new(
        metadata,
        inst.index,
        Severity::Error,
        Category::StackBalance,
        format!("{} pops from a stack of depth {depth}", inst.mnemonic()),
    )
    .with_suggestion("push a value on every path before this instruction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{
        EXPRESSION, FIND_BEST_INTERACTION, GOSUB_FOUND_ACTION, PTR_ERROR, PTR_RETURN_FALSE,
        PTR_RETURN_TRUE,
    };
    use crate::rules::test_support::{context, expr, record};

    #[test]
    fn balanced_push_pop_is_clean() {
        let ctx = context(&[
            record(FIND_BEST_INTERACTION, 1, PTR_RETURN_FALSE, [0; 8]),
            record(GOSUB_FOUND_ACTION, PTR_RETURN_TRUE, PTR_RETURN_FALSE, [0; 8]),
        ]);
        assert!(StackBalanceRule.run(&ctx).is_empty());
    }

    #[test]
    fn pop_on_empty_stack_is_an_error() {
        let ctx = context(&[record(
            GOSUB_FOUND_ACTION,
            PTR_RETURN_TRUE,
            PTR_RETURN_FALSE,
            [0; 8],
        )]);
        let findings = StackBalanceRule.run(&ctx);
        assert_eq!(1, findings.len());
        assert_eq!(Severity::Error, findings[0].severity);
        assert_eq!(0, findings[0].index);
    }

    #[test]
    fn expression_pop_counts_as_a_pop() {
        let pop = expr((8, 0), 19, (7, 0), true);
        let ctx = context(&[record(EXPRESSION, PTR_RETURN_TRUE, PTR_ERROR, pop)]);
        let findings = StackBalanceRule.run(&ctx);
        assert_eq!(1, findings.len());
        assert!(findings[0].message.contains("depth 0"));
    }

    #[test]
    fn push_in_a_loop_reports_mismatched_join() {
        let push = expr((8, 0), 18, (7, 0), true);
        let ctx = context(&[
            record(EXPRESSION, 1, PTR_ERROR, push),
            record(EXPRESSION, 0, PTR_RETURN_TRUE, expr((9, 0), 2, (7, 1), false)),
        ]);
        let findings = StackBalanceRule.run(&ctx);
        assert_eq!(1, findings.len());
        assert_eq!(0, findings[0].index);
        assert!(findings[0].message.contains("depths 0 and 1"));
    }

    #[test]
    fn depth_above_limit_is_a_warning() {
        let push = expr((8, 0), 18, (7, 0), true);
        let mut ctx = context(&[
            record(EXPRESSION, 1, PTR_ERROR, push),
            record(EXPRESSION, PTR_RETURN_TRUE, PTR_ERROR, push),
        ]);
        ctx.options.max_stack_depth = 1;
        let findings = StackBalanceRule.run(&ctx);
        assert_eq!(1, findings.len());
        assert_eq!(Severity::Warning, findings[0].severity);
        assert_eq!(1, findings[0].index);
    }
}
