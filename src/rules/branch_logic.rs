use crate::engine::AnalysisContext;
use crate::ir::{Flow, Instruction, PointerTarget};
use crate::rules::{Category, Finding, Rule, RuleMetadata, Severity};

/// Rule that flags branch pointers which cannot be what the author meant.
pub(crate) struct BranchLogicRule;

impl Rule for BranchLogicRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: "BRANCH_LOGIC",
            name: "Branch logic",
            description: "Self-loops, identical branches and out-of-range branch targets",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Vec<Finding> {
        let metadata = self.metadata();
        let instructions = &context.decoded.instructions;
        let count = instructions.len();
        let mut findings = Vec::new();

        for inst in instructions {
            let branches = inst.flow() == Flow::Branch;
            let mut pointers = vec![("true", inst.true_pointer)];
            if branches {
                pointers.push(("false", inst.false_pointer));
            }

            for (side, pointer) in &pointers {
                if let PointerTarget::Invalid(raw) = PointerTarget::resolve(*pointer, count) {
                    findings.push(out_of_range_finding(&metadata, inst, side, raw, count));
                }
            }

            if pointers
                .iter()
                .any(|(_, pointer)| *pointer as usize == inst.index)
            {
                findings.push(self_loop_finding(&metadata, inst));
            }

            if branches && inst.true_pointer == inst.false_pointer {
                findings.push(
                    Finding::new(
                        &metadata,
                        inst.index,
                        Severity::Warning,
                        Category::LogicError,
                        format!(
                            "both branches of {} lead to {}",
                            inst.mnemonic(),
                            inst.true_target(count)
                        ),
                    )
                    .with_suggestion("the outcome is ignored; check the false pointer"),
                );
            }
        }

        findings
    }
}

fn out_of_range_finding(
    metadata: &RuleMetadata,
    inst: &Instruction,
    side: &str,
    raw: u8,
    count: usize,
) -> Finding {
    let last = count.saturating_sub(1);
    Finding::new(
        metadata,
        inst.index,
        Severity::Error,
        Category::LogicError,
        format!("{side} pointer {raw} is past the last instruction ({last}) and not a return code"),
    )
    .with_suggestion("point it at an instruction or at return true/false/error")
}

fn self_loop_finding(metadata: &RuleMetadata, inst: &Instruction) -> Finding {
    // A yielding primitive that retries itself waits across ticks; anything
    // else spins without ever giving control back.
    let severity = if inst.yields() {
        Severity::Warning
    } else {
        Severity::Error
    };
    Finding::new(
        metadata,
        inst.index,
        severity,
        Category::LogicError,
        format!("instruction {} ({}) branches to itself", inst.index, inst.mnemonic()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{
        EXPRESSION, IDLE_FOR_INPUT, PTR_ERROR, PTR_RETURN_FALSE, PTR_RETURN_TRUE, SLEEP,
    };
    use crate::rules::test_support::{COMPARE, context, record};

    #[test]
    fn out_of_range_true_pointer_is_an_error() {
        let ctx = context(&[record(EXPRESSION, 7, PTR_RETURN_FALSE, COMPARE)]);
        let findings = BranchLogicRule.run(&ctx);
        assert_eq!(1, findings.len());
        assert_eq!(Severity::Error, findings[0].severity);
        assert!(findings[0].message.starts_with("true pointer 7"));
    }

    #[test]
    fn unused_false_pointer_of_continuing_primitive_is_ignored() {
        let ctx = context(&[record(SLEEP, PTR_RETURN_TRUE, 77, [0; 8])]);
        assert!(BranchLogicRule.run(&ctx).is_empty());
    }

    #[test]
    fn self_loop_is_error_unless_primitive_yields() {
        let spinning = context(&[record(EXPRESSION, 0, PTR_RETURN_TRUE, COMPARE)]);
        let findings = BranchLogicRule.run(&spinning);
        assert_eq!(1, findings.len());
        assert_eq!(Severity::Error, findings[0].severity);

        let waiting = context(&[record(IDLE_FOR_INPUT, 0, PTR_RETURN_TRUE, [0; 8])]);
        let findings = BranchLogicRule.run(&waiting);
        assert_eq!(1, findings.len());
        assert_eq!(Severity::Warning, findings[0].severity);
    }

    #[test]
    fn identical_branches_are_reported() {
        let ctx = context(&[record(EXPRESSION, PTR_ERROR, PTR_ERROR, COMPARE)]);
        let findings = BranchLogicRule.run(&ctx);
        assert_eq!(1, findings.len());
        assert!(findings[0].message.contains("both branches"));
        assert!(findings[0].message.ends_with("error"));
    }
}
