use serde::Serialize;

use crate::engine::AnalysisContext;

pub(crate) mod branch_logic;
pub(crate) mod dead_code;
pub(crate) mod stack_balance;
pub(crate) mod variable_usage;

/// Metadata describing an analysis rule.
#[derive(Clone, Debug)]
pub(crate) struct RuleMetadata {
    pub(crate) id: &'static str,
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
}

/// Rule interface for analysis execution.
pub(crate) trait Rule: Send + Sync {
    fn metadata(&self) -> RuleMetadata;
    fn run(&self, context: &AnalysisContext) -> Vec<Finding>;
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DeadCode,
    StackBalance,
    LogicError,
    VariableUsage,
}

/// One lint result, anchored at an instruction index.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Finding {
    pub rule_id: &'static str,
    pub index: usize,
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Finding {
    pub(crate) fn new(
        rule: &RuleMetadata,
        index: usize,
        severity: Severity,
        category: Category,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule.id,
            index,
            severity,
            category,
            message: message.into(),
            suggestion: None,
        }
    }

    pub(crate) fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

pub(crate) fn all_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(dead_code::DeadCodeRule),
        Box::new(stack_balance::StackBalanceRule),
        Box::new(branch_logic::BranchLogicRule),
        Box::new(variable_usage::VariableUsageRule),
    ]
}

/// Run every rule and order the findings by instruction, then category.
pub fn run_all(context: &AnalysisContext) -> Vec<Finding> {
    let mut findings: Vec<Finding> = all_rules()
        .iter()
        .flat_map(|rule| rule.run(context))
        .collect();
    findings.sort_by(|a, b| {
        (a.index, a.category, a.severity, &a.message).cmp(&(
            b.index,
            b.category,
            b.severity,
            &b.message,
        ))
    });
    findings
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::decoder::{ScriptImage, encode_record};
    use crate::engine::{AnalysisContext, AnalysisOptions, prepare};

    /// `param[0] == literal 1`
    pub(crate) const COMPARE: [u8; 8] = [0, 0, 1, 0, 0, 2, 9, 7];

    /// Expression operand bytes.
    pub(crate) fn expr(lhs: (u8, u16), op: u8, rhs: (u8, u16), assign: bool) -> [u8; 8] {
        let l = lhs.1.to_le_bytes();
        let r = rhs.1.to_le_bytes();
        [l[0], l[1], r[0], r[1], assign as u8, op, lhs.0, rhs.0]
    }

    pub(crate) fn record(opcode: u16, t: u8, f: u8, operand: [u8; 8]) -> [u8; 12] {
        encode_record(opcode, t, f, operand)
    }

    pub(crate) fn context_with(
        records: &[[u8; 12]],
        arg_count: u8,
        local_count: u8,
    ) -> AnalysisContext {
        let image = ScriptImage {
            id: 0x1000,
            owner: "lint".to_string(),
            arg_count,
            local_count,
            instruction_count: records.len(),
            code: records.iter().flatten().copied().collect(),
        };
        prepare(&image, &AnalysisOptions::default()).expect("prepare")
    }

    pub(crate) fn context(records: &[[u8; 12]]) -> AnalysisContext {
        context_with(records, 4, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::opcodes::{EXPRESSION, PTR_RETURN_FALSE, PTR_RETURN_TRUE};

    #[test]
    fn clean_script_has_no_findings() {
        let ctx = context(&[record(
            EXPRESSION,
            PTR_RETURN_TRUE,
            PTR_RETURN_FALSE,
            COMPARE,
        )]);
        assert!(run_all(&ctx).is_empty());
    }

    #[test]
    fn rule_ids_are_unique() {
        let mut ids: Vec<&str> = all_rules().iter().map(|rule| rule.metadata().id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(4, ids.len());
    }

    #[test]
    fn findings_carry_a_registered_rule_id() {
        let ctx = context(&[
            record(EXPRESSION, 0, 0, COMPARE),
            record(EXPRESSION, PTR_RETURN_TRUE, PTR_RETURN_FALSE, COMPARE),
        ]);
        let ids: Vec<&str> = all_rules().iter().map(|rule| rule.metadata().id).collect();
        let findings = run_all(&ctx);

        assert!(!findings.is_empty());
        assert!(findings.iter().all(|finding| ids.contains(&finding.rule_id)));
        let indices: Vec<usize> = findings.iter().map(|finding| finding.index).collect();
        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(sorted, indices);
    }
}
