use crate::engine::AnalysisContext;
use crate::rules::{Category, Finding, Rule, RuleMetadata, Severity};

/// Rule that reports instructions unreachable from the entry block.
pub(crate) struct DeadCodeRule;

impl Rule for DeadCodeRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: "DEAD_CODE",
            name: "Unreachable instruction",
            description: "Instructions no path from the entry block reaches",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Vec<Finding> {
        let metadata = self.metadata();
        context
            .cfg
            .dead_instructions()
            .into_iter()
            .map(|index| {
                let inst = &context.decoded.instructions[index];
                Finding::new(
                    &metadata,
                    index,
                    Severity::Warning,
                    Category::DeadCode,
                    format!("instruction {index} ({}) is never reached", inst.mnemonic()),
                )
                .with_suggestion("point a live branch at it or remove it from the tree")
            })
            .collect()
    }
}
