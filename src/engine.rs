//! Per-script pipeline: decode, build the CFG, lint, profile and classify.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::callgraph::CallGraph;
use crate::cfg::build_cfg;
use crate::classify::{ClassificationResult, Classifier};
use crate::decoder::{Decoded, ScriptImage, decode_image};
use crate::error::DecodeError;
use crate::evidence::RelationalEvidence;
use crate::ir::ControlFlowGraph;
use crate::profile::{BehaviorProfile, Profiler};
use crate::rules::{self, Finding};

/// Tunables shared by every stage.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Stack depth above which the stack-balance pass warns.
    pub max_stack_depth: i32,
    /// Report temporaries read before any write. Callers can preload
    /// temporaries, so these are informational.
    pub report_temp_reads: bool,
    /// Worker threads for corpus runs; 0 lets rayon decide.
    pub jobs: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            max_stack_depth: 256,
            report_temp_reads: true,
            jobs: 0,
        }
    }
}

/// Everything the lint passes and the profiler read for one script.
#[derive(Clone, Debug)]
pub struct AnalysisContext {
    pub id: u16,
    pub owner: String,
    pub arg_count: u8,
    pub local_count: u8,
    pub decoded: Decoded,
    pub cfg: ControlFlowGraph,
    pub options: AnalysisOptions,
}

/// Decode a script image and build its CFG.
pub fn prepare(
    image: &ScriptImage,
    options: &AnalysisOptions,
) -> Result<AnalysisContext, DecodeError> {
    let decoded = decode_image(image)?;
    let cfg = build_cfg(&decoded.instructions);
    debug!(
        script = image.id,
        instructions = decoded.instructions.len(),
        blocks = cfg.blocks.len(),
        "built control flow graph"
    );
    Ok(AnalysisContext {
        id: image.id,
        owner: image.owner.clone(),
        arg_count: image.arg_count,
        local_count: image.local_count,
        decoded,
        cfg,
        options: options.clone(),
    })
}

/// Full result for one script.
#[derive(Clone, Debug, Serialize)]
pub struct ScriptReport {
    pub id: u16,
    pub owner: String,
    pub decode_status: crate::decoder::DecodeStatus,
    pub findings: Vec<Finding>,
    pub profile: BehaviorProfile,
    pub classification: ClassificationResult,
}

/// Run the per-script stages that need no other script: lints only.
pub fn lint(context: &AnalysisContext) -> Vec<Finding> {
    rules::run_all(context)
}

/// Profile and classify a prepared script.
pub fn assess(
    context: &AnalysisContext,
    findings: Vec<Finding>,
    evidence: &RelationalEvidence,
    graph: Option<&CallGraph>,
    profiler: &Profiler,
    classifier: &Classifier,
) -> ScriptReport {
    let profile = profiler.profile(context, evidence, graph);
    let classification = classifier.classify(&profile);
    ScriptReport {
        id: context.id,
        owner: context.owner.clone(),
        decode_status: context.decoded.status.clone(),
        findings,
        profile,
        classification,
    }
}

/// Analyze one script on its own, without a call graph.
pub fn analyze_script(
    image: &ScriptImage,
    evidence: &RelationalEvidence,
    options: &AnalysisOptions,
) -> Result<ScriptReport, DecodeError> {
    let context = prepare(image, options)?;
    let findings = lint(&context);
    Ok(assess(
        &context,
        findings,
        evidence,
        None,
        &Profiler::default(),
        &Classifier::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Role;
    use crate::decoder::encode_record;
    use crate::evidence::LifecycleHook;
    use crate::opcodes::{ANIMATE_SIM, EXPRESSION, PTR_ERROR, PTR_RETURN_TRUE};
    use crate::rules::Category;

    fn image(records: &[[u8; 12]]) -> ScriptImage {
        ScriptImage {
            id: 0x1000,
            owner: "aquarium".to_string(),
            arg_count: 0,
            local_count: 0,
            instruction_count: records.len(),
            code: records.iter().flatten().copied().collect(),
        }
    }

    #[test]
    fn main_loop_with_animation_is_a_role() {
        let image = image(&[
            encode_record(ANIMATE_SIM, 1, 1, [0; 8]),
            encode_record(EXPRESSION, 0, PTR_RETURN_TRUE, [0, 0, 1, 0, 0, 2, 8, 7]),
        ]);
        let evidence = RelationalEvidence {
            lifecycle_hook: Some(LifecycleHook::Main),
            ..RelationalEvidence::default()
        };

        let report = analyze_script(&image, &evidence, &AnalysisOptions::default())
            .expect("analyze");

        assert_eq!(Role::Role, report.classification.role);
        assert!(report.classification.confidence >= 0.90);
    }

    #[test]
    fn dead_instruction_yields_one_finding_and_penalty() {
        let image = image(&[
            encode_record(EXPRESSION, 2, PTR_ERROR, [0, 0, 1, 0, 0, 2, 8, 7]),
            encode_record(EXPRESSION, 2, PTR_ERROR, [0, 0, 1, 0, 0, 2, 8, 7]),
            encode_record(0x00, PTR_RETURN_TRUE, PTR_ERROR, [0; 8]),
        ]);
        let report = analyze_script(
            &image,
            &RelationalEvidence::default(),
            &AnalysisOptions::default(),
        )
        .expect("analyze");

        let dead: Vec<&Finding> = report
            .findings
            .iter()
            .filter(|finding| finding.category == Category::DeadCode)
            .collect();
        assert_eq!(1, dead.len());
        assert_eq!(1, dead[0].index);
        assert_eq!(
            crate::profile::Reachability::HasDeadCode,
            report.profile.reachability
        );
        assert!(
            report
                .classification
                .notes
                .iter()
                .any(|note| note.contains("dead code"))
        );
    }
}
