//! Corpus runs.
//!
//! Work happens in three phases: every script is decoded and linted in
//! parallel, the call graph is built once from all extracted calls, and then
//! every script is profiled and classified in parallel against that graph.
//! A script that fails to decode, or that the loader already rejected, is
//! recorded and skipped; it never stops the batch.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::callgraph::{CallGraph, ScriptCalls, extract_calls};
use crate::classify::{Classifier, Role};
use crate::decoder::{DecodeStatus, ScriptImage};
use crate::engine::{AnalysisContext, AnalysisOptions, ScriptReport, assess, lint, prepare};
use crate::evidence::EvidenceTable;
use crate::profile::Profiler;
use crate::rules::{Finding, Severity};
use crate::scan::LoadedCorpus;

/// A script that produced no report.
#[derive(Clone, Debug, Serialize)]
pub struct ScriptFailure {
    pub id: u16,
    pub owner: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchSummary {
    pub scripts: usize,
    pub decoded: usize,
    pub partial: usize,
    pub failed: usize,
    pub findings: BTreeMap<Severity, usize>,
    pub roles: BTreeMap<Role, usize>,
    pub entry_points: usize,
    pub utilities: usize,
    pub orphans: usize,
}

/// Everything a corpus run produces, ordered by script id.
#[derive(Debug, Serialize)]
pub struct CorpusAnalysis {
    pub reports: Vec<ScriptReport>,
    pub failures: Vec<ScriptFailure>,
    pub graph: CallGraph,
    pub summary: BatchSummary,
}

struct Linted {
    context: AnalysisContext,
    findings: Vec<Finding>,
}

pub fn analyze_corpus(
    images: Vec<ScriptImage>,
    evidence: &EvidenceTable,
    options: &AnalysisOptions,
) -> CorpusAnalysis {
    analyze_loaded(
        LoadedCorpus {
            images,
            rejected: Vec::new(),
        },
        evidence,
        options,
    )
}

/// Like [`analyze_corpus`], with the loader's rejected scripts reported as
/// failures.
pub fn analyze_loaded(
    corpus: LoadedCorpus,
    evidence: &EvidenceTable,
    options: &AnalysisOptions,
) -> CorpusAnalysis {
    if options.jobs == 0 {
        return run(corpus, evidence, options);
    }
    match rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs)
        .build()
    {
        Ok(pool) => pool.install(|| run(corpus, evidence, options)),
        Err(err) => {
            warn!(jobs = options.jobs, error = %err, "falling back to the global thread pool");
            run(corpus, evidence, options)
        }
    }
}

fn run(
    corpus: LoadedCorpus,
    evidence: &EvidenceTable,
    options: &AnalysisOptions,
) -> CorpusAnalysis {
    let script_count = corpus.len();
    let LoadedCorpus { images, rejected } = corpus;
    info!(scripts = script_count, "analyzing corpus");

    let prepared: Vec<Result<Linted, ScriptFailure>> = images
        .par_iter()
        .map(|image| match prepare(image, options) {
            Ok(context) => {
                let findings = lint(&context);
                Ok(Linted { context, findings })
            }
            Err(err) => Err(ScriptFailure {
                id: image.id,
                owner: image.owner.clone(),
                error: err.to_string(),
            }),
        })
        .collect();

    let mut calls: Vec<ScriptCalls> = prepared
        .par_iter()
        .zip(images.par_iter())
        .map(|(result, image)| match result {
            Ok(linted) => extract_calls(
                linted.context.id,
                &linted.context.owner,
                &linted.context.decoded.instructions,
            ),
            Err(_) => opaque_calls(image.id, &image.owner),
        })
        .collect();
    calls.extend(rejected.iter().map(|failure| opaque_calls(failure.id, &failure.owner)));
    let graph = CallGraph::build(calls, evidence);
    debug!(
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        "built call graph"
    );

    let mut failures = rejected;
    let mut linted = Vec::new();
    for result in prepared {
        match result {
            Ok(script) => linted.push(script),
            Err(failure) => {
                warn!(
                    script = failure.id,
                    owner = %failure.owner,
                    error = %failure.error,
                    "skipping script"
                );
                failures.push(failure);
            }
        }
    }

    let profiler = Profiler::default();
    let classifier = Classifier::default();
    let mut reports: Vec<ScriptReport> = linted
        .into_par_iter()
        .map(|script| {
            assess(
                &script.context,
                script.findings,
                evidence.get(script.context.id),
                Some(&graph),
                &profiler,
                &classifier,
            )
        })
        .collect();

    reports.sort_by_key(|report| report.id);
    failures.sort_by_key(|failure| failure.id);

    let summary = summarize(script_count, &reports, &failures, &graph);
    info!(
        scripts = summary.scripts,
        failed = summary.failed,
        partial = summary.partial,
        "corpus analysis finished"
    );
    CorpusAnalysis {
        reports,
        failures,
        graph,
        summary,
    }
}

/// Keeps a script without usable code in the graph so calls into it still
/// resolve to a corpus node.
fn opaque_calls(script_id: u16, owner: &str) -> ScriptCalls {
    ScriptCalls {
        script_id,
        owner: owner.to_string(),
        instruction_count: 0,
        callees: BTreeMap::new(),
    }
}

fn summarize(
    scripts: usize,
    reports: &[ScriptReport],
    failures: &[ScriptFailure],
    graph: &CallGraph,
) -> BatchSummary {
    let mut summary = BatchSummary {
        scripts,
        failed: failures.len(),
        entry_points: graph.entry_points().len(),
        utilities: graph.utilities().len(),
        orphans: graph.orphans().len(),
        ..BatchSummary::default()
    };
    for report in reports {
        match report.decode_status {
            DecodeStatus::Complete => summary.decoded += 1,
            DecodeStatus::Partial(_) => summary.partial += 1,
        }
        for finding in &report.findings {
            *summary.findings.entry(finding.severity).or_insert(0) += 1;
        }
        *summary.roles.entry(report.classification.role).or_insert(0) += 1;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::encode_record;
    use crate::evidence::{LifecycleHook, RelationalEvidence};
    use crate::opcodes::{EXPRESSION, PTR_ERROR, PTR_RETURN_FALSE, PTR_RETURN_TRUE, SLEEP};
    use crate::profile::Reachability;

    fn image(id: u16, records: &[[u8; 12]]) -> ScriptImage {
        ScriptImage {
            id,
            owner: "lamp".to_string(),
            arg_count: 0,
            local_count: 0,
            instruction_count: records.len(),
            code: records.iter().flatten().copied().collect(),
        }
    }

    fn corpus() -> Vec<ScriptImage> {
        vec![
            image(
                0x1002,
                &[encode_record(SLEEP, PTR_RETURN_TRUE, PTR_ERROR, [0; 8])],
            ),
            image(
                0x1000,
                &[
                    encode_record(0x1002, 1, PTR_ERROR, [0; 8]),
                    encode_record(EXPRESSION, 0, PTR_RETURN_TRUE, [0, 0, 1, 0, 0, 2, 8, 7]),
                ],
            ),
            ScriptImage {
                instruction_count: 300,
                ..image(0x1001, &[])
            },
        ]
    }

    fn evidence() -> EvidenceTable {
        [(
            0x1000,
            RelationalEvidence {
                lifecycle_hook: Some(LifecycleHook::Main),
                ..RelationalEvidence::default()
            },
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn failing_script_does_not_stop_the_batch() {
        let analysis = analyze_corpus(corpus(), &evidence(), &AnalysisOptions::default());

        assert_eq!(1, analysis.failures.len());
        assert_eq!(0x1001, analysis.failures[0].id);
        assert!(analysis.failures[0].error.contains("300"));
        let ids: Vec<u16> = analysis.reports.iter().map(|r| r.id).collect();
        assert_eq!(vec![0x1000, 0x1002], ids);
        assert_eq!(3, analysis.summary.scripts);
        assert_eq!(2, analysis.summary.decoded);
        assert_eq!(1, analysis.summary.failed);
    }

    #[test]
    fn graph_counts_feed_profiles() {
        let analysis = analyze_corpus(corpus(), &evidence(), &AnalysisOptions::default());

        let callee = &analysis.reports[1];
        assert_eq!(1, callee.profile.relationships.inbound_calls);
        let main = &analysis.reports[0];
        assert_eq!(Role::Role, main.classification.role);
        assert_eq!(1, analysis.summary.entry_points);
        assert_eq!(Some(&1), analysis.summary.roles.get(&Role::Role));
    }

    #[test]
    fn thread_count_does_not_change_results() {
        let parallel = analyze_corpus(corpus(), &evidence(), &AnalysisOptions::default());
        let serial = analyze_corpus(
            corpus(),
            &evidence(),
            &AnalysisOptions {
                jobs: 1,
                ..AnalysisOptions::default()
            },
        );
        assert_eq!(
            serde_json::to_string(&parallel.reports).expect("serialize"),
            serde_json::to_string(&serial.reports).expect("serialize"),
        );
    }

    #[test]
    fn orphan_with_dead_code_keeps_the_dead_code_penalty() {
        let assign_temp = [0, 0, 5, 0, 1, 5, 8, 7];
        let script = image(
            0x1000,
            &[
                encode_record(EXPRESSION, 2, PTR_ERROR, assign_temp),
                encode_record(SLEEP, PTR_RETURN_TRUE, PTR_ERROR, [0; 8]),
                encode_record(SLEEP, PTR_RETURN_TRUE, PTR_ERROR, [0; 8]),
            ],
        );
        let analysis = analyze_corpus(
            vec![script],
            &EvidenceTable::new(),
            &AnalysisOptions::default(),
        );

        let report = &analysis.reports[0];
        assert_eq!(1, analysis.summary.orphans);
        assert_eq!(Reachability::HasDeadCode, report.profile.reachability);
        let notes = &report.classification.notes;
        assert!(notes.iter().any(|note| note.contains("dead code")), "{notes:?}");
        assert!(notes.iter().any(|note| note.contains("no caller or hook")));
        assert_eq!(0.40, report.classification.confidence);
    }

    #[test]
    fn rejected_scripts_join_the_failures_and_the_graph() {
        let caller = image(
            0x1000,
            &[encode_record(0x1003, PTR_RETURN_TRUE, PTR_ERROR, [0; 8])],
        );
        let corpus = LoadedCorpus {
            images: vec![caller],
            rejected: vec![ScriptFailure {
                id: 0x1003,
                owner: "lamp".to_string(),
                error: "script 0x1003: code is not valid hex".to_string(),
            }],
        };
        let analysis = analyze_loaded(corpus, &EvidenceTable::new(), &AnalysisOptions::default());

        assert_eq!(2, analysis.summary.scripts);
        assert_eq!(1, analysis.summary.failed);
        assert_eq!(1, analysis.reports.len());
        assert_eq!(0x1003, analysis.failures[0].id);
        let node = analysis.graph.lookup(0x1003).expect("rejected node");
        assert!(!node.external);
        assert_eq!(1, analysis.graph.caller_count(0x1003));
    }

    #[test]
    fn partial_decode_is_counted() {
        let mut truncated = image(
            0x2000,
            &[encode_record(EXPRESSION, PTR_RETURN_TRUE, PTR_RETURN_FALSE, [0; 8])],
        );
        truncated.instruction_count = 2;
        let analysis = analyze_corpus(
            vec![truncated],
            &EvidenceTable::new(),
            &AnalysisOptions::default(),
        );
        assert_eq!(1, analysis.summary.partial);
        assert_eq!(0, analysis.summary.decoded);
    }
}
