//! Static analysis for behavior-script bytecode.
//!
//! The pipeline for one script is [`decoder::decode`] →
//! [`cfg::build_cfg`] → [`rules::run_all`] and [`profile::Profiler`] →
//! [`classify::Classifier`]. [`batch::analyze_corpus`] runs it over many
//! scripts in parallel and feeds the shared [`callgraph::CallGraph`] back
//! into every profile.

pub mod batch;
pub mod callgraph;
pub mod cfg;
pub mod classify;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod ir;
pub mod opcodes;
pub mod operand;
pub mod profile;
pub mod rules;
pub mod scan;
pub mod scope;

pub use batch::{BatchSummary, CorpusAnalysis, ScriptFailure, analyze_corpus, analyze_loaded};
pub use callgraph::CallGraph;
pub use classify::{ClassificationResult, Classifier, Role};
pub use decoder::{Decoded, DecodeStatus, ScriptImage, decode};
pub use engine::{AnalysisOptions, ScriptReport, analyze_script};
pub use error::{CorpusError, DecodeError};
pub use evidence::{EvidenceTable, RelationalEvidence};
pub use profile::{BehaviorProfile, Profiler, Reachability};
pub use rules::{Finding, Severity};
pub use scan::LoadedCorpus;
