use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use bhavscope::batch::{BatchSummary, CorpusAnalysis, ScriptFailure, analyze_loaded};
use bhavscope::engine::{AnalysisOptions, ScriptReport};
use bhavscope::evidence::EvidenceTable;
use bhavscope::rules::Finding;
use bhavscope::scan::{load_corpus, load_evidence};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use serde_sarif::sarif::{
    Invocation, Location, LogicalLocation, Message, Result as SarifResult, Run, SCHEMA_URL, Sarif,
    Tool, ToolComponent,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI arguments for bhavscope execution.
#[derive(Parser, Debug)]
#[command(
    name = "bhavscope",
    about = "Deterministic CFG, lint and role classification for behavior-script bytecode.",
    version
)]
struct Cli {
    /// Manifest (.json), bundle (.zip) or directory of manifests.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Relational evidence: hooks, interactions, caller counts.
    #[arg(long, value_name = "PATH")]
    evidence: Option<PathBuf>,
    /// SARIF destination; `-` or absent writes to stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// JSON classification report.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Graphviz call graph.
    #[arg(long, value_name = "PATH")]
    graph: Option<PathBuf>,
    #[arg(long, value_name = "N", default_value_t = 256)]
    max_stack_depth: i32,
    /// Worker threads; 0 picks one per core.
    #[arg(long, value_name = "N", default_value_t = 0)]
    jobs: usize,
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    run(cli)
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("bhavscope=debug")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bhavscope=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }

    let started_at = Instant::now();
    let corpus = load_corpus(&cli.input)?;
    let evidence = match &cli.evidence {
        Some(path) => load_evidence(path)?,
        None => EvidenceTable::new(),
    };
    let options = AnalysisOptions {
        max_stack_depth: cli.max_stack_depth,
        jobs: cli.jobs,
        ..AnalysisOptions::default()
    };
    let loaded_at = Instant::now();

    let analysis = analyze_loaded(corpus, &evidence, &options);
    let analyzed_at = Instant::now();

    let invocation = build_invocation();
    let sarif = build_sarif(&analysis.reports, invocation);
    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &sarif)
        .context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;

    if let Some(path) = &cli.report {
        write_report(path, &analysis)?;
    }
    if let Some(path) = &cli.graph {
        std::fs::write(path, analysis.graph.to_dot())
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    if cli.timing {
        info!(
            load_ms = (loaded_at - started_at).as_millis() as u64,
            analyze_ms = (analyzed_at - loaded_at).as_millis() as u64,
            total_ms = started_at.elapsed().as_millis() as u64,
            scripts = analysis.summary.scripts,
            failed = analysis.summary.failed,
            "timing"
        );
    }

    Ok(())
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    tool: &'static str,
    version: &'static str,
    summary: &'a BatchSummary,
    scripts: &'a [ScriptReport],
    failures: &'a [ScriptFailure],
}

fn write_report(path: &Path, analysis: &CorpusAnalysis) -> Result<()> {
    let report = JsonReport {
        tool: "bhavscope",
        version: env!("CARGO_PKG_VERSION"),
        summary: &analysis.summary,
        scripts: &analysis.reports,
        failures: &analysis.failures,
    };
    let mut writer = output_writer(Some(path))?;
    serde_json::to_writer_pretty(&mut writer, &report)
        .with_context(|| format!("failed to serialize report to {}", path.display()))?;
    writer
        .write_all(b"\n")
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn build_invocation() -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");

    Invocation::builder()
        .execution_successful(true)
        .arguments(arguments)
        .command_line(command_line)
        .build()
}

fn instruction_location(report: &ScriptReport, finding: &Finding) -> Location {
    let logical = LogicalLocation::builder()
        .name(format!(
            "{}::{:#06x}[{}]",
            report.owner, report.id, finding.index
        ))
        .kind("instruction")
        .build();
    Location::builder().logical_locations(vec![logical]).build()
}

fn build_results(reports: &[ScriptReport]) -> Vec<SarifResult> {
    reports
        .iter()
        .flat_map(|report| {
            report.findings.iter().map(move |finding| {
                let text = match &finding.suggestion {
                    Some(suggestion) => format!("{} ({suggestion})", finding.message),
                    None => finding.message.clone(),
                };
                SarifResult::builder()
                    .rule_id(finding.rule_id)
                    .message(Message::builder().text(text).build())
                    .locations(vec![instruction_location(report, finding)])
                    .build()
            })
        })
        .collect()
}

fn build_sarif(reports: &[ScriptReport], invocation: Invocation) -> Sarif {
    let driver = ToolComponent::builder()
        .name("bhavscope")
        .version(env!("CARGO_PKG_VERSION"))
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = Run::builder()
        .tool(tool)
        .invocations(vec![invocation])
        .results(build_results(reports))
        .build();

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}
