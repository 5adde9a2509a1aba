use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use agent_audit_compiler::{compile_trace, compile_trace_with_version};
use agent_audit_domain::{
    ensure_non_empty, AgentTrace, RecordedArtifact, RunId, ScoreSnapshot,
};
use agent_audit_evidence::{generate_bundle, BundleConfig, CancelToken};
use agent_audit_ledger::EventLedger;
use agent_audit_pipeline::{Pipeline, RunConfig, StaticTraceSource};
use agent_audit_policy::{evaluate, load_rules_from_path};
use agent_audit_scoring::{compute_scores, ScoreConfig};
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "agent-audit")]
#[command(about = "Trace-to-verdict evaluation pipeline for automated agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compile a recorded trace into a workflow document.
    Compile(CompileArgs),
    /// Compute the per-step risk score timeline for a trace.
    Score(ScoreArgs),
    /// Score a trace and evaluate its latest snapshot against a ruleset.
    Decide(DecideArgs),
    /// Generate a content-addressed evidence bundle manifest.
    Bundle(BundleArgs),
    /// Execute the full trace-to-verdict pipeline.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct CompileArgs {
    #[arg(long)]
    trace: PathBuf,
    #[arg(long)]
    version: Option<String>,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ScoreArgs {
    #[arg(long)]
    trace: PathBuf,
    #[arg(long)]
    base_score: Option<i64>,
}

#[derive(Debug, Args)]
struct DecideArgs {
    #[arg(long)]
    trace: PathBuf,
    #[arg(long)]
    rules: PathBuf,
    #[arg(long)]
    base_score: Option<i64>,
}

#[derive(Debug, Args)]
struct BundleArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    workflow: String,
    /// Artifact spec `<path>[,<content-type>]`; repeatable, order preserved.
    #[arg(long = "artifact")]
    artifacts: Vec<String>,
    #[arg(long)]
    staging_root: Option<PathBuf>,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    trace: PathBuf,
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long = "artifact")]
    artifacts: Vec<String>,
    #[arg(long)]
    base_score: Option<i64>,
    #[arg(long)]
    staging_root: Option<PathBuf>,
    /// Write observer ledger events to this file as JSON lines.
    #[arg(long)]
    ledger_out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile(args) => compile_command(&args),
        Commands::Score(args) => score_command(&args),
        Commands::Decide(args) => decide_command(&args),
        Commands::Bundle(args) => bundle_command(&args),
        Commands::Run(args) => run_command(&args),
    }
}

fn compile_command(args: &CompileArgs) -> Result<()> {
    let trace = load_trace(&args.trace)?;
    let document = match args.version.as_deref() {
        Some(version) => compile_trace_with_version(&trace, version),
        None => compile_trace(&trace),
    };
    write_json(&document, args.out.as_deref())
}

fn score_command(args: &ScoreArgs) -> Result<()> {
    let trace = load_trace(&args.trace)?;
    let snapshots = compute_scores(trace.run_id, &trace.events, &score_config(args.base_score));
    for snapshot in &snapshots {
        println!("{}", serde_json::to_string(snapshot)?);
    }
    Ok(())
}

fn decide_command(args: &DecideArgs) -> Result<()> {
    let trace = load_trace(&args.trace)?;
    let rules = load_rules_from_path(&args.rules)?;
    let snapshots = compute_scores(trace.run_id, &trace.events, &score_config(args.base_score));
    let latest = snapshots.last().cloned().unwrap_or_else(|| ScoreSnapshot {
        run_id: trace.run_id,
        step_index: 0,
        score: 0,
        top_contributors: Vec::new(),
    });
    let decision = evaluate(&latest, &rules);
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn bundle_command(args: &BundleArgs) -> Result<()> {
    let run_id = RunId::parse(&args.run_id)?;
    ensure_non_empty("workflow", &args.workflow)?;
    let artifacts = parse_artifact_specs(&args.artifacts);

    let mut config = BundleConfig::default();
    if let Some(staging_root) = args.staging_root.clone() {
        config.staging_root = staging_root;
    }
    let job = generate_bundle(
        run_id,
        &args.workflow,
        &artifacts,
        &config,
        &CancelToken::new(),
    );

    write_json(&job.manifest, args.out.as_deref())?;
    println!("bundle_path={}", job.bundle_path.display());
    Ok(())
}

fn run_command(args: &RunArgs) -> Result<()> {
    let trace = load_trace(&args.trace)?;
    let workflow = trace.workflow.clone();
    let rules = match args.rules.as_deref() {
        Some(path) => load_rules_from_path(path)?,
        None => Vec::new(),
    };

    let config = RunConfig {
        run_id: Some(trace.run_id),
        base_score: args.base_score,
        rules,
        artifacts: parse_artifact_specs(&args.artifacts),
        staging_root: args.staging_root.clone(),
        read_timeout: None,
        cancel: CancelToken::new(),
    };

    let source = StaticTraceSource::new(trace);
    let ledger = EventLedger::new();
    let summary = Pipeline::new(&source, &ledger).execute(&workflow, config)?;

    let action = summary
        .decision
        .as_ref()
        .map_or("none", |decision| decision.action.as_str());
    println!(
        "run_id={} workflow={} stage={} score={} action={}",
        summary.run.run_id,
        summary.run.workflow,
        summary.run.stage.as_str(),
        summary
            .run
            .score
            .map_or_else(|| "none".to_string(), |score| score.to_string()),
        action
    );
    if let Some(document_hash) = &summary.document_hash {
        println!("document_sha256={document_hash}");
    }
    if let Some(export) = &summary.export {
        println!(
            "bundle_path={} bundle_sha256={} files={}",
            export.bundle_path.display(),
            export.manifest.bundle_sha256,
            export.manifest.files.len()
        );
    }

    if let Some(ledger_out) = &args.ledger_out {
        let output = File::create(ledger_out)?;
        let mut writer = BufWriter::new(output);
        for event in ledger.recorded_events() {
            writeln!(writer, "{}", serde_json::to_string(&event)?)?;
        }
        writer.flush()?;
    }

    Ok(())
}

fn score_config(base_score: Option<i64>) -> ScoreConfig {
    base_score.map_or_else(ScoreConfig::default, |base_score| ScoreConfig { base_score })
}

fn load_trace(path: &Path) -> Result<AgentTrace> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|err| anyhow!("invalid trace JSON structure: {err}"))
}

fn parse_artifact_specs(specs: &[String]) -> Vec<RecordedArtifact> {
    specs
        .iter()
        .map(|spec| match spec.split_once(',') {
            Some((path, content_type)) => RecordedArtifact {
                path: PathBuf::from(path),
                content_type: Some(content_type.to_string()),
            },
            None => RecordedArtifact {
                path: PathBuf::from(spec),
                content_type: None,
            },
        })
        .collect()
}

fn write_json<T: Serialize>(value: &T, out: Option<&Path>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => {
            let output = File::create(path)?;
            let mut writer = BufWriter::new(output);
            writeln!(writer, "{rendered}")?;
            writer.flush()?;
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
