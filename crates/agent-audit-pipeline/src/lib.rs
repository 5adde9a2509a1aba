#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use agent_audit_compiler::compile_trace;
use agent_audit_domain::{
    compute_document_hash, ensure_non_empty, now_rfc3339, AgentTrace, ExportJob, ObserverEvent,
    ObserverEventType, PolicyDecision, PolicyRule, RecordedArtifact, RunId, RunMetadata, RunStage,
    ScoreSnapshot, WorkflowDocument,
};
use agent_audit_evidence::{export, generate_bundle, BundleConfig, CancelToken, ExportRequest};
use agent_audit_ledger::EventLedger;
use agent_audit_policy::evaluate;
use agent_audit_scoring::{compute_scores, ScoreConfig};
use anyhow::Result;

/// Boundary to the external discovery agent that produces raw traces.
pub trait TraceSource {
    /// Record one interaction trace for the named workflow.
    ///
    /// # Errors
    /// Returns an error when no trace can be recorded; the pipeline reports
    /// such a run as incomplete rather than failing.
    fn record_trace(&self, workflow: &str) -> Result<AgentTrace>;
}

/// Trace source backed by a pre-recorded trace, used by the CLI for traces
/// loaded from disk and by tests.
#[derive(Debug, Clone)]
pub struct StaticTraceSource {
    trace: AgentTrace,
}

impl StaticTraceSource {
    #[must_use]
    pub fn new(trace: AgentTrace) -> Self {
        Self { trace }
    }
}

impl TraceSource for StaticTraceSource {
    fn record_trace(&self, _workflow: &str) -> Result<AgentTrace> {
        Ok(self.trace.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub run_id: Option<RunId>,
    pub base_score: Option<i64>,
    pub rules: Vec<PolicyRule>,
    pub artifacts: Vec<RecordedArtifact>,
    pub staging_root: Option<PathBuf>,
    pub read_timeout: Option<Duration>,
    pub cancel: CancelToken,
}

/// Everything one evaluation run produced. Optional fields are `None` for
/// stages the run never reached.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: RunMetadata,
    pub trace: Option<AgentTrace>,
    pub document: Option<WorkflowDocument>,
    pub document_hash: Option<String>,
    pub score_timeline: Vec<ScoreSnapshot>,
    pub decision: Option<PolicyDecision>,
    pub export: Option<ExportJob>,
}

/// Orchestrates one run through the trace-to-verdict stages:
/// `pending -> trace_recorded -> compiled -> scored -> decided -> bundled ->
/// exported`. There are no backward transitions; a run whose trace source
/// fails is reported at `pending` and never advances.
pub struct Pipeline<'a> {
    trace_source: &'a dyn TraceSource,
    ledger: &'a EventLedger,
}

impl<'a> Pipeline<'a> {
    #[must_use]
    pub fn new(trace_source: &'a dyn TraceSource, ledger: &'a EventLedger) -> Self {
        Self {
            trace_source,
            ledger,
        }
    }

    /// Execute one evaluation run for the named workflow.
    ///
    /// Every stage's output is a pure function of its predecessor's output;
    /// the ledger receives `run_started`, a `score_updated` for the latest
    /// snapshot when one exists, and `run_finished` carrying the final
    /// stage.
    ///
    /// # Errors
    /// Returns an error for an empty workflow name or when the compiled
    /// document cannot be serialized for hashing; stage-level faults degrade
    /// into an incomplete summary instead.
    pub fn execute(&self, workflow: &str, config: RunConfig) -> Result<RunSummary> {
        ensure_non_empty("workflow", workflow)?;

        let run_id = config.run_id.unwrap_or_default();
        let created_at = now_rfc3339();
        let metadata = |stage: RunStage, score: Option<u8>| RunMetadata {
            run_id,
            workflow: workflow.to_string(),
            created_at: created_at.clone(),
            stage,
            score,
        };

        self.ledger.record(ObserverEvent {
            event_type: ObserverEventType::RunStarted,
            run: metadata(RunStage::Pending, None),
            score_snapshot: None,
        });

        let trace = match self.trace_source.record_trace(workflow) {
            Ok(mut trace) => {
                // The pipeline's run id is authoritative; the recorded trace
                // is folded into this run so the document, score history and
                // manifest all share one id.
                trace.run_id = run_id;
                trace
            }
            Err(_) => {
                // No trace ever recorded: the run stays pending and is
                // reported incomplete.
                let run = metadata(RunStage::Pending, None);
                self.ledger.record(ObserverEvent {
                    event_type: ObserverEventType::RunFinished,
                    run: run.clone(),
                    score_snapshot: None,
                });
                return Ok(RunSummary {
                    run,
                    trace: None,
                    document: None,
                    document_hash: None,
                    score_timeline: Vec::new(),
                    decision: None,
                    export: None,
                });
            }
        };

        let document = compile_trace(&trace);
        let document_hash = compute_document_hash(&document)?;

        let score_config = config
            .base_score
            .map_or_else(ScoreConfig::default, |base_score| ScoreConfig { base_score });
        let score_timeline = compute_scores(run_id, &trace.events, &score_config);
        let latest_snapshot = score_timeline.last().cloned();

        if let Some(snapshot) = &latest_snapshot {
            self.ledger.record(ObserverEvent {
                event_type: ObserverEventType::ScoreUpdated,
                run: metadata(RunStage::Scored, Some(snapshot.score)),
                score_snapshot: Some(snapshot.clone()),
            });
        }

        let decision_snapshot = latest_snapshot.clone().unwrap_or_else(|| ScoreSnapshot {
            run_id,
            step_index: 0,
            score: 0,
            top_contributors: Vec::new(),
        });
        let decision = evaluate(&decision_snapshot, &config.rules);

        let mut bundle_config = BundleConfig::default();
        if let Some(staging_root) = config.staging_root {
            bundle_config.staging_root = staging_root;
        }
        if let Some(read_timeout) = config.read_timeout {
            bundle_config.read_timeout = read_timeout;
        }
        let bundle = generate_bundle(
            run_id,
            workflow,
            &config.artifacts,
            &bundle_config,
            &config.cancel,
        );

        let exported = export(ExportRequest {
            run_id,
            workflow: workflow.to_string(),
            bundle_path: bundle.bundle_path.clone(),
            manifest: Some(bundle.manifest),
        });

        // A run that never produced a snapshot finishes with no score; the
        // synthetic snapshot exists only to feed the policy engine.
        let final_score = latest_snapshot.as_ref().map(|snapshot| snapshot.score);
        let run = metadata(RunStage::Exported, final_score);
        self.ledger.record(ObserverEvent {
            event_type: ObserverEventType::RunFinished,
            run: run.clone(),
            score_snapshot: latest_snapshot,
        });

        Ok(RunSummary {
            run,
            trace: Some(trace),
            document: Some(document),
            document_hash: Some(document_hash),
            score_timeline,
            decision: Some(decision),
            export: Some(exported),
        })
    }
}
