#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a run id from its canonical ULID string form.
    ///
    /// # Errors
    /// Returns an error when the input is not a valid ULID.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let ulid = Ulid::from_string(input)
            .map_err(|err| DomainError::Validation(format!("invalid run_id ULID: {err}")))?;
        Ok(Self(ulid))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One observed agent action inside a recorded trace.
///
/// `index` values are contiguous from 0 within a run; that ordering is a
/// caller contract and is not re-validated here.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TraceEvent {
    pub index: usize,
    #[serde(default)]
    pub state: String,
    pub action: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub score_delta: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentTrace {
    pub run_id: RunId,
    pub workflow: String,
    #[serde(default)]
    pub events: Vec<TraceEvent>,
}

/// One edge of a compiled workflow document.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StateTransition {
    pub state: String,
    pub action: String,
    pub selector: String,
    pub next_state: String,
}

/// Finite-state description compiled from a trace.
///
/// `states` holds every transition endpoint exactly once, in first-insertion
/// order; `transitions` preserve trace order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkflowDocument {
    pub run_id: RunId,
    pub workflow: String,
    pub version: String,
    pub states: Vec<String>,
    pub transitions: Vec<StateTransition>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScoreSnapshot {
    pub run_id: RunId,
    pub step_index: usize,
    pub score: u8,
    pub top_contributors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Review,
    Hold,
    StepUp,
}

impl PolicyAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Review => "review",
            Self::Hold => "hold",
            Self::StepUp => "step_up",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Self::Allow),
            "review" => Some(Self::Review),
            "hold" => Some(Self::Hold),
            "step_up" => Some(Self::StepUp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    pub threshold: u8,
    pub action: PolicyAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub reason: String,
}

/// One file captured during a run, referenced at bundling time.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RecordedArtifact {
    pub path: PathBuf,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// One manifest entry. `verified` is false when the artifact bytes could not
/// be read and the entry falls back to hashing the path string with size 0.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceBundleFile {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub verified: bool,
}

/// Root of an evidence bundle. `bundle_sha256` digests the concatenation of
/// every file's `sha256` in manifest order, so any content change or
/// reordering is detectable from this single value.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceBundleManifest {
    pub run_id: RunId,
    pub workflow: String,
    pub created_at: String,
    pub files: Vec<EvidenceBundleFile>,
    pub bundle_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub bundle_path: PathBuf,
    pub manifest: EvidenceBundleManifest,
}

/// Forward-only lifecycle of a run. A run that never advances is reported at
/// the last stage it reached; there is no distinct failed terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Pending,
    TraceRecorded,
    Compiled,
    Scored,
    Decided,
    Bundled,
    Exported,
}

impl RunStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::TraceRecorded => "trace_recorded",
            Self::Compiled => "compiled",
            Self::Scored => "scored",
            Self::Decided => "decided",
            Self::Bundled => "bundled",
            Self::Exported => "exported",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "trace_recorded" => Some(Self::TraceRecorded),
            "compiled" => Some(Self::Compiled),
            "scored" => Some(Self::Scored),
            "decided" => Some(Self::Decided),
            "bundled" => Some(Self::Bundled),
            "exported" => Some(Self::Exported),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunMetadata {
    pub run_id: RunId,
    pub workflow: String,
    pub created_at: String,
    pub stage: RunStage,
    pub score: Option<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ObserverEventType {
    RunStarted,
    RunFinished,
    ScoreUpdated,
}

/// One ledger entry. The ledger holds run metadata by value; it observes
/// runs, it never owns pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ObserverEvent {
    pub event_type: ObserverEventType,
    pub run: RunMetadata,
    #[serde(default)]
    pub score_snapshot: Option<ScoreSnapshot>,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Format a timestamp as RFC3339. Formatting only fails for timestamps
/// outside the representable year range, in which case the unix timestamp is
/// used so callers stay infallible.
#[must_use]
pub fn format_rfc3339(timestamp: DateTimeUtc) -> String {
    timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| timestamp.unix_timestamp().to_string())
}

#[must_use]
pub fn now_rfc3339() -> String {
    format_rfc3339(now_utc())
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Content digest of a compiled workflow document, pinning the exact
/// document a run's verdict was derived from.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn compute_document_hash(document: &WorkflowDocument) -> anyhow::Result<String> {
    hash_json(&serde_json::to_value(document)?)
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}
