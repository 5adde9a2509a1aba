#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use agent_audit_domain::{
    hash_bytes, now_rfc3339, EvidenceBundleFile, EvidenceBundleManifest, ExportJob,
    RecordedArtifact, RunId,
};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub const BUNDLE_FILE_NAME: &str = "evidence_bundle.zip";

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub staging_root: PathBuf,
    pub read_timeout: Duration,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("tmp"),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Cooperative cancellation flag shared between a bundle caller and the
/// generator. Cancellation is observed between artifacts, so hashing work
/// already done is kept and surfaces as a partial manifest.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Canonical staging location for a run's bundle:
/// `<staging_root>/<run_id>/evidence_bundle.zip`.
#[must_use]
pub fn bundle_path_for(staging_root: &Path, run_id: RunId) -> PathBuf {
    staging_root.join(run_id.to_string()).join(BUNDLE_FILE_NAME)
}

/// Read the full byte content of one artifact on a helper thread, bounded by
/// the configured timeout so one slow or wedged read cannot stall the whole
/// bundle. A read that outlives the timeout finishes on its detached thread
/// and is discarded. `None` means unreadable or timed out.
fn read_artifact_bytes(path: &Path, timeout: Duration) -> Option<Vec<u8>> {
    let (sender, receiver) = mpsc::channel();
    let path = path.to_path_buf();
    let spawned = thread::Builder::new()
        .name("artifact-read".to_string())
        .spawn(move || {
            let _ = sender.send(fs::read(&path));
        });
    if spawned.is_err() {
        return None;
    }

    match receiver.recv_timeout(timeout) {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(_)) | Err(_) => None,
    }
}

fn manifest_entry(artifact: &RecordedArtifact, timeout: Duration) -> EvidenceBundleFile {
    let path = artifact.path.to_string_lossy().to_string();
    let content_type = artifact
        .content_type
        .clone()
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    match read_artifact_bytes(&artifact.path, timeout) {
        Some(bytes) => EvidenceBundleFile {
            sha256: hash_bytes(&bytes),
            size_bytes: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            path,
            content_type,
            verified: true,
        },
        // Unreadable artifacts degrade to hashing the path string itself so
        // every artifact still yields a deterministic manifest row.
        None => EvidenceBundleFile {
            sha256: hash_bytes(path.as_bytes()),
            size_bytes: 0,
            path,
            content_type,
            verified: false,
        },
    }
}

fn aggregate_digest(files: &[EvidenceBundleFile]) -> String {
    let concatenated: String = files.iter().map(|file| file.sha256.as_str()).collect();
    hash_bytes(concatenated.as_bytes())
}

/// Produce a content-addressed manifest plus the canonical bundle path for a
/// run's recorded artifacts.
///
/// Manifest rows mirror the input artifact order. Each readable artifact is
/// digested over its actual bytes; unreadable or timed-out artifacts fall
/// back to a path-string digest with `size_bytes == 0` and
/// `verified == false` instead of aborting the bundle. `bundle_sha256`
/// digests the concatenation of every row's `sha256` in manifest order.
/// Generation performs no writes; packaging and delivery belong to the
/// export handoff.
#[must_use]
pub fn generate_bundle(
    run_id: RunId,
    workflow: &str,
    artifacts: &[RecordedArtifact],
    config: &BundleConfig,
    cancel: &CancelToken,
) -> ExportJob {
    let mut files = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        if cancel.is_cancelled() {
            break;
        }
        files.push(manifest_entry(artifact, config.read_timeout));
    }

    let manifest = EvidenceBundleManifest {
        run_id,
        workflow: workflow.to_string(),
        created_at: now_rfc3339(),
        bundle_sha256: aggregate_digest(&files),
        files,
    };

    ExportJob {
        bundle_path: bundle_path_for(&config.staging_root, run_id),
        manifest,
    }
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub run_id: RunId,
    pub workflow: String,
    pub bundle_path: PathBuf,
    pub manifest: Option<EvidenceBundleManifest>,
}

/// Confirm a finished bundle is ready for delivery. The caller-supplied
/// manifest is returned verbatim; when none is supplied an empty manifest is
/// synthesized for the run. Delivery itself is an external concern.
#[must_use]
pub fn export(request: ExportRequest) -> ExportJob {
    let manifest = request.manifest.unwrap_or_else(|| EvidenceBundleManifest {
        run_id: request.run_id,
        workflow: request.workflow.clone(),
        created_at: now_rfc3339(),
        files: Vec::new(),
        bundle_sha256: String::new(),
    });

    ExportJob {
        bundle_path: request.bundle_path,
        manifest,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;

    use agent_audit_domain::{hash_bytes, RecordedArtifact, RunId};
    use ulid::Ulid;

    use super::{
        bundle_path_for, export, generate_bundle, BundleConfig, CancelToken, ExportRequest,
        DEFAULT_CONTENT_TYPE,
    };

    fn temp_artifact(name: &str, content: &[u8]) -> RecordedArtifact {
        let path = std::env::temp_dir().join(format!("agent-audit-{}-{}", name, Ulid::new()));
        fs::write(&path, content).unwrap_or_else(|err| panic!("failed to write fixture: {err}"));
        RecordedArtifact {
            path,
            content_type: Some("text/plain".to_string()),
        }
    }

    fn missing_artifact(name: &str) -> RecordedArtifact {
        RecordedArtifact {
            path: PathBuf::from(name),
            content_type: None,
        }
    }

    #[test]
    fn readable_artifacts_are_digested_over_content() {
        let artifact = temp_artifact("readable", b"screenshot-bytes");
        let job = generate_bundle(
            RunId::new(),
            "checkout",
            std::slice::from_ref(&artifact),
            &BundleConfig::default(),
            &CancelToken::new(),
        );

        assert_eq!(job.manifest.files.len(), 1);
        let entry = &job.manifest.files[0];
        assert_eq!(entry.sha256, hash_bytes(b"screenshot-bytes"));
        assert_eq!(entry.size_bytes, 16);
        assert_eq!(entry.content_type, "text/plain");
        assert!(entry.verified);

        let _ = fs::remove_file(&artifact.path);
    }

    #[test]
    fn unreadable_artifact_falls_back_to_path_hash() {
        let job = generate_bundle(
            RunId::new(),
            "checkout",
            &[missing_artifact("missing.png")],
            &BundleConfig::default(),
            &CancelToken::new(),
        );

        let entry = &job.manifest.files[0];
        assert_eq!(entry.sha256, hash_bytes(b"missing.png"));
        assert_eq!(entry.size_bytes, 0);
        assert_eq!(entry.content_type, DEFAULT_CONTENT_TYPE);
        assert!(!entry.verified);
    }

    #[test]
    fn manifest_preserves_artifact_order_and_binds_digests() {
        let first = temp_artifact("order-a", b"alpha");
        let second = temp_artifact("order-b", b"beta");
        let run_id = RunId::new();
        let config = BundleConfig::default();

        let forward = generate_bundle(
            run_id,
            "checkout",
            &[first.clone(), second.clone()],
            &config,
            &CancelToken::new(),
        );
        let repeat = generate_bundle(
            run_id,
            "checkout",
            &[first.clone(), second.clone()],
            &config,
            &CancelToken::new(),
        );
        let reversed = generate_bundle(
            run_id,
            "checkout",
            &[second.clone(), first.clone()],
            &config,
            &CancelToken::new(),
        );

        assert_eq!(forward.manifest.files[0].path, first.path.to_string_lossy());
        assert_eq!(forward.manifest.files[1].path, second.path.to_string_lossy());
        assert_eq!(forward.manifest.bundle_sha256, repeat.manifest.bundle_sha256);
        assert_ne!(forward.manifest.bundle_sha256, reversed.manifest.bundle_sha256);

        let _ = fs::remove_file(&first.path);
        let _ = fs::remove_file(&second.path);
    }

    #[test]
    fn cancellation_before_first_artifact_yields_empty_manifest() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let job = generate_bundle(
            RunId::new(),
            "checkout",
            &[missing_artifact("a"), missing_artifact("b")],
            &BundleConfig::default(),
            &cancel,
        );

        assert!(job.manifest.files.is_empty());
        assert_eq!(job.manifest.bundle_sha256, hash_bytes(b""));
    }

    #[test]
    fn cancellation_mid_run_keeps_already_processed_rows() {
        let readable = temp_artifact("cancel-keep", b"kept");
        // A FIFO with no writer blocks the artifact read until the timeout,
        // leaving a window to cancel while the bundle is in flight.
        let fifo_path = std::env::temp_dir().join(format!("agent-audit-fifo-{}", Ulid::new()));
        let mkfifo = std::process::Command::new("mkfifo").arg(&fifo_path).status();
        assert!(mkfifo.is_ok_and(|status| status.success()));
        let blocking = RecordedArtifact {
            path: fifo_path.clone(),
            content_type: None,
        };

        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };

        let config = BundleConfig {
            read_timeout: Duration::from_millis(400),
            ..BundleConfig::default()
        };
        let job = generate_bundle(
            RunId::new(),
            "checkout",
            &[
                readable.clone(),
                blocking,
                missing_artifact("never-reached.png"),
            ],
            &config,
            &cancel,
        );
        assert!(canceller.join().is_ok());

        // Both rows processed before the cancel was observed are kept; the
        // third artifact was never started.
        assert_eq!(job.manifest.files.len(), 2);
        assert!(job.manifest.files[0].verified);
        assert_eq!(job.manifest.files[0].sha256, hash_bytes(b"kept"));
        assert!(!job.manifest.files[1].verified);
        assert_eq!(
            job.manifest.files[1].sha256,
            hash_bytes(fifo_path.to_string_lossy().as_bytes())
        );

        let _ = fs::remove_file(&readable.path);
        let _ = fs::remove_file(&fifo_path);
    }

    #[test]
    fn bundle_path_is_deterministic_per_run() {
        let run_id = RunId::new();
        let path = bundle_path_for(&PathBuf::from("staging"), run_id);
        assert_eq!(
            path,
            PathBuf::from("staging")
                .join(run_id.to_string())
                .join("evidence_bundle.zip")
        );
    }

    #[test]
    fn export_returns_supplied_manifest_verbatim_or_an_empty_one() {
        let run_id = RunId::new();
        let generated = generate_bundle(
            run_id,
            "checkout",
            &[missing_artifact("trace.json")],
            &BundleConfig::default(),
            &CancelToken::new(),
        );

        let with_manifest = export(ExportRequest {
            run_id,
            workflow: "checkout".to_string(),
            bundle_path: generated.bundle_path.clone(),
            manifest: Some(generated.manifest.clone()),
        });
        assert_eq!(with_manifest.manifest, generated.manifest);
        assert_eq!(with_manifest.bundle_path, generated.bundle_path);

        let without_manifest = export(ExportRequest {
            run_id,
            workflow: "checkout".to_string(),
            bundle_path: generated.bundle_path.clone(),
            manifest: None,
        });
        assert!(without_manifest.manifest.files.is_empty());
        assert!(without_manifest.manifest.bundle_sha256.is_empty());
        assert_eq!(without_manifest.manifest.run_id, run_id);
    }

    #[test]
    fn directory_artifact_degrades_like_an_unreadable_file() {
        let artifact = RecordedArtifact {
            path: std::env::temp_dir(),
            content_type: Some("text/plain".to_string()),
        };
        let config = BundleConfig {
            read_timeout: Duration::from_secs(1),
            ..BundleConfig::default()
        };

        let job = generate_bundle(
            RunId::new(),
            "checkout",
            std::slice::from_ref(&artifact),
            &config,
            &CancelToken::new(),
        );

        let entry = &job.manifest.files[0];
        assert_eq!(entry.size_bytes, 0);
        assert!(!entry.verified);
        assert_eq!(
            entry.sha256,
            hash_bytes(artifact.path.to_string_lossy().as_bytes())
        );
    }
}
