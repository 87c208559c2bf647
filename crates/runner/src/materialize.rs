#![forbid(unsafe_code)]

use crate::executor::ExecutionOutput;
use serde_json::{Value, json};
use std::path::Path;
use tr_core::{
    ArtifactsManifest, ResultDocument, ToolError, parse_result_document, scan_output_dir,
};
use tr_storage::{RunCompletion, RunFailure};

/// What a finished sandbox execution amounts to, ready to be persisted.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    Succeeded {
        ui_payload: Value,
        manifest: ArtifactsManifest,
    },
    Failed(ToolError),
}

impl RunOutcome {
    pub fn error(&self) -> Option<&ToolError> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed(err) => Some(err),
        }
    }

    pub fn into_completion(self) -> RunCompletion {
        match self {
            Self::Succeeded {
                ui_payload,
                manifest,
            } => RunCompletion::Succeeded {
                ui_payload,
                manifest,
            },
            Self::Failed(err) => RunCompletion::Failed(failure_record(&err)),
        }
    }
}

/// Stored form of a failure: display-safe summary, internals only in the detail.
pub fn failure_record(err: &ToolError) -> RunFailure {
    let error_detail = match err {
        ToolError::User(_) => None,
        ToolError::Failure {
            message, detail, ..
        } => Some(json!({ "message": message, "detail": detail })),
    };
    RunFailure {
        error_code: err.code().to_string(),
        error_summary: err.display_message(),
        error_detail,
    }
}

/// Turn raw sandbox output in `run_dir` into a run outcome.
///
/// The result document must parse under the v2 contract, and every artifact it declares
/// must be present in the scanned `output/` tree.
pub fn materialize(run_dir: &Path, output: &ExecutionOutput) -> RunOutcome {
    match build_outcome(run_dir, output) {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!(
                error = %err,
                detail = %err.detail().cloned().unwrap_or(serde_json::Value::Null),
                "sandbox contract violation"
            );
            RunOutcome::Failed(err)
        }
    }
}

fn build_outcome(run_dir: &Path, output: &ExecutionOutput) -> Result<RunOutcome, ToolError> {
    let Some(bytes) = output.result.as_deref() else {
        return Err(ToolError::internal(
            "sandbox contract violation: no result document",
            Some(json!({ "reason": "missing_result", "exit_code": output.exit_code })),
        ));
    };
    let document = parse_result_document(bytes).map_err(ToolError::from)?;

    if let Some(message) = document.user_error_message() {
        return Ok(RunOutcome::Failed(ToolError::User(message)));
    }

    let manifest = scan_output_dir(run_dir)?;
    let ui_payload = ui_payload(&document, &manifest)?;
    Ok(RunOutcome::Succeeded {
        ui_payload,
        manifest,
    })
}

/// `{ui, artifacts}` where each declared artifact is joined to its manifest id.
fn ui_payload(document: &ResultDocument, manifest: &ArtifactsManifest) -> Result<Value, ToolError> {
    let mut artifacts = Vec::with_capacity(document.artifacts.len());
    for (index, declared) in document.artifacts.iter().enumerate() {
        let Some(stored) = manifest.find_by_path(&declared.path) else {
            return Err(ToolError::internal(
                format!(
                    "sandbox contract violation: declared artifact is missing (path={})",
                    declared.path
                ),
                Some(json!({
                    "reason": "declared_artifact_missing",
                    "index": index,
                    "path": declared.path,
                })),
            ));
        };
        artifacts.push(json!({
            "artifact_id": stored.artifact_id,
            "path": declared.path,
            "title": declared.title,
            "mime_type": declared.mime_type,
        }));
    }
    Ok(json!({ "ui": document.ui, "artifacts": artifacts }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tr_core::ErrorKind;

    fn temp_dir(test_name: &str) -> PathBuf {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "tr_runner_{test_name}_{}_{nonce}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn output_with(doc: Value) -> ExecutionOutput {
        ExecutionOutput {
            exit_code: Some(0),
            result: Some(serde_json::to_vec(&doc).expect("encode")),
        }
    }

    fn write_output_file(run_dir: &Path, rel: &str, body: &[u8]) {
        let path = run_dir.join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, body).expect("write");
    }

    fn internal_reason(outcome: &RunOutcome) -> Value {
        let Some(ToolError::Failure {
            kind: ErrorKind::Internal,
            detail: Some(detail),
            ..
        }) = outcome.error()
        else {
            panic!("expected internal failure, got {outcome:?}");
        };
        detail["reason"].clone()
    }

    #[test]
    fn success_joins_declared_artifacts_to_manifest_ids() {
        let run_dir = temp_dir("materialize_ok");
        write_output_file(&run_dir, "output/Report.PDF", b"%PDF");
        write_output_file(&run_dir, "output/extra/log.txt", b"hi");

        let outcome = materialize(
            &run_dir,
            &output_with(json!({
                "contract_version": 2,
                "outcome": "success",
                "ui": { "blocks": [] },
                "artifacts": [ { "path": "./output/Report.PDF", "title": "Report" } ]
            })),
        );
        let RunOutcome::Succeeded {
            ui_payload,
            manifest,
        } = &outcome
        else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.total_bytes(), 6);
        assert_eq!(ui_payload["ui"], json!({ "blocks": [] }));
        assert_eq!(ui_payload["artifacts"][0]["artifact_id"], "output_report_pdf");
        assert_eq!(ui_payload["artifacts"][0]["path"], "output/Report.PDF");
        assert_eq!(ui_payload["artifacts"][0]["title"], "Report");
    }

    #[test]
    fn user_error_is_passed_through_verbatim() {
        let run_dir = temp_dir("materialize_user_error");
        let outcome = materialize(
            &run_dir,
            &output_with(json!({
                "contract_version": 2,
                "outcome": "user_error",
                "ui": {},
                "artifacts": [],
                "user_error": { "message": "  Column 'amount' is missing " }
            })),
        );
        let failure = failure_record(outcome.error().expect("failed"));
        assert_eq!(failure.error_code, "USER_ERROR");
        assert_eq!(failure.error_summary, "Column 'amount' is missing");
        assert!(failure.error_detail.is_none());
    }

    #[test]
    fn contract_violations_surface_only_the_generic_message() {
        let run_dir = temp_dir("materialize_contract");
        let outcome = materialize(
            &run_dir,
            &output_with(json!({
                "contract_version": 1, "outcome": "success", "ui": {}, "artifacts": []
            })),
        );
        assert_eq!(internal_reason(&outcome), "unsupported_contract_version");

        let failure = failure_record(outcome.error().expect("failed"));
        assert_eq!(failure.error_code, "INTERNAL_ERROR");
        assert_eq!(failure.error_summary, ErrorKind::Internal.public_message());
        let detail = failure.error_detail.expect("detail");
        assert!(detail["message"].as_str().expect("message").contains("contract"));
    }

    #[test]
    fn declared_artifact_must_exist_on_disk() {
        let run_dir = temp_dir("materialize_missing_artifact");
        let outcome = materialize(
            &run_dir,
            &output_with(json!({
                "contract_version": 2,
                "outcome": "success",
                "ui": {},
                "artifacts": [ { "path": "output/ghost.csv" } ]
            })),
        );
        assert_eq!(internal_reason(&outcome), "declared_artifact_missing");
    }

    #[test]
    fn escaping_artifact_path_is_rejected() {
        let run_dir = temp_dir("materialize_traversal");
        let outcome = materialize(
            &run_dir,
            &output_with(json!({
                "contract_version": 2,
                "outcome": "success",
                "ui": {},
                "artifacts": [ { "path": "output/../../etc/passwd" } ]
            })),
        );
        assert_eq!(internal_reason(&outcome), "artifact_path");
    }

    #[test]
    fn missing_result_document_is_internal() {
        let run_dir = temp_dir("materialize_no_result");
        let outcome = materialize(
            &run_dir,
            &ExecutionOutput {
                exit_code: Some(0),
                result: None,
            },
        );
        assert_eq!(internal_reason(&outcome), "missing_result");
    }
}
