#![forbid(unsafe_code)]

use crate::error::{ToolError, UserMessage};
use crate::paths::{PathError, validate_output_path};
use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value, json};
use std::sync::OnceLock;

/// The only result document version this runner accepts.
pub const CONTRACT_VERSION: i64 = 2;

const MAX_SCHEMA_ERRORS: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Success,
    UserError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclaredArtifact {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserErrorPayload {
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultDocument {
    pub contract_version: i64,
    pub outcome: ResultOutcome,
    pub ui: JsonMap<String, Value>,
    pub artifacts: Vec<DeclaredArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_error: Option<UserErrorPayload>,
}

impl ResultDocument {
    /// The sanitized user-facing error, when the script reported one.
    pub fn user_error_message(&self) -> Option<UserMessage> {
        match self.outcome {
            ResultOutcome::Success => None,
            ResultOutcome::UserError => Some(
                self.user_error
                    .as_ref()
                    .map(|e| UserMessage::new(&e.message))
                    .unwrap_or_else(UserMessage::fallback),
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ContractError {
    #[error("result document is not valid JSON: {0}")]
    Json(String),
    #[error("result document must be a JSON object")]
    NotAnObject,
    #[error("result document is missing contract_version")]
    MissingVersion,
    #[error("unsupported contract_version (found={found}, supported={CONTRACT_VERSION})")]
    UnsupportedVersion { found: Value },
    #[error("result document failed schema validation ({} errors)", .errors.len())]
    Schema { errors: Vec<String> },
    #[error("artifacts[{index}] has an invalid path: {source}")]
    ArtifactPath { index: usize, source: PathError },
    #[error("result schema is unavailable: {0}")]
    SchemaUnavailable(String),
}

impl ContractError {
    pub fn detail(&self) -> Value {
        match self {
            Self::Json(message) => json!({ "reason": "invalid_json", "message": message }),
            Self::NotAnObject => json!({ "reason": "not_an_object" }),
            Self::MissingVersion => json!({ "reason": "missing_contract_version" }),
            Self::UnsupportedVersion { found } => json!({
                "reason": "unsupported_contract_version",
                "found": found,
                "supported": CONTRACT_VERSION,
            }),
            Self::Schema { errors } => json!({ "reason": "schema", "errors": errors }),
            Self::ArtifactPath { index, source } => json!({
                "reason": "artifact_path",
                "index": index,
                "path_error": source.reason(),
                "path": source.path(),
            }),
            Self::SchemaUnavailable(message) => {
                json!({ "reason": "schema_unavailable", "message": message })
            }
        }
    }
}

impl From<ContractError> for ToolError {
    fn from(err: ContractError) -> Self {
        let detail = err.detail();
        ToolError::internal(format!("sandbox contract violation: {err}"), Some(detail))
    }
}

/// JSON schema (draft 7) of the v2 result document.
pub fn result_schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "contract_version": { "const": CONTRACT_VERSION },
                "outcome": { "type": "string", "enum": ["success", "user_error"] },
                "ui": { "type": "object" },
                "artifacts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "path": { "type": "string", "minLength": 1 },
                            "title": { "type": "string" },
                            "mime_type": { "type": "string" }
                        },
                        "required": ["path"]
                    }
                },
                "user_error": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "message": { "type": "string" }
                    },
                    "required": ["message"]
                }
            },
            "required": ["contract_version", "outcome", "ui", "artifacts"],
            "if": {
                "properties": { "outcome": { "const": "user_error" } },
                "required": ["outcome"]
            },
            "then": { "required": ["user_error"] }
        })
    })
}

fn compiled_schema() -> Result<&'static JSONSchema, ContractError> {
    static COMPILED: OnceLock<Result<JSONSchema, String>> = OnceLock::new();
    COMPILED
        .get_or_init(|| {
            JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(result_schema())
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| ContractError::SchemaUnavailable(e.clone()))
}

/// Decode and validate a sandbox result document.
///
/// Version is checked before the schema so a v1 document reports the version, not a
/// list of schema mismatches. Declared artifact paths are re-validated after decoding.
pub fn parse_result_document(bytes: &[u8]) -> Result<ResultDocument, ContractError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ContractError::Json(e.to_string()))?;
    let Some(obj) = value.as_object() else {
        return Err(ContractError::NotAnObject);
    };
    let Some(version) = obj.get("contract_version") else {
        return Err(ContractError::MissingVersion);
    };
    if version.as_i64() != Some(CONTRACT_VERSION) {
        return Err(ContractError::UnsupportedVersion {
            found: version.clone(),
        });
    }

    let schema = compiled_schema()?;
    if let Err(errors) = schema.validate(&value) {
        let errors = errors
            .take(MAX_SCHEMA_ERRORS)
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect::<Vec<_>>();
        return Err(ContractError::Schema { errors });
    }

    let mut document: ResultDocument =
        serde_json::from_value(value).map_err(|e| ContractError::Schema {
            errors: vec![e.to_string()],
        })?;

    for (index, artifact) in document.artifacts.iter_mut().enumerate() {
        let normalized = validate_output_path(&artifact.path)
            .map_err(|source| ContractError::ArtifactPath { index, source })?;
        artifact.path = normalized;
    }

    Ok(document)
}
