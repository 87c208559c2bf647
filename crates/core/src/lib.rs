#![forbid(unsafe_code)]

pub mod actor;
pub mod artifacts;
pub mod capacity;
pub mod contract;
pub mod error;
pub mod ids;
pub mod paths;

pub use actor::{Actor, Role};
pub use artifacts::{
    ArtifactScanError, ArtifactsManifest, ManifestBuilder, StoredArtifact, scan_output_dir,
};
pub use capacity::{CapacityError, CapacityLimiter, CapacityPermit};
pub use contract::{
    CONTRACT_VERSION, ContractError, DeclaredArtifact, ResultDocument, ResultOutcome,
    parse_result_document,
};
pub use error::{ErrorKind, ToolError, UserMessage};
pub use ids::{IdError, JobId, QueueName, RunId, ToolId, UserId, WorkerId, new_prefixed_id};
pub use paths::{OUTPUT_ROOT, PathError, normalize_relative_path, validate_output_path};
