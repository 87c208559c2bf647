#![forbid(unsafe_code)]

use crate::error::ToolError;
use crate::paths::{OUTPUT_ROOT, PathError, validate_output_path};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Component, Path};

const FALLBACK_ARTIFACT_ID: &str = "artifact";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub artifact_id: String,
    pub path: String,
    pub bytes: u64,
}

/// Ordered, id-unique list of artifacts; immutable once persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactsManifest(Vec<StoredArtifact>);

impl ArtifactsManifest {
    pub fn entries(&self) -> &[StoredArtifact] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn find_by_path(&self, path: &str) -> Option<&StoredArtifact> {
        self.0.iter().find(|a| a.path == path)
    }

    pub fn total_bytes(&self) -> u64 {
        self.0.iter().map(|a| a.bytes).sum()
    }
}

/// Builds a manifest, assigning each path a unique slug id in insertion order.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    used_ids: HashSet<String>,
    entries: Vec<StoredArtifact>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, raw_path: &str, bytes: u64) -> Result<&StoredArtifact, PathError> {
        let path = validate_output_path(raw_path)?;
        let base = artifact_slug(&path);
        let mut artifact_id = base.clone();
        let mut suffix = 2u32;
        while self.used_ids.contains(&artifact_id) {
            artifact_id = format!("{base}_{suffix}");
            suffix += 1;
        }
        self.used_ids.insert(artifact_id.clone());
        self.entries.push(StoredArtifact {
            artifact_id,
            path,
            bytes,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn build(self) -> ArtifactsManifest {
        ArtifactsManifest(self.entries)
    }
}

/// Lower-case `path`, squash every run of non-alphanumerics into one `_`, trim `_`.
pub fn artifact_slug(path: &str) -> String {
    let mut slug = String::with_capacity(path.len());
    let mut pending_sep = false;
    for ch in path.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(ch);
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() {
        return FALLBACK_ARTIFACT_ID.to_string();
    }
    slug
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactScanError {
    #[error("scan output dir: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("output file path is not valid UTF-8 (path={0})")]
    NonUtf8(String),
    #[error(transparent)]
    Path(#[from] PathError),
}

impl From<ArtifactScanError> for ToolError {
    fn from(err: ArtifactScanError) -> Self {
        match err {
            ArtifactScanError::Path(path_err) => path_err.into(),
            other => ToolError::internal(
                "failed to scan sandbox output",
                Some(json!({ "error": other.to_string() })),
            ),
        }
    }
}

/// Scan `<run_dir>/output` recursively into a manifest of regular files.
///
/// Paths are recorded relative to `run_dir` (so they start with `output/`) and sorted
/// lexicographically before ids are assigned; identical trees give identical manifests.
/// Symlinks are not followed and not recorded. A missing output dir yields an empty manifest.
pub fn scan_output_dir(run_dir: &Path) -> Result<ArtifactsManifest, ArtifactScanError> {
    let output_dir = run_dir.join(OUTPUT_ROOT);
    if !output_dir.is_dir() {
        return Ok(ArtifactsManifest::default());
    }

    let mut files = Vec::<(String, u64)>::new();
    for entry in walkdir::WalkDir::new(&output_dir).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(run_dir)
            .map_err(|_| ArtifactScanError::NonUtf8(entry.path().display().to_string()))?;
        let rel = relative_posix_string(rel)
            .ok_or_else(|| ArtifactScanError::NonUtf8(entry.path().display().to_string()))?;
        let bytes = entry.metadata()?.len();
        files.push((rel, bytes));
    }
    files.sort();

    let mut builder = ManifestBuilder::new();
    for (path, bytes) in files {
        builder.push(&path, bytes)?;
    }
    Ok(builder.build())
}

fn relative_posix_string(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => continue,
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
