//! Proposed fixes produced by diagnosis.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The change body of a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "body", rename_all = "snake_case")]
pub enum PatchBody {
    /// Complete new contents of the target file.
    Replacement(String),
    /// Unified diff of the target region.
    UnifiedDiff(String),
}

impl PatchBody {
    pub fn label(&self) -> &'static str {
        match self {
            PatchBody::Replacement(_) => "replace",
            PatchBody::UnifiedDiff(_) => "diff",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            PatchBody::Replacement(text) | PatchBody::UnifiedDiff(text) => text,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text().trim().is_empty()
    }
}

/// A suggested source change for one failure record.
///
/// Handed to the repository mutator at most once; discarded if it fails to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixProposal {
    pub target_file: PathBuf,
    pub patch: PatchBody,
    pub rationale: String,
    /// Digest of the target file content the proposal was generated against.
    /// `None` when the file did not exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_digest: Option<String>,
}

impl FixProposal {
    /// One-line summary suitable for a commit subject.
    pub fn summary(&self) -> String {
        let first = self
            .rationale
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("apply automated fix");
        crate::util::truncate(first, 72)
    }
}
