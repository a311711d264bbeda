//! The per-invocation unit of work and its forward-only status.

use crate::failure::FailureRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptStatus {
    Pending,
    Diagnosing,
    Applying,
    Published,
    FailedParse,
    FailedDiagnosis,
    FailedPublish,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            AttemptStatus::Pending | AttemptStatus::Diagnosing | AttemptStatus::Applying
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AttemptStatus::FailedParse
                | AttemptStatus::FailedDiagnosis
                | AttemptStatus::FailedPublish
        )
    }

    fn rank(&self) -> u8 {
        match self {
            AttemptStatus::Pending => 0,
            AttemptStatus::Diagnosing => 1,
            AttemptStatus::Applying => 2,
            AttemptStatus::Published => 3,
            AttemptStatus::FailedParse
            | AttemptStatus::FailedDiagnosis
            | AttemptStatus::FailedPublish => 4,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AttemptStatus::Pending => "Pending",
            AttemptStatus::Diagnosing => "Diagnosing",
            AttemptStatus::Applying => "Applying",
            AttemptStatus::Published => "Published",
            AttemptStatus::FailedParse => "FailedParse",
            AttemptStatus::FailedDiagnosis => "FailedDiagnosis",
            AttemptStatus::FailedPublish => "FailedPublish",
        };
        f.write_str(label)
    }
}

/// Why diagnosis gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosisReason {
    Transient,
    Malformed,
    Authentication,
    QuotaExceeded,
}

impl fmt::Display for DiagnosisReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiagnosisReason::Transient => "Transient",
            DiagnosisReason::Malformed => "Malformed",
            DiagnosisReason::Authentication => "Authentication",
            DiagnosisReason::QuotaExceeded => "QuotaExceeded",
        };
        f.write_str(label)
    }
}

/// The originating cause attached to a `Failed*` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalReason {
    Extraction { detail: String },
    Diagnosis { reason: DiagnosisReason, detail: String },
    PatchApply { detail: String },
    BranchExists { branch: String },
    RemoteUnavailable { detail: String },
    /// Local repository failure (git2, filesystem).
    Repository { detail: String },
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::Extraction { detail } => {
                write!(f, "log could not be parsed: {}", detail)
            }
            TerminalReason::Diagnosis { reason, detail } => {
                write!(f, "diagnosis failed ({}): {}", reason, detail)
            }
            TerminalReason::PatchApply { detail } => write!(f, "patch did not apply: {}", detail),
            TerminalReason::BranchExists { branch } => {
                write!(f, "branch {} exists and was not created by this pipeline", branch)
            }
            TerminalReason::RemoteUnavailable { detail } => {
                write!(f, "hosting service unavailable: {}", detail)
            }
            TerminalReason::Repository { detail } => write!(f, "repository error: {}", detail),
        }
    }
}

/// Calls made against one remote collaborator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounter {
    pub calls: u32,
    pub retries: u32,
}

impl StageCounter {
    pub fn absorb(&mut self, other: StageCounter) {
        self.calls += other.calls;
        self.retries += other.retries;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounters {
    pub diagnosis: StageCounter,
    pub publish: StageCounter,
}

/// Which remediation path the orchestrator took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationPath {
    Full,
    Lightweight,
}

/// One pipeline run. Owned and mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAttempt {
    pub run_id: String,
    pub status: AttemptStatus,
    pub branch_name: Option<String>,
    pub review_request: Option<String>,
    pub counters: AttemptCounters,
    /// The record selected for remediation.
    pub failure: Option<FailureRecord>,
    /// How many records extraction produced.
    pub records_found: usize,
    pub path: Option<RemediationPath>,
    pub target_file: Option<PathBuf>,
    pub commit: Option<String>,
    /// Set when a stale patch triggered the single re-diagnosis.
    pub rediagnosed: bool,
    /// A commit exists locally but was never published.
    pub unpublished_commit: bool,
    pub reason: Option<TerminalReason>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RemediationAttempt {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: AttemptStatus::Pending,
            branch_name: None,
            review_request: None,
            counters: AttemptCounters::default(),
            failure: None,
            records_found: 0,
            path: None,
            target_file: None,
            commit: None,
            rediagnosed: false,
            unpublished_commit: false,
            reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move forward along `Pending -> Diagnosing -> Applying`.
    ///
    /// Returns `false` (and leaves the status unchanged) for any move that is
    /// not strictly forward or that would leave a terminal state.
    pub fn advance(&mut self, next: AttemptStatus) -> bool {
        if self.status.is_terminal() || next.is_terminal() || next.rank() <= self.status.rank() {
            tracing::warn!(from = %self.status, to = %next, "refusing status transition");
            return false;
        }
        tracing::info!(run_id = %self.run_id, from = %self.status, to = %next, "stage transition");
        self.status = next;
        true
    }

    pub fn publish(&mut self, review_request: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = AttemptStatus::Published;
        self.review_request = Some(review_request.into());
        self.unpublished_commit = false;
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn fail(&mut self, status: AttemptStatus, reason: TerminalReason) -> bool {
        if self.status.is_terminal() || !status.is_failure() {
            return false;
        }
        tracing::error!(
            run_id = %self.run_id,
            from = %self.status,
            to = %status,
            reason = %reason,
            "remediation failed"
        );
        self.status = status;
        self.reason = Some(reason);
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn total_calls(&self) -> u32 {
        self.counters.diagnosis.calls + self.counters.publish.calls
    }

    pub fn total_retries(&self) -> u32 {
        self.counters.diagnosis.retries + self.counters.publish.retries
    }
}
