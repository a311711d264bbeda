//! Core domain model for Mender: failure records, fix proposals, the
//! remediation attempt record, log extraction, patch application and the
//! shared retry policy. Nothing in this crate touches the network or disk.

pub mod attempt;
pub mod extract;
pub mod failure;
pub mod patch;
pub mod proposal;
pub mod retry;
pub mod util;

pub use attempt::{
    AttemptCounters, AttemptStatus, DiagnosisReason, RemediationAttempt, RemediationPath,
    StageCounter, TerminalReason,
};
pub use extract::{extract, ExtractionError};
pub use failure::{ErrorKind, FailureRecord, FormatHint, LogFormat};
pub use patch::{content_digest, PatchApplyError};
pub use proposal::{FixProposal, PatchBody};
pub use retry::{parse_retry_after, retry, BackoffPolicy, RetryDecision};
