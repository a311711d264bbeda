//! Remediation Orchestrator: sequences extraction, diagnosis, application and
//! publishing for one invocation and owns its `RemediationAttempt`.

use crate::context::SourceContext;
use crate::flaky;
use crate::reasoning::{DiagnosisError, ReasoningClient};
use crate::report;
use mender_adapters::git_ops::work_branch_name;
use mender_adapters::{BranchHandle, Config, MutationError, RepositoryMutator, SourceFile};
use mender_core::{
    extract, AttemptStatus, FailureRecord, FixProposal, FormatHint, RemediationAttempt,
    RemediationPath, TerminalReason,
};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub run_id: String,
    pub base_branch: String,
    pub branch_prefix: String,
    pub max_context_chars: usize,
    /// Reported in the review request footer.
    pub model: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            run_id: config.run_id.clone(),
            base_branch: config.hosting.base_branch.clone(),
            branch_prefix: config.hosting.branch_prefix.clone(),
            max_context_chars: config.reasoning.max_context_chars,
            model: config.reasoning.model.clone(),
        }
    }
}

pub struct Orchestrator<'a> {
    reasoning: &'a ReasoningClient,
    mutator: &'a dyn RepositoryMutator,
    settings: OrchestratorSettings,
}

fn mutation_reason(err: MutationError) -> TerminalReason {
    match err {
        MutationError::BranchExists(e) => TerminalReason::BranchExists { branch: e.branch },
        MutationError::PatchApply(e) => TerminalReason::PatchApply {
            detail: e.to_string(),
        },
        MutationError::RemoteUnavailable(e) => TerminalReason::RemoteUnavailable {
            detail: e.to_string(),
        },
        MutationError::Local(detail) => TerminalReason::Repository { detail },
    }
}

fn diagnosis_reason(err: DiagnosisError) -> TerminalReason {
    TerminalReason::Diagnosis {
        reason: err.reason,
        detail: err.detail,
    }
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        reasoning: &'a ReasoningClient,
        mutator: &'a dyn RepositoryMutator,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            reasoning,
            mutator,
            settings,
        }
    }

    /// Run the pipeline once. Always returns a terminal attempt.
    pub async fn run(&self, raw_log: &[u8], hint: Option<FormatHint>) -> RemediationAttempt {
        let mut attempt = RemediationAttempt::new(self.settings.run_id.clone());

        let records = match extract(raw_log, hint) {
            Ok(records) => records,
            Err(err) => {
                attempt.fail(
                    AttemptStatus::FailedParse,
                    TerminalReason::Extraction {
                        detail: err.to_string(),
                    },
                );
                return attempt;
            }
        };
        attempt.records_found = records.len();
        // Later records are left for later invocations; one patch per run.
        let Some(record) = records.into_iter().next() else {
            attempt.fail(
                AttemptStatus::FailedParse,
                TerminalReason::Extraction {
                    detail: "no failure records".to_string(),
                },
            );
            return attempt;
        };
        tracing::info!(
            test = %record.test_identifier,
            kind = %record.error_kind,
            format = record.format.label(),
            flaky = record.flaky,
            found = attempt.records_found,
            "failure selected"
        );

        attempt.branch_name = Some(work_branch_name(
            &self.settings.branch_prefix,
            &self.settings.run_id,
            &record.signature(),
        ));
        attempt.failure = Some(record.clone());

        if record.flaky {
            self.run_lightweight(&mut attempt, &record).await;
        } else {
            self.run_full(&mut attempt, &record).await;
        }
        attempt
    }

    async fn run_full(&self, attempt: &mut RemediationAttempt, record: &FailureRecord) {
        attempt.path = Some(RemediationPath::Full);
        attempt.advance(AttemptStatus::Diagnosing);

        let source_path = record.source_file.clone().or_else(|| flaky::test_file(record));
        let source = source_path.as_deref().and_then(|p| self.read_source(p));
        let context =
            SourceContext::for_record(record, source.as_ref(), self.settings.max_context_chars);
        let proposal = match self
            .reasoning
            .diagnose_and_fix(record, &context, &mut attempt.counters.diagnosis)
            .await
        {
            Ok(proposal) => proposal,
            Err(err) => {
                attempt.fail(AttemptStatus::FailedDiagnosis, diagnosis_reason(err));
                return;
            }
        };

        attempt.advance(AttemptStatus::Applying);
        let Some(handle) = self.create_branch(attempt).await else {
            return;
        };

        let proposal = match self.mutator.apply_patch(&handle, &proposal) {
            Ok(commit) => {
                self.record_commit(attempt, &commit.id, &commit.path);
                proposal
            }
            Err(MutationError::PatchApply(err)) => {
                tracing::warn!(
                    file = %proposal.target_file.display(),
                    error = %err,
                    "proposal does not apply to current content; re-diagnosing once"
                );
                attempt.rediagnosed = true;
                let Some(fresh) = self.rediagnose(attempt, record, &proposal).await else {
                    return;
                };
                match self.mutator.apply_patch(&handle, &fresh) {
                    Ok(commit) => {
                        self.record_commit(attempt, &commit.id, &commit.path);
                        fresh
                    }
                    Err(err) => {
                        attempt.fail(AttemptStatus::FailedPublish, mutation_reason(err));
                        return;
                    }
                }
            }
            Err(err) => {
                attempt.fail(AttemptStatus::FailedPublish, mutation_reason(err));
                return;
            }
        };

        self.publish(attempt, &handle, record, &proposal, RemediationPath::Full)
            .await;
    }

    /// Second and last diagnosis, against the content now on the work branch.
    async fn rediagnose(
        &self,
        attempt: &mut RemediationAttempt,
        record: &FailureRecord,
        stale: &FixProposal,
    ) -> Option<FixProposal> {
        let source = self.read_source(&stale.target_file);
        let context =
            SourceContext::for_record(record, source.as_ref(), self.settings.max_context_chars);
        match self
            .reasoning
            .diagnose_and_fix(record, &context, &mut attempt.counters.diagnosis)
            .await
        {
            Ok(proposal) => Some(proposal),
            Err(err) => {
                attempt.fail(AttemptStatus::FailedDiagnosis, diagnosis_reason(err));
                None
            }
        }
    }

    /// Flaky failures: annotate or quarantine the test without diagnosis.
    async fn run_lightweight(&self, attempt: &mut RemediationAttempt, record: &FailureRecord) {
        attempt.path = Some(RemediationPath::Lightweight);
        tracing::info!(test = %record.test_identifier, "flaky failure; skipping diagnosis");
        attempt.advance(AttemptStatus::Applying);

        let Some(handle) = self.create_branch(attempt).await else {
            return;
        };

        let source = flaky::test_file(record).and_then(|p| self.read_source(&p));
        let quarantine = self.read_source(Path::new(flaky::QUARANTINE_FILE));
        let proposal = match flaky::annotation_proposal(
            record,
            source.as_ref(),
            quarantine.as_ref(),
            &self.settings.run_id,
        ) {
            Ok(proposal) => proposal,
            Err(err) => {
                attempt.fail(
                    AttemptStatus::FailedPublish,
                    TerminalReason::PatchApply {
                        detail: err.to_string(),
                    },
                );
                return;
            }
        };

        match self.mutator.apply_patch(&handle, &proposal) {
            Ok(commit) => self.record_commit(attempt, &commit.id, &commit.path),
            Err(err) => {
                attempt.fail(AttemptStatus::FailedPublish, mutation_reason(err));
                return;
            }
        }

        self.publish(attempt, &handle, record, &proposal, RemediationPath::Lightweight)
            .await;
    }

    async fn create_branch(&self, attempt: &mut RemediationAttempt) -> Option<BranchHandle> {
        let name = attempt.branch_name.clone().unwrap_or_default();
        match self
            .mutator
            .create_work_branch(&self.settings.base_branch, &name, &mut attempt.counters.publish)
            .await
        {
            Ok(handle) => {
                attempt.branch_name = Some(handle.name.clone());
                Some(handle)
            }
            Err(err) => {
                attempt.fail(AttemptStatus::FailedPublish, mutation_reason(err));
                None
            }
        }
    }

    fn record_commit(&self, attempt: &mut RemediationAttempt, id: &str, path: &Path) {
        attempt.commit = Some(id.to_string());
        attempt.target_file = Some(path.to_path_buf());
        attempt.unpublished_commit = true;
    }

    async fn publish(
        &self,
        attempt: &mut RemediationAttempt,
        handle: &BranchHandle,
        record: &FailureRecord,
        proposal: &FixProposal,
        path: RemediationPath,
    ) {
        let draft = report::review_draft(
            record,
            proposal,
            path,
            &self.settings.run_id,
            &self.settings.model,
        );
        match self
            .mutator
            .publish(handle, &draft, &mut attempt.counters.publish)
            .await
        {
            Ok(reference) => {
                attempt.publish(reference.url);
            }
            Err(err) => {
                attempt.fail(AttemptStatus::FailedPublish, mutation_reason(err));
            }
        }
    }

    /// Unreadable sources degrade to diagnosis from the log alone.
    fn read_source(&self, path: &Path) -> Option<SourceFile> {
        match self.mutator.read_source(path) {
            Ok(source) => source,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "source unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_errors_keep_their_cause() {
        let reason = mutation_reason(MutationError::BranchExists(
            mender_adapters::BranchExistsError {
                branch: "fix/ai-heal/1-abcd".to_string(),
            },
        ));
        assert_eq!(
            reason,
            TerminalReason::BranchExists {
                branch: "fix/ai-heal/1-abcd".to_string()
            }
        );
        let reason = mutation_reason(MutationError::Local("index locked".to_string()));
        assert_eq!(
            reason,
            TerminalReason::Repository {
                detail: "index locked".to_string()
            }
        );
    }
}
