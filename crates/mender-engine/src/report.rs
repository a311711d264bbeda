//! Review-request content, the terminal summary, and exit codes.

use mender_adapters::ReviewRequestDraft;
use mender_core::util::truncate;
use mender_core::{AttemptStatus, FailureRecord, FixProposal, RemediationAttempt, RemediationPath};

pub const EXIT_PUBLISHED: i32 = 0;
pub const EXIT_INTERNAL: i32 = 1;
pub const EXIT_FAILED_PARSE: i32 = 2;
pub const EXIT_FAILED_DIAGNOSIS: i32 = 3;
pub const EXIT_FAILED_PUBLISH: i32 = 4;
pub const EXIT_TIMEOUT: i32 = 124;
/// `EX_CONFIG` from sysexits.h.
pub const EXIT_CONFIGURATION: i32 = 78;

/// Process exit code for a finished attempt.
pub fn exit_code(attempt: &RemediationAttempt) -> i32 {
    match attempt.status {
        AttemptStatus::Published => EXIT_PUBLISHED,
        AttemptStatus::FailedParse => EXIT_FAILED_PARSE,
        AttemptStatus::FailedDiagnosis => EXIT_FAILED_DIAGNOSIS,
        AttemptStatus::FailedPublish => EXIT_FAILED_PUBLISH,
        // A non-terminal attempt was cut short.
        AttemptStatus::Pending | AttemptStatus::Diagnosing | AttemptStatus::Applying => {
            EXIT_INTERNAL
        }
    }
}

/// Title and body of the review request for one fix.
pub fn review_draft(
    record: &FailureRecord,
    proposal: &FixProposal,
    path: RemediationPath,
    run_id: &str,
    model: &str,
) -> ReviewRequestDraft {
    let title = match path {
        RemediationPath::Full => format!(
            "Automated fix: {} in {}",
            record.error_kind,
            proposal.target_file.display()
        ),
        RemediationPath::Lightweight => {
            format!("Automated fix: quarantine flaky {}", record.short_name())
        }
    };

    let mut body = String::from("## Failure\n\n");
    body.push_str(&format!("- **Test:** `{}`\n", record.test_identifier));
    body.push_str(&format!("- **Kind:** {}\n", record.error_kind));
    if let Some(file) = &record.source_file {
        body.push_str(&format!("- **File:** `{}`\n", file.display()));
    }
    if let Some(line) = record.line_number {
        body.push_str(&format!("- **Line:** {}\n", line));
    }
    body.push_str(&format!("- **Format:** {}\n", record.format.label()));
    if record.flaky {
        body.push_str("- **Flaky:** the same log shows this test passing as well\n");
    }
    body.push_str(&format!(
        "\n```\n{}\n```\n",
        truncate(record.message.trim(), 1_000).replace("```", "'''")
    ));

    body.push_str("\n## Root cause and fix\n\n");
    body.push_str(proposal.rationale.trim());
    body.push_str(&format!(
        "\n\n- **Changed:** `{}` ({})\n",
        proposal.target_file.display(),
        proposal.patch.label()
    ));

    body.push_str(
        "\n## Review required\n\n\
         > [!WARNING]\n\
         > This change was generated automatically from CI output. It has not been \
         verified by a person and must be reviewed and approved by a human before merge.\n",
    );

    body.push_str("\n## Reviewer checklist\n\n");
    body.push_str("- [ ] The root cause above matches the failure\n");
    body.push_str("- [ ] The change is minimal and does not alter unrelated behavior\n");
    body.push_str("- [ ] The test expectation (if changed) is actually correct\n");
    body.push_str("- [ ] CI passes on this branch\n");
    if path == RemediationPath::Lightweight {
        body.push_str("- [ ] A follow-up exists to fix the flakiness itself\n");
    }

    let engine = match path {
        RemediationPath::Full => model,
        RemediationPath::Lightweight => "none (flaky quarantine)",
    };
    body.push_str(&format!(
        "\n---\n*Opened by mender · run `{}` · model `{}`*\n",
        run_id, engine
    ));

    ReviewRequestDraft { title, body }
}

/// Human-readable account of a finished attempt, for the CI job log.
pub fn summary(attempt: &RemediationAttempt) -> String {
    let mut out = format!("mender run {}: {}\n", attempt.run_id, attempt.status);

    match &attempt.failure {
        Some(record) => {
            out.push_str(&format!(
                "  failure:   {} ({}{})\n",
                record.test_identifier,
                record.error_kind,
                if record.flaky { ", flaky" } else { "" }
            ));
            if attempt.records_found > 1 {
                out.push_str(&format!(
                    "  note:      {} failures found; only the first was remediated\n",
                    attempt.records_found
                ));
            }
        }
        None => out.push_str("  failure:   none extracted\n"),
    }
    if let Some(path) = attempt.path {
        let label = match path {
            RemediationPath::Full => "full diagnosis",
            RemediationPath::Lightweight => "lightweight (flaky)",
        };
        out.push_str(&format!("  path:      {}\n", label));
    }
    if let Some(file) = &attempt.target_file {
        out.push_str(&format!("  target:    {}\n", file.display()));
    }
    if let Some(branch) = &attempt.branch_name {
        out.push_str(&format!("  branch:    {}\n", branch));
    }
    if let Some(commit) = &attempt.commit {
        out.push_str(&format!("  commit:    {}\n", commit));
    }
    if let Some(review) = &attempt.review_request {
        out.push_str(&format!("  review:    {}\n", review));
    }
    if attempt.rediagnosed {
        out.push_str("  note:      the first patch was stale; diagnosis was re-run once\n");
    }

    let counters = &attempt.counters;
    out.push_str(&format!(
        "  calls:     diagnosis {} ({} retried), publish {} ({} retried), total {}\n",
        counters.diagnosis.calls,
        counters.diagnosis.retries,
        counters.publish.calls,
        counters.publish.retries,
        attempt.total_calls()
    ));

    if let Some(reason) = &attempt.reason {
        out.push_str(&format!("  stopped:   {}\n", reason));
    }
    if attempt.unpublished_commit {
        out.push_str(
            "  WARNING:   a commit was created locally but was NOT published; \
             it exists only in this checkout\n",
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender_core::{
        DiagnosisReason, ErrorKind, LogFormat, PatchBody, StageCounter, TerminalReason,
    };
    use std::path::PathBuf;

    fn record() -> FailureRecord {
        FailureRecord {
            source_file: Some(PathBuf::from("tests/test_calc.py")),
            line_number: Some(7),
            test_identifier: "tests/test_calc.py::test_add_numbers".to_string(),
            error_kind: ErrorKind::Assertion,
            message: "assert 4 == 5".to_string(),
            raw_excerpt: "E   assert 4 == 5".to_string(),
            flaky: false,
            format: LogFormat::Pytest,
        }
    }

    fn proposal() -> FixProposal {
        FixProposal {
            target_file: PathBuf::from("tests/test_calc.py"),
            patch: PatchBody::UnifiedDiff("@@ -7 +7 @@\n-x\n+y\n".to_string()),
            rationale: "The expectation was wrong; add(2, 2) is 4.".to_string(),
            base_digest: None,
        }
    }

    #[test]
    fn test_review_draft_follows_template() {
        let draft = review_draft(&record(), &proposal(), RemediationPath::Full, "run-42", "gpt-4o");
        assert_eq!(draft.title, "Automated fix: Assertion in tests/test_calc.py");
        for section in [
            "## Failure",
            "## Root cause and fix",
            "## Review required",
            "## Reviewer checklist",
        ] {
            assert!(draft.body.contains(section), "missing {section}");
        }
        assert!(draft.body.contains("- **Line:** 7"));
        assert!(draft.body.contains("human before merge"));
        assert!(draft.body.contains("run `run-42` · model `gpt-4o`"));
    }

    #[test]
    fn test_exit_codes_per_status() {
        let mut attempt = RemediationAttempt::new("r");
        assert_eq!(exit_code(&attempt), EXIT_INTERNAL);
        attempt.fail(
            AttemptStatus::FailedDiagnosis,
            TerminalReason::Diagnosis {
                reason: DiagnosisReason::QuotaExceeded,
                detail: "quota".to_string(),
            },
        );
        assert_eq!(exit_code(&attempt), EXIT_FAILED_DIAGNOSIS);

        let mut published = RemediationAttempt::new("r");
        published.publish("https://example.test/pull/1");
        assert_eq!(exit_code(&published), EXIT_PUBLISHED);
    }

    #[test]
    fn test_summary_warns_about_unpublished_commit() {
        let mut attempt = RemediationAttempt::new("run-7");
        attempt.failure = Some(record());
        attempt.records_found = 1;
        attempt.commit = Some("abc1234".to_string());
        attempt.unpublished_commit = true;
        attempt.counters.publish = StageCounter { calls: 3, retries: 2 };
        attempt.fail(
            AttemptStatus::FailedPublish,
            TerminalReason::RemoteUnavailable {
                detail: "push failed".to_string(),
            },
        );
        let text = summary(&attempt);
        assert!(text.contains("FailedPublish"));
        assert!(text.contains("publish 3 (2 retried)"));
        assert!(text.contains("NOT published"));
        assert!(text.contains("hosting service unavailable: push failed"));
    }
}
