//! Lightweight remediation for flaky failures: mark the test for reruns (or
//! ignore it), without asking the reasoning service.

use mender_adapters::SourceFile;
use mender_core::{content_digest, FailureRecord, FixProposal, PatchBody};
use std::path::{Path, PathBuf};

/// Tests that could not be annotated in place are listed here, one id per line.
pub const QUARANTINE_FILE: &str = ".mender/quarantined-tests.txt";

const PYTEST_RERUN_MARKER: &str = "@pytest.mark.flaky(reruns=2)";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlakyError {
    #[error("{0} is already quarantined")]
    AlreadyQuarantined(String),
}

/// The file that defines the failing test, when it can be told.
pub fn test_file(record: &FailureRecord) -> Option<PathBuf> {
    if let Some((file, _)) = record.test_identifier.split_once("::") {
        if file.ends_with(".py") {
            return Some(PathBuf::from(file));
        }
    }
    record.source_file.clone()
}

/// Build the annotation (or quarantine) proposal for a flaky record.
///
/// `source` is the test's file as read from the work tree, `quarantine` the
/// current quarantine list if one exists.
pub fn annotation_proposal(
    record: &FailureRecord,
    source: Option<&SourceFile>,
    quarantine: Option<&SourceFile>,
    run_id: &str,
) -> Result<FixProposal, FlakyError> {
    let name = record.short_name();
    if let Some(source) = source {
        let annotated = match extension(&source.path) {
            Some("py") => annotate_python(&source.content, name),
            Some("rs") => annotate_rust(&source.content, name, run_id),
            _ => None,
        };
        if let Some(content) = annotated {
            return Ok(FixProposal {
                target_file: source.path.clone(),
                patch: PatchBody::Replacement(content),
                rationale: format!(
                    "Mark flaky test {} for automatic reruns.\n\nThe same log shows this test both \
                     failing and passing, so it is treated as non-deterministic rather than \
                     diagnosed as a defect. The root cause still needs a human look.",
                    record.test_identifier
                ),
                base_digest: Some(content_digest(&source.content)),
            });
        }
    }

    quarantine_proposal(record, quarantine, run_id)
}

fn quarantine_proposal(
    record: &FailureRecord,
    quarantine: Option<&SourceFile>,
    run_id: &str,
) -> Result<FixProposal, FlakyError> {
    let current = quarantine.map(|q| q.content.as_str()).unwrap_or_default();
    let already = current
        .lines()
        .filter_map(|line| line.split('#').next())
        .any(|id| id.trim() == record.test_identifier);
    if already {
        return Err(FlakyError::AlreadyQuarantined(record.test_identifier.clone()));
    }

    let mut content = current.to_string();
    if content.is_empty() {
        content.push_str("# Tests quarantined as flaky by mender. Remove a line to re-enable.\n");
    } else if !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&format!("{}  # run {}\n", record.test_identifier, run_id));

    Ok(FixProposal {
        target_file: PathBuf::from(QUARANTINE_FILE),
        patch: PatchBody::Replacement(content),
        rationale: format!(
            "Quarantine flaky test {}.\n\nThe same log shows this test both failing and passing. \
             Its definition could not be annotated in place, so it is added to {}.",
            record.test_identifier, QUARANTINE_FILE
        ),
        base_digest: quarantine.map(|q| content_digest(&q.content)),
    })
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

fn indentation(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Attribute and decorator lines directly above `idx`.
fn preceding_attributes<'a>(lines: &[&'a str], idx: usize, prefix: char) -> Vec<&'a str> {
    lines[..idx]
        .iter()
        .rev()
        .map(|l| l.trim())
        .take_while(|l| l.starts_with(prefix))
        .collect()
}

fn rejoin(lines: Vec<String>, original: &str) -> String {
    let mut out = lines.join("\n");
    if original.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn annotate_python(content: &str, test_name: &str) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    let needles = [format!("def {}(", test_name), format!("async def {}(", test_name)];
    let def_idx = lines.iter().position(|line| {
        let trimmed = line.trim_start();
        needles.iter().any(|n| trimmed.starts_with(n.as_str()))
    })?;
    if preceding_attributes(&lines, def_idx, '@')
        .iter()
        .any(|d| d.starts_with("@pytest.mark.flaky"))
    {
        return None;
    }

    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    out.insert(
        def_idx,
        format!("{}{}", indentation(lines[def_idx]), PYTEST_RERUN_MARKER),
    );

    let has_import = lines
        .iter()
        .any(|l| l.trim() == "import pytest" || l.trim_start().starts_with("import pytest "));
    if !has_import {
        out.insert(
            python_import_index(&lines).min(def_idx),
            "import pytest".to_string(),
        );
    }
    Some(rejoin(out, content))
}

/// After `from __future__` imports, else before the first top-level import.
fn python_import_index(lines: &[&str]) -> usize {
    if let Some(last_future) = lines
        .iter()
        .rposition(|l| l.starts_with("from __future__ import"))
    {
        return last_future + 1;
    }
    lines
        .iter()
        .position(|l| l.starts_with("import ") || l.starts_with("from "))
        .unwrap_or(0)
}

fn annotate_rust(content: &str, test_name: &str, run_id: &str) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    let needles = [format!("fn {}(", test_name), format!("fn {}<", test_name)];
    let def_idx = lines.iter().position(|line| {
        let trimmed = line.trim_start();
        let trimmed = trimmed.strip_prefix("pub ").unwrap_or(trimmed);
        let trimmed = trimmed.strip_prefix("async ").unwrap_or(trimmed);
        needles.iter().any(|n| trimmed.starts_with(n.as_str()))
    })?;
    let attributes = preceding_attributes(&lines, def_idx, '#');
    if attributes.iter().any(|a| a.starts_with("#[ignore")) {
        return None;
    }

    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    out.insert(
        def_idx,
        format!(
            "{}#[ignore = \"flaky: quarantined by mender (run {})\"]",
            indentation(lines[def_idx]),
            run_id
        ),
    );
    Some(rejoin(out, content))
}
