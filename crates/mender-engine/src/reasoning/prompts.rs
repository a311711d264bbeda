// ═══════════════════════════════════════════════════════════════════════════════
// SHARED BUILDING BLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

use crate::context::SourceContext;
use mender_core::util::truncate;
use mender_core::FailureRecord;

/// Core edit rules for every fix request.
const EDIT_RULES: &str = r#"EDIT RULES:
- Make the smallest change that makes the failing test pass for the right reason.
- Preserve behavior everywhere else; do not refactor, rename, or reformat.
- Preserve indentation and surrounding style.
- No placeholders, ellipses, or commentary inside the patch.
- Fix the code under test when it is wrong; fix the test only when its expectation is wrong."#;

const OUTPUT_FORMAT: &str = r#"OUTPUT (JSON object only):
{
  "file": "repository-relative path of the single file to change",
  "format": "diff" | "replace",
  "patch": "the change body",
  "rationale": "one short paragraph: root cause, then what the change does"
}

- "diff": a unified diff with @@ -start,count +start,count @@ headers. Line numbers are
  absolute line numbers in the file, and context/removed lines must match the source exactly.
- "replace": the complete new contents of the file. Only allowed when the full file was
  provided below (not an excerpt).
- Change exactly one file."#;

// ═══════════════════════════════════════════════════════════════════════════════
// PROMPTS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn fix_system() -> String {
    format!(
        r#"You are Mender, a conservative code-fix generator for failing CI builds.

You receive one structured test failure and the relevant source. Propose a minimal,
behavior-preserving edit that resolves it. Your change is reviewed by a human before merge.

{EDIT_RULES}

{OUTPUT_FORMAT}"#
    )
}

/// Longest message and excerpt quoted back to the service.
const MAX_EXCERPT_CHARS: usize = 4_000;

pub fn fix_user(record: &FailureRecord, context: &SourceContext) -> String {
    let mut prompt = String::from("FAILURE\n");
    prompt.push_str(&format!("Test: {}\n", record.test_identifier));
    prompt.push_str(&format!("Kind: {}\n", record.error_kind));
    prompt.push_str(&format!("Format: {}\n", record.format.label()));
    if let Some(file) = &record.source_file {
        prompt.push_str(&format!("File: {}\n", file.display()));
    }
    if let Some(line) = record.line_number {
        prompt.push_str(&format!("Line: {}\n", line));
    }
    prompt.push_str(&format!(
        "Message: {}\n\nLOG EXCERPT:\n{}\n",
        truncate(&record.message, 500),
        truncate(&record.raw_excerpt, MAX_EXCERPT_CHARS)
    ));

    match &context.path {
        Some(path) if context.truncated => {
            prompt.push_str(&format!(
                "\nSOURCE EXCERPT: {} (lines {}-{} of a larger file; use \"diff\")\n",
                path.display(),
                context.first_line,
                context.first_line + context.content.lines().count().saturating_sub(1)
            ));
            prompt.push_str(&context.content);
        }
        Some(path) => {
            prompt.push_str(&format!("\nSOURCE FILE: {} (complete)\n", path.display()));
            prompt.push_str(&context.content);
        }
        None => {
            prompt.push_str(
                "\nSOURCE: unavailable. Infer the file from the log excerpt and answer with a \"diff\".\n",
            );
        }
    }
    if !prompt.ends_with('\n') {
        prompt.push('\n');
    }
    prompt
}
