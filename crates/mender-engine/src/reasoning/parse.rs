//! Parsing and validating the reasoning service's fix response.

use crate::context::SourceContext;
use mender_core::util::is_safe_relative_path;
use mender_core::{patch, FixProposal, PatchBody};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidProposal {
    #[error("response is not a JSON fix object: {0}")]
    NotJson(String),
    #[error("response names no target file")]
    MissingFile,
    #[error("target path is not repository-relative: {0}")]
    UnsafePath(String),
    #[error("response contains an empty patch")]
    EmptyPatch,
    #[error("unknown patch format: {0}")]
    UnknownFormat(String),
    #[error("patch is not a unified diff")]
    NotADiff,
    #[error("whole-file replacement is only accepted for the complete context file")]
    ReplacementNotAllowed,
    #[error("patch does not apply to the supplied source: {0}")]
    DoesNotApply(String),
}

#[derive(Debug, Deserialize)]
struct FixResponse {
    #[serde(default, alias = "target_file", alias = "path")]
    file: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default, alias = "diff", alias = "content")]
    patch: Option<String>,
    #[serde(default, alias = "explanation", alias = "reason")]
    rationale: Option<String>,
}

/// Strip markdown code fences from a response.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Extract the first balanced `{...}` fragment, ignoring braces inside strings.
fn extract_json_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut start_idx = None;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if c == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if c == '{' {
            if depth == 0 {
                start_idx = Some(i);
            }
            depth += 1;
        } else if c == '}' && depth > 0 {
            depth -= 1;
            if depth == 0 {
                if let Some(start) = start_idx {
                    return Some(&text[start..=i]);
                }
            }
        }
    }
    None
}

/// Remove trailing commas before `}` or `]` that sit outside string literals.
fn strip_trailing_commas(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escape_next = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escape_next {
                escape_next = false;
            } else if c == '\\' {
                escape_next = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn push_unique(candidates: &mut Vec<String>, candidate: impl Into<String>) {
    let candidate = candidate.into();
    if !candidate.trim().is_empty() && !candidates.contains(&candidate) {
        candidates.push(candidate);
    }
}

/// Try the raw content first, then progressively salvaged variants.
fn parse_response(content: &str) -> Result<FixResponse, InvalidProposal> {
    let mut candidates = Vec::new();
    push_unique(&mut candidates, content);
    let stripped = strip_markdown_fences(content);
    push_unique(&mut candidates, stripped);
    if let Some(object) = extract_json_object(stripped) {
        push_unique(&mut candidates, object);
        push_unique(&mut candidates, strip_trailing_commas(object));
    }

    let mut last_err = None;
    for candidate in &candidates {
        match serde_json::from_str::<FixResponse>(candidate) {
            Ok(parsed) => return Ok(parsed),
            Err(err) => last_err = Some(err.to_string()),
        }
    }
    Err(InvalidProposal::NotJson(
        last_err.unwrap_or_else(|| "empty response".to_string()),
    ))
}

/// Normalize a path as written by the service to a repository-relative one.
///
/// `a/`/`b/` prefixes from diff headers are only dropped when that yields the
/// context file, since they are also legitimate directory names.
fn normalize_target(raw: &str, context: &SourceContext) -> Result<PathBuf, InvalidProposal> {
    let trimmed = raw.trim().trim_matches('`');
    if trimmed.is_empty() {
        return Err(InvalidProposal::MissingFile);
    }
    let path: PathBuf = Path::new(trimmed)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    if let Some(context_path) = &context.path {
        for prefix in ["a", "b"] {
            if let Ok(rest) = path.strip_prefix(prefix) {
                if rest == context_path {
                    return Ok(rest.to_path_buf());
                }
            }
        }
    }

    if !is_safe_relative_path(&path) {
        return Err(InvalidProposal::UnsafePath(trimmed.to_string()));
    }
    Ok(path)
}

/// Turn the service's raw answer into a validated `FixProposal`.
pub fn parse_fix_proposal(
    content: &str,
    context: &SourceContext,
) -> Result<FixProposal, InvalidProposal> {
    let response = parse_response(content)?;
    let raw_file = response.file.ok_or(InvalidProposal::MissingFile)?;
    let target_file = normalize_target(&raw_file, context)?;
    let text = response
        .patch
        .filter(|p| !p.trim().is_empty())
        .ok_or(InvalidProposal::EmptyPatch)?;

    let is_context_file = context.path.as_deref() == Some(target_file.as_path());
    let format = response
        .format
        .map(|f| f.trim().to_ascii_lowercase())
        .unwrap_or_else(|| {
            if text.contains("@@ -") {
                "diff".to_string()
            } else {
                "replace".to_string()
            }
        });

    let patch = match format.as_str() {
        "diff" | "unified_diff" | "unified-diff" | "patch" => {
            if !text.contains("@@ -") {
                return Err(InvalidProposal::NotADiff);
            }
            PatchBody::UnifiedDiff(text)
        }
        "replace" | "replacement" | "full" | "file" => {
            if !is_context_file || context.truncated {
                return Err(InvalidProposal::ReplacementNotAllowed);
            }
            PatchBody::Replacement(text)
        }
        other => return Err(InvalidProposal::UnknownFormat(other.to_string())),
    };

    let rationale = response
        .rationale
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "No rationale provided.".to_string());

    let proposal = FixProposal {
        target_file,
        patch,
        rationale,
        base_digest: if is_context_file {
            context.digest.clone()
        } else {
            None
        },
    };

    // Full context means the proposal can be checked against exactly what
    // the service saw.
    if is_context_file && !context.truncated {
        patch::apply(Some(&context.content), &proposal)
            .map_err(|e| InvalidProposal::DoesNotApply(e.to_string()))?;
    }
    Ok(proposal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender_core::content_digest;

    const SOURCE: &str = "def test_add_numbers():\n    assert add(2, 2) == 5\n";

    fn context() -> SourceContext {
        SourceContext::from_content(PathBuf::from("tests/test_calc.py"), SOURCE, Some(2), 10_000)
    }

    fn diff() -> &'static str {
        "--- a/tests/test_calc.py\n+++ b/tests/test_calc.py\n@@ -1,2 +1,2 @@\n def test_add_numbers():\n-    assert add(2, 2) == 5\n+    assert add(2, 2) == 4\n"
    }

    #[test]
    fn test_parses_fenced_diff_response() {
        let body = serde_json::json!({
            "file": "./tests/test_calc.py",
            "format": "diff",
            "patch": diff(),
            "rationale": "add(2, 2) is 4; the expectation was wrong.",
        });
        let content = format!("Here is the fix:\n```json\n{}\n```", body);
        let proposal = parse_fix_proposal(&content, &context()).unwrap();
        assert_eq!(proposal.target_file, PathBuf::from("tests/test_calc.py"));
        assert!(matches!(proposal.patch, PatchBody::UnifiedDiff(_)));
        assert_eq!(proposal.base_digest, Some(content_digest(SOURCE)));
    }

    #[test]
    fn test_salvages_trailing_commas_and_aliases() {
        let content = format!(
            "{{\"target_file\": \"b/tests/test_calc.py\", \"diff\": {}, \"explanation\": \"fix expectation\",}}",
            serde_json::to_string(diff()).unwrap()
        );
        let proposal = parse_fix_proposal(&content, &context()).unwrap();
        assert_eq!(proposal.target_file, PathBuf::from("tests/test_calc.py"));
        assert_eq!(proposal.rationale, "fix expectation");
    }

    #[test]
    fn test_trailing_comma_inside_string_is_preserved() {
        let fixed = strip_trailing_commas(r#"{"a": "x,}", "b": [1, 2,],}"#);
        assert_eq!(fixed, r#"{"a": "x,}", "b": [1, 2]}"#);
    }

    #[test]
    fn test_rejects_missing_fields_and_unsafe_paths() {
        let ctx = context();
        assert_eq!(
            parse_fix_proposal(r#"{"patch": "x"}"#, &ctx).unwrap_err(),
            InvalidProposal::MissingFile
        );
        assert_eq!(
            parse_fix_proposal(r#"{"file": "a.py", "patch": "  "}"#, &ctx).unwrap_err(),
            InvalidProposal::EmptyPatch
        );
        assert!(matches!(
            parse_fix_proposal(
                r#"{"file": "../etc/passwd", "format": "diff", "patch": "@@ -1 +1 @@"}"#,
                &ctx
            ),
            Err(InvalidProposal::UnsafePath(_))
        ));
        assert!(matches!(
            parse_fix_proposal("I cannot help with that.", &ctx),
            Err(InvalidProposal::NotJson(_))
        ));
    }

    #[test]
    fn test_replacement_requires_full_context_file() {
        let replacement = serde_json::json!({
            "file": "tests/test_calc.py",
            "format": "replace",
            "patch": "def test_add_numbers():\n    assert add(2, 2) == 4\n",
            "rationale": "fix",
        })
        .to_string();
        assert!(parse_fix_proposal(&replacement, &context()).is_ok());

        let big = format!("{}{}", "# filler\n".repeat(100), SOURCE);
        let truncated =
            SourceContext::from_content(PathBuf::from("tests/test_calc.py"), &big, Some(101), 120);
        assert!(truncated.truncated);
        assert_eq!(
            parse_fix_proposal(&replacement, &truncated).unwrap_err(),
            InvalidProposal::ReplacementNotAllowed
        );
    }

    #[test]
    fn test_rejects_diff_that_does_not_match_context() {
        let body = serde_json::json!({
            "file": "tests/test_calc.py",
            "format": "diff",
            "patch": "@@ -1,1 +1,1 @@\n-def test_subtract():\n+def test_sub():\n",
            "rationale": "rename",
        })
        .to_string();
        assert!(matches!(
            parse_fix_proposal(&body, &context()),
            Err(InvalidProposal::DoesNotApply(_))
        ));
    }

    #[test]
    fn test_unchanged_replacement_is_rejected() {
        let body = serde_json::json!({
            "file": "tests/test_calc.py",
            "format": "replace",
            "patch": SOURCE,
            "rationale": "nothing",
        })
        .to_string();
        assert!(matches!(
            parse_fix_proposal(&body, &context()),
            Err(InvalidProposal::DoesNotApply(_))
        ));
    }
}
