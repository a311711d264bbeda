//! Applying a `FixProposal` to file content.
//!
//! Application is all-or-nothing: every hunk must match the current content
//! or nothing is produced. No fuzzy matching beyond trailing whitespace.

use crate::proposal::{FixProposal, PatchBody};
use crate::util::{hash_str, is_safe_relative_path};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchApplyError {
    #[error("{path} changed since the fix was generated")]
    Stale { path: String },
    #[error("hunk {hunk} does not apply: {reason}")]
    HunkMismatch { hunk: usize, reason: String },
    #[error("invalid unified diff: {0}")]
    InvalidDiff(String),
    #[error("target path is not repository-relative: {0}")]
    UnsafePath(PathBuf),
    #[error("target file does not exist: {0}")]
    TargetMissing(PathBuf),
    #[error("patch leaves {0} unchanged")]
    NoChange(PathBuf),
    #[error("failed to access working tree: {0}")]
    Io(String),
}

/// Digest recorded in `FixProposal::base_digest`.
pub fn content_digest(content: &str) -> String {
    hash_str(content)
}

/// Apply `proposal` to `current` (the target file's content, `None` if absent),
/// returning the new content.
pub fn apply(current: Option<&str>, proposal: &FixProposal) -> Result<String, PatchApplyError> {
    let path = &proposal.target_file;
    if !is_safe_relative_path(path) {
        return Err(PatchApplyError::UnsafePath(path.clone()));
    }

    match (&proposal.base_digest, current) {
        (Some(_), None) => return Err(PatchApplyError::TargetMissing(path.clone())),
        (Some(expected), Some(content)) if *expected != content_digest(content) => {
            return Err(PatchApplyError::Stale {
                path: path.display().to_string(),
            })
        }
        _ => {}
    }

    let updated = match &proposal.patch {
        PatchBody::Replacement(text) => {
            let mut text = text.clone();
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text
        }
        PatchBody::UnifiedDiff(diff) => {
            let hunks = parse_hunks(diff)?;
            match current {
                Some(content) => apply_hunks(content, &hunks)?,
                None if hunks.iter().all(|h| h.old.is_empty()) => apply_hunks("", &hunks)?,
                None => return Err(PatchApplyError::TargetMissing(path.clone())),
            }
        }
    };

    if current == Some(updated.as_str()) {
        return Err(PatchApplyError::NoChange(path.clone()));
    }
    Ok(updated)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    old_start: usize,
    old: Vec<String>,
    new: Vec<String>,
}

fn hunk_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk regex")
    })
}

fn parse_count(caps: &regex::Captures<'_>, group: usize) -> Result<usize, PatchApplyError> {
    caps.get(group)
        .map_or(Ok(1), |m| m.as_str().parse::<usize>())
        .map_err(|e| PatchApplyError::InvalidDiff(e.to_string()))
}

/// Parse hunks, consuming exactly the line counts each `@@` header declares.
///
/// Inside a hunk `--- x` is a removed line `-- x`, never a file header.
fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, PatchApplyError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    // Open hunk plus its remaining (old, new) line counts.
    let mut current: Option<(Hunk, usize, usize)> = None;

    for line in diff.lines() {
        if let Some(caps) = hunk_header().captures(line) {
            if let Some((hunk, old_left, new_left)) = current.take() {
                if old_left > 0 || new_left > 0 {
                    return Err(PatchApplyError::InvalidDiff(format!(
                        "hunk {} is shorter than its header",
                        hunks.len() + 1
                    )));
                }
                hunks.push(hunk);
            }
            let old_start = caps[1]
                .parse::<usize>()
                .map_err(|e| PatchApplyError::InvalidDiff(e.to_string()))?;
            let old_count = parse_count(&caps, 2)?;
            let new_count = parse_count(&caps, 4)?;
            let hunk = Hunk {
                old_start,
                old: Vec::new(),
                new: Vec::new(),
            };
            if old_count == 0 && new_count == 0 {
                hunks.push(hunk);
            } else {
                current = Some((hunk, old_count, new_count));
            }
            continue;
        }

        let Some((hunk, old_left, new_left)) = current.as_mut() else {
            // File headers, `index` lines, `\ No newline` markers and blank padding
            // are skipped; a body line here would otherwise be dropped.
            let header = line.starts_with("--- ") || line.starts_with("+++ ");
            if !header && matches!(line.chars().next(), Some(' ' | '-' | '+')) {
                return Err(PatchApplyError::InvalidDiff(format!(
                    "line outside any hunk: {}",
                    crate::util::truncate(line, 80)
                )));
            }
            continue;
        };

        match line.chars().next() {
            // Blank context lines often lose their leading space in transit.
            Some(' ') | None if *old_left > 0 && *new_left > 0 => {
                let text = line.get(1..).unwrap_or_default().to_string();
                hunk.old.push(text.clone());
                hunk.new.push(text);
                *old_left -= 1;
                *new_left -= 1;
            }
            Some('-') if *old_left > 0 => {
                hunk.old.push(line[1..].to_string());
                *old_left -= 1;
            }
            Some('+') if *new_left > 0 => {
                hunk.new.push(line[1..].to_string());
                *new_left -= 1;
            }
            Some('\\') => {}
            _ => {
                return Err(PatchApplyError::InvalidDiff(format!(
                    "unexpected line in hunk {}: {}",
                    hunks.len() + 1,
                    crate::util::truncate(line, 80)
                )))
            }
        }
        if *old_left == 0 && *new_left == 0 {
            if let Some((hunk, _, _)) = current.take() {
                hunks.push(hunk);
            }
        }
    }
    if let Some((_, old_left, new_left)) = current {
        return Err(PatchApplyError::InvalidDiff(format!(
            "diff ends inside hunk {} ({} old and {} new lines missing)",
            hunks.len() + 1,
            old_left,
            new_left
        )));
    }

    if hunks.is_empty() {
        return Err(PatchApplyError::InvalidDiff("no hunks found".to_string()));
    }
    if hunks.iter().all(|h| h.old == h.new) {
        return Err(PatchApplyError::InvalidDiff(
            "diff contains no changes".to_string(),
        ));
    }
    Ok(hunks)
}

fn lines_match(file: &[String], at: usize, expected: &[String]) -> bool {
    at + expected.len() <= file.len()
        && file[at..at + expected.len()]
            .iter()
            .zip(expected)
            .all(|(a, b)| a.trim_end() == b.trim_end())
}

fn apply_hunks(content: &str, hunks: &[Hunk]) -> Result<String, PatchApplyError> {
    let trailing_newline = content.is_empty() || content.ends_with('\n');
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut delta: isize = 0;
    let mut cursor = 0usize;

    for (idx, hunk) in hunks.iter().enumerate() {
        let number = idx + 1;
        let stated = if hunk.old.is_empty() {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let stated = (stated as isize + delta).max(0) as usize;

        let position = if hunk.old.is_empty() {
            if stated > lines.len() {
                return Err(PatchApplyError::HunkMismatch {
                    hunk: number,
                    reason: format!("insertion point {} is past end of file", hunk.old_start),
                });
            }
            stated
        } else if stated >= cursor && lines_match(&lines, stated, &hunk.old) {
            stated
        } else {
            let candidates: Vec<usize> = (cursor..=lines.len().saturating_sub(hunk.old.len()))
                .filter(|&at| lines_match(&lines, at, &hunk.old))
                .collect();
            match candidates.as_slice() {
                [only] => *only,
                [] => {
                    return Err(PatchApplyError::HunkMismatch {
                        hunk: number,
                        reason: "context does not match current content".to_string(),
                    })
                }
                _ => {
                    return Err(PatchApplyError::HunkMismatch {
                        hunk: number,
                        reason: format!("context matches {} locations", candidates.len()),
                    })
                }
            }
        };

        lines.splice(position..position + hunk.old.len(), hunk.new.iter().cloned());
        cursor = position + hunk.new.len();
        delta += hunk.new.len() as isize - hunk.old.len() as isize;
    }

    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}
