//! Source context handed to the reasoning client.
//!
//! Oversized files are cut to a window of whole lines around the failing
//! line, never from the start.

use mender_adapters::SourceFile;
use mender_core::{content_digest, FailureRecord};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    /// Repository-relative path of the file shown, if one could be read.
    pub path: Option<PathBuf>,
    /// The file content, or an excerpt of it when `truncated`.
    pub content: String,
    /// 1-based line number of the first line in `content`.
    pub first_line: usize,
    pub focus_line: Option<usize>,
    pub truncated: bool,
    pub total_chars: usize,
    /// Digest of the full file content.
    pub digest: Option<String>,
}

impl SourceContext {
    /// No source could be read; diagnosis relies on the log excerpt alone.
    pub fn unavailable() -> Self {
        Self {
            path: None,
            content: String::new(),
            first_line: 1,
            focus_line: None,
            truncated: false,
            total_chars: 0,
            digest: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.path.is_some()
    }

    /// Build the context for `record` from the file it points at.
    pub fn for_record(
        record: &FailureRecord,
        source: Option<&SourceFile>,
        max_chars: usize,
    ) -> Self {
        let Some(source) = source else {
            return Self::unavailable();
        };
        let lines: Vec<&str> = source.content.lines().collect();
        let focus = record
            .line_number
            .map(|n| n as usize)
            .filter(|n| *n >= 1 && *n <= lines.len())
            .or_else(|| find_anchor_line(&lines, record.short_name()));
        Self::from_content(source.path.clone(), &source.content, focus, max_chars)
    }

    pub fn from_content(
        path: PathBuf,
        content: &str,
        focus_line: Option<usize>,
        max_chars: usize,
    ) -> Self {
        let total_chars = content.chars().count();
        let digest = Some(content_digest(content));
        if total_chars <= max_chars {
            return Self {
                path: Some(path),
                content: content.to_string(),
                first_line: 1,
                focus_line,
                truncated: false,
                total_chars,
                digest,
            };
        }

        let lines: Vec<&str> = content.lines().collect();
        // Without a focus line the middle of the file is as good a guess as any.
        let target = focus_line.unwrap_or(lines.len() / 2 + 1);
        let (excerpt, first_line) = match window_around_line(&lines, target, max_chars) {
            Some((start, end)) => (lines[start..=end].join("\n"), start + 1),
            None => {
                let line = lines.get(target.saturating_sub(1)).copied().unwrap_or("");
                (truncate_line_to_chars(line, max_chars), target.max(1))
            }
        };

        Self {
            path: Some(path),
            content: excerpt,
            first_line,
            focus_line,
            truncated: true,
            total_chars,
            digest,
        }
    }
}

/// First line that defines the failing test, by name.
fn find_anchor_line(lines: &[&str], test_name: &str) -> Option<usize> {
    if test_name.is_empty() {
        return None;
    }
    let candidates = [
        format!("def {}(", test_name),
        format!("fn {}(", test_name),
        format!("{}(", test_name),
    ];
    candidates.iter().find_map(|needle| {
        lines
            .iter()
            .position(|line| line.contains(needle.as_str()))
            .map(|idx| idx + 1)
    })
}

/// Largest symmetric window of whole lines around `line_number` (1-based)
/// that fits in `max_chars`. Returns 0-based inclusive bounds.
fn window_around_line(
    lines: &[&str],
    line_number: usize,
    max_chars: usize,
) -> Option<(usize, usize)> {
    if max_chars == 0 || lines.is_empty() {
        return None;
    }
    let target = line_number.saturating_sub(1);
    if target >= lines.len() {
        return None;
    }

    let max_radius = target.max(lines.len() - 1 - target);
    let mut best = None;
    let mut lo = 0usize;
    let mut hi = max_radius;

    while lo <= hi {
        let mid = (lo + hi) / 2;
        let start = target.saturating_sub(mid);
        let end = (target + mid).min(lines.len() - 1);
        let size: usize = lines[start..=end]
            .iter()
            .map(|l| l.chars().count() + 1)
            .sum::<usize>()
            - 1;
        if size <= max_chars {
            best = Some((start, end));
            lo = mid + 1;
        } else if mid == 0 {
            break;
        } else {
            hi = mid - 1;
        }
    }
    best
}

fn truncate_line_to_chars(line: &str, max_chars: usize) -> String {
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    if max_chars <= 3 {
        return line.chars().take(max_chars).collect();
    }
    let prefix: String = line.chars().take(max_chars - 3).collect();
    format!("{}...", prefix)
}
