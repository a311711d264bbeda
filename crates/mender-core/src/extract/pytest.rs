use super::{excerpt, FailureMatcher};
use crate::failure::{short_test_name, ErrorKind, FailureRecord, LogFormat};
use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;

/// pytest `FAILURES`/`ERRORS` sections and short test summary lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct PytestMatcher;

struct Patterns {
    section: Regex,
    any_rule: Regex,
    block: Regex,
    location: Regex,
    summary: Regex,
    file_line: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        section: Regex::new(r"^=+ (FAILURES|ERRORS) =+$").expect("valid section regex"),
        any_rule: Regex::new(r"^=+ .* =+$|^=+$").expect("valid rule regex"),
        block: Regex::new(r"^_{3,} (.+?) _{3,}$").expect("valid block regex"),
        location: Regex::new(r"^([^\s:]+\.py):(\d+): (.+)$").expect("valid location regex"),
        summary: Regex::new(r"^(FAILED|ERROR) (\S+)(?: - (.*))?$").expect("valid summary regex"),
        file_line: Regex::new(r#"File "([^"]+)", line (\d+)"#).expect("valid file regex"),
    })
}

struct SummaryEntry {
    identifier: String,
    message: Option<String>,
}

impl FailureMatcher for PytestMatcher {
    fn format(&self) -> LogFormat {
        LogFormat::Pytest
    }

    fn try_match(&self, text: &str) -> Option<Vec<FailureRecord>> {
        let lines: Vec<&str> = text.lines().collect();
        let summary = summary_entries(&lines);

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        for (start, end) in failure_blocks(&lines) {
            let record = block_record(&lines, start, end, &summary);
            if seen.insert(record.test_identifier.clone()) {
                records.push(record);
            }
        }

        if records.is_empty() {
            // `-q`/`--tb=no` runs only print the summary.
            for entry in &summary {
                if seen.insert(entry.identifier.clone()) {
                    records.push(summary_record(entry));
                }
            }
        }

        if records.is_empty() {
            None
        } else {
            Some(records)
        }
    }
}

fn summary_entries(lines: &[&str]) -> Vec<SummaryEntry> {
    let p = patterns();
    lines
        .iter()
        .filter_map(|line| p.summary.captures(line.trim_end()))
        .map(|caps| SummaryEntry {
            identifier: caps[2].to_string(),
            message: caps.get(3).map(|m| m.as_str().trim().to_string()),
        })
        .collect()
}

/// `(header_line, end_exclusive)` for each `____ name ____` block inside a
/// FAILURES or ERRORS section.
fn failure_blocks(lines: &[&str]) -> Vec<(usize, usize)> {
    let p = patterns();
    let mut blocks = Vec::new();
    let mut in_section = false;
    let mut current: Option<usize> = None;

    for (idx, raw) in lines.iter().enumerate() {
        let line = raw.trim_end();
        if p.section.is_match(line) {
            if let Some(start) = current.take() {
                blocks.push((start, idx));
            }
            in_section = true;
            continue;
        }
        if !in_section {
            continue;
        }
        if p.block.is_match(line) {
            if let Some(start) = current.take() {
                blocks.push((start, idx));
            }
            current = Some(idx);
        } else if p.any_rule.is_match(line) {
            if let Some(start) = current.take() {
                blocks.push((start, idx));
            }
            in_section = false;
        }
    }
    if let Some(start) = current {
        blocks.push((start, lines.len()));
    }
    blocks
}

fn block_record(
    lines: &[&str],
    start: usize,
    end: usize,
    summary: &[SummaryEntry],
) -> FailureRecord {
    let p = patterns();
    let header = lines[start].trim_end();
    let name = p
        .block
        .captures(header)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    let body = &lines[start + 1..end];

    let collecting = name.strip_prefix("ERROR collecting ").map(str::trim);

    // Innermost frame: the last `path.py:LINE: ...` line in the block.
    let location = body.iter().rev().find_map(|line| {
        p.location.captures(line.trim_end()).map(|caps| {
            (
                caps[1].to_string(),
                caps[2].parse::<u32>().ok(),
                caps[3].trim().to_string(),
            )
        })
    });

    let error_lines: Vec<&str> = body
        .iter()
        .filter_map(|line| line.strip_prefix("E "))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let location_kind = location
        .as_ref()
        .map(|(_, _, tail)| ErrorKind::classify(tail))
        .unwrap_or(ErrorKind::Unknown);
    let classified_line = error_lines
        .iter()
        .copied()
        .find(|line| ErrorKind::classify(line) != ErrorKind::Unknown);
    // `path:LINE: Failed` is pytest's generic outcome; the `E` line is more specific.
    let generic_outcome = location
        .as_ref()
        .is_some_and(|(_, _, tail)| tail == "Failed");
    let error_kind = match (location_kind, classified_line.map(ErrorKind::classify)) {
        (ErrorKind::Unknown, line_kind) => line_kind.unwrap_or(ErrorKind::Unknown),
        (_, Some(line_kind)) if generic_outcome => line_kind,
        (kind, _) => kind,
    };

    let short = collecting
        .map(|path| path.to_string())
        .unwrap_or_else(|| name.rsplit('.').next().unwrap_or(&name).to_string());
    let summary_entry = match collecting {
        Some(path) => summary.iter().find(|entry| entry.identifier == path),
        // Exact last segment first so `test_x[1]` never borrows `test_x[2]`'s entry.
        None => summary
            .iter()
            .find(|entry| entry.identifier.rsplit("::").next() == Some(short.as_str()))
            .or_else(|| {
                summary
                    .iter()
                    .find(|entry| short_test_name(&entry.identifier) == short_test_name(&short))
            }),
    };

    let (mut source_file, mut line_number) = match &location {
        Some((file, line, _)) => (Some(PathBuf::from(file)), *line),
        None => (None, None),
    };
    if source_file.is_none() {
        if let Some(path) = collecting {
            source_file = Some(PathBuf::from(path));
        }
        if let Some(caps) = body.iter().find_map(|line| p.file_line.captures(line)) {
            line_number = caps[2].parse::<u32>().ok();
        }
    }

    let test_identifier = match (summary_entry, &source_file) {
        (Some(entry), _) => entry.identifier.clone(),
        (None, _) if collecting.is_some() => short.clone(),
        (None, Some(file)) => format!("{}::{}", file.display(), short),
        (None, None) => short.clone(),
    };

    let message = classified_line
        .or_else(|| error_lines.first().copied())
        .map(str::to_string)
        .or_else(|| summary_entry.and_then(|entry| entry.message.clone()))
        .unwrap_or_else(|| name.clone());

    FailureRecord {
        source_file,
        line_number,
        test_identifier,
        error_kind,
        message,
        raw_excerpt: excerpt(lines, start, end),
        flaky: false,
        format: LogFormat::Pytest,
    }
}

fn summary_record(entry: &SummaryEntry) -> FailureRecord {
    let source_file = entry
        .identifier
        .split("::")
        .next()
        .filter(|path| path.ends_with(".py"))
        .map(PathBuf::from);
    let message = entry
        .message
        .clone()
        .unwrap_or_else(|| format!("{} failed", entry.identifier));
    let raw_excerpt = match &entry.message {
        Some(msg) => format!("FAILED {} - {}", entry.identifier, msg),
        None => format!("FAILED {}", entry.identifier),
    };

    FailureRecord {
        source_file,
        line_number: None,
        test_identifier: entry.identifier.clone(),
        error_kind: ErrorKind::classify(&message),
        message,
        raw_excerpt,
        flaky: false,
        format: LogFormat::Pytest,
    }
}
