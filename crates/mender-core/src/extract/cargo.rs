use super::{excerpt, FailureMatcher};
use crate::failure::{ErrorKind, FailureRecord, LogFormat};
use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;

/// libtest failure blocks and rustc compile diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct CargoTestMatcher;

struct Patterns {
    block: Regex,
    panic_new: Regex,
    panic_old: Regex,
    compile_error: Regex,
    arrow: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        block: Regex::new(r"^---- (\S+) stdout ----$").expect("valid block regex"),
        // Rust >= 1.73: `thread 'x' panicked at src/lib.rs:7:9:` + message on the next line.
        panic_new: Regex::new(r"^thread '([^']*)' panicked at ([^\s:']+):(\d+):(\d+):?$")
            .expect("valid panic regex"),
        // Older: `thread 'x' panicked at 'message', src/lib.rs:7:9`
        panic_old: Regex::new(r"^thread '([^']*)' panicked at '(.*)', ([^\s:]+):(\d+):(\d+)$")
            .expect("valid legacy panic regex"),
        compile_error: Regex::new(r"^error(\[E\d{4}\])?: (.+)$").expect("valid rustc regex"),
        arrow: Regex::new(r"^\s*--> ([^\s:]+):(\d+):(\d+)$").expect("valid arrow regex"),
    })
}

impl FailureMatcher for CargoTestMatcher {
    fn format(&self) -> LogFormat {
        LogFormat::CargoTest
    }

    fn try_match(&self, text: &str) -> Option<Vec<FailureRecord>> {
        let lines: Vec<&str> = text.lines().collect();

        let mut found: Vec<(usize, FailureRecord)> = compile_errors(&lines);
        found.extend(test_blocks(&lines));
        found.sort_by_key(|(idx, _)| *idx);

        let mut seen = HashSet::new();
        let records: Vec<FailureRecord> = found
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| seen.insert(record.test_identifier.clone()))
            .collect();

        if records.is_empty() {
            None
        } else {
            Some(records)
        }
    }
}

fn compile_errors(lines: &[&str]) -> Vec<(usize, FailureRecord)> {
    let p = patterns();
    let mut out = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = p.compile_error.captures(line.trim_end()) else {
            continue;
        };
        // Only diagnostics that point at a span; `error: could not compile` is a summary.
        let Some((arrow_idx, arrow)) = lines
            .iter()
            .enumerate()
            .skip(idx + 1)
            .take(3)
            .find_map(|(i, l)| p.arrow.captures(l.trim_end()).map(|c| (i, c)))
        else {
            continue;
        };

        let file = arrow[1].to_string();
        let line_number = arrow[2].parse::<u32>().ok();
        let code = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let message = format!("error{}: {}", code, caps[2].trim());

        // The rendered snippet runs until the next blank line.
        let end = lines
            .iter()
            .enumerate()
            .skip(arrow_idx + 1)
            .find(|(_, l)| l.trim().is_empty())
            .map(|(i, _)| i)
            .unwrap_or(lines.len());

        out.push((
            idx,
            FailureRecord {
                source_file: Some(PathBuf::from(&file)),
                line_number,
                test_identifier: format!("compile::{}:{}", file, arrow[2].trim()),
                error_kind: ErrorKind::Syntax,
                message,
                raw_excerpt: excerpt(lines, idx, end),
                flaky: false,
                format: LogFormat::CargoTest,
            },
        ));
    }
    out
}

fn test_blocks(lines: &[&str]) -> Vec<(usize, FailureRecord)> {
    let p = patterns();
    let starts: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| p.block.is_match(l.trim_end()))
        .map(|(i, _)| i)
        .collect();

    let mut out = Vec::new();
    for (n, &start) in starts.iter().enumerate() {
        let hard_end = starts.get(n + 1).copied().unwrap_or(lines.len());
        let end = lines
            .iter()
            .enumerate()
            .take(hard_end)
            .skip(start + 1)
            .find(|(_, l)| {
                let t = l.trim_end();
                t == "failures:" || t.starts_with("test result:")
            })
            .map(|(i, _)| i)
            .unwrap_or(hard_end);
        out.push((start, block_record(lines, start, end)));
    }
    out
}

fn block_record(lines: &[&str], start: usize, end: usize) -> FailureRecord {
    let p = patterns();
    let test_identifier = p
        .block
        .captures(lines[start].trim_end())
        .map(|c| c[1].to_string())
        .unwrap_or_default();
    let body = &lines[start + 1..end];

    let mut source_file = None;
    let mut line_number = None;
    let mut message = None;
    let mut panicked = false;

    for (i, line) in body.iter().enumerate() {
        let line = line.trim_end();
        if let Some(caps) = p.panic_old.captures(line) {
            panicked = true;
            source_file = Some(PathBuf::from(&caps[3]));
            line_number = caps[4].parse::<u32>().ok();
            message = Some(caps[2].to_string());
            break;
        }
        if let Some(caps) = p.panic_new.captures(line) {
            panicked = true;
            source_file = Some(PathBuf::from(&caps[2]));
            line_number = caps[3].parse::<u32>().ok();
            message = body[i + 1..]
                .iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty())
                .map(str::to_string);
            break;
        }
    }

    // Tests returning `Err(..)` print the error without a panic line.
    let message = message
        .or_else(|| {
            body.iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty() && !l.starts_with("note:"))
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("test {} failed", test_identifier));

    let error_kind = match ErrorKind::classify(&message) {
        ErrorKind::Unknown if panicked => ErrorKind::Exception,
        kind => kind,
    };

    FailureRecord {
        source_file,
        line_number,
        test_identifier,
        error_kind,
        message,
        raw_excerpt: excerpt(lines, start, end),
        flaky: false,
        format: LogFormat::CargoTest,
    }
}
