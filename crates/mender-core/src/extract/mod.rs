//! Failure Extractor: raw build output in, structured failure records out.
//!
//! Matchers run in priority order and the first one that yields at least one
//! record wins; results are never merged across matchers. When nothing
//! matches, a single synthetic `Unknown` record carrying the log tail is
//! returned so the pipeline always has something to diagnose.

mod cargo;
mod flaky;
mod pytest;
mod traceback;

use crate::failure::{ErrorKind, FailureRecord, FormatHint, LogFormat};
use crate::util::{tail_chars, truncate};
use regex::Regex;
use std::sync::OnceLock;

pub use cargo::CargoTestMatcher;
pub use pytest::PytestMatcher;
pub use traceback::TracebackMatcher;

/// Bounded tail of the log used for the synthetic fallback record.
pub const FALLBACK_TAIL_CHARS: usize = 2000;
/// Upper bound for any single record's `raw_excerpt`.
pub const MAX_EXCERPT_CHARS: usize = 4000;

pub const SYNTHETIC_TEST_IDENTIFIER: &str = "unclassified-failure";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("build log is empty")]
    Empty,
    #[error("build log is not decodable as text: {0}")]
    NotText(String),
}

/// One format-specific matcher.
pub trait FailureMatcher {
    fn format(&self) -> LogFormat;

    /// `None` (or an empty vector) when the text contains nothing this
    /// matcher recognizes.
    fn try_match(&self, text: &str) -> Option<Vec<FailureRecord>>;
}

fn default_matchers() -> Vec<Box<dyn FailureMatcher>> {
    vec![
        Box::new(PytestMatcher),
        Box::new(CargoTestMatcher),
        Box::new(TracebackMatcher),
    ]
}

/// Extract failure records from raw log bytes.
///
/// Fails only when the input is empty or not text; unrecognized content
/// falls back to a synthetic record instead.
pub fn extract(
    raw_log: &[u8],
    format_hint: Option<FormatHint>,
) -> Result<Vec<FailureRecord>, ExtractionError> {
    let text = std::str::from_utf8(raw_log).map_err(|e| ExtractionError::NotText(e.to_string()))?;
    if text.contains('\0') {
        return Err(ExtractionError::NotText(
            "input contains NUL bytes".to_string(),
        ));
    }
    if text.trim().is_empty() {
        return Err(ExtractionError::Empty);
    }

    let normalized = normalize_log(text);
    let mut matchers = default_matchers();
    if let Some(hint) = format_hint {
        // Stable sort keeps the remaining matchers in default order.
        matchers.sort_by_key(|m| m.format() != hint.format());
    }

    for matcher in &matchers {
        match matcher.try_match(&normalized) {
            Some(mut records) if !records.is_empty() => {
                tracing::debug!(
                    format = matcher.format().label(),
                    count = records.len(),
                    "failure matcher produced records"
                );
                for record in &mut records {
                    if record.raw_excerpt.trim().is_empty() {
                        record.raw_excerpt = record.message.clone();
                    }
                    if record.raw_excerpt.trim().is_empty() {
                        record.raw_excerpt =
                            tail_chars(&normalized, FALLBACK_TAIL_CHARS).to_string();
                    }
                    record.raw_excerpt = truncate(&record.raw_excerpt, MAX_EXCERPT_CHARS);
                }
                flaky::flag_flaky(&normalized, &mut records);
                return Ok(records);
            }
            _ => continue,
        }
    }

    tracing::debug!("no failure matcher recognized the log; using synthetic record");
    Ok(vec![synthetic_record(&normalized)])
}

fn synthetic_record(text: &str) -> FailureRecord {
    let tail = tail_chars(text.trim_end(), FALLBACK_TAIL_CHARS);
    let message = tail
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| truncate(line, 200))
        .unwrap_or_else(|| "No recognizable failure block found".to_string());

    FailureRecord {
        source_file: None,
        line_number: None,
        test_identifier: SYNTHETIC_TEST_IDENTIFIER.to_string(),
        error_kind: ErrorKind::Unknown,
        message,
        raw_excerpt: tail.to_string(),
        flaky: false,
        format: LogFormat::Unstructured,
    }
}

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").expect("valid ANSI regex")
    })
}

fn ci_timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z ")
            .expect("valid timestamp regex")
    })
}

/// Strip ANSI escapes, CI timestamp prefixes and carriage returns.
pub fn normalize_log(text: &str) -> String {
    let without_ansi = ansi_regex().replace_all(text, "");
    let without_stamps = ci_timestamp_regex().replace_all(&without_ansi, "");
    without_stamps.replace("\r\n", "\n").replace('\r', "\n")
}

/// Join the lines `[start, end)` of `lines` into an excerpt.
pub(crate) fn excerpt(lines: &[&str], start: usize, end: usize) -> String {
    let end = end.min(lines.len());
    if start >= end {
        return String::new();
    }
    lines[start..end].join("\n").trim_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const PYTEST_LOG: &str = "\
============================= test session starts ==============================
collected 3 items

tests/test_main.py ..F                                                   [100%]

=================================== FAILURES ===================================
_______________________________ test_add_numbers _______________________________

    def test_add_numbers():
>       assert add(2, 2) == 5
E       assert 4 == 5
E        +  where 4 = add(2, 2)

tests/test_main.py:12: AssertionError
=========================== short test summary info ============================
FAILED tests/test_main.py::test_add_numbers - assert 4 == 5
========================= 1 failed, 2 passed in 0.10s ==========================
";

    #[test]
    fn test_extract_rejects_empty_input() {
        assert_eq!(extract(b"", None), Err(ExtractionError::Empty));
        assert_eq!(extract(b"  \n\t\n", None), Err(ExtractionError::Empty));
    }

    #[test]
    fn test_extract_rejects_non_text() {
        let err = extract(&[0xff, 0xfe, 0x00, 0x41], None).unwrap_err();
        assert!(matches!(err, ExtractionError::NotText(_)));
        let err = extract(b"abc\0def", None).unwrap_err();
        assert!(matches!(err, ExtractionError::NotText(_)));
    }

    #[test]
    fn test_extract_pytest_assertion() {
        let records = extract(PYTEST_LOG.as_bytes(), None).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.error_kind, ErrorKind::Assertion);
        assert_eq!(record.test_identifier, "tests/test_main.py::test_add_numbers");
        assert_eq!(record.source_file, Some(PathBuf::from("tests/test_main.py")));
        assert_eq!(record.line_number, Some(12));
        assert_eq!(record.message, "assert 4 == 5");
        assert!(!record.raw_excerpt.is_empty());
        assert!(!record.flaky);
    }

    #[test]
    fn test_extract_unrecognized_returns_single_synthetic_record() {
        let log = "Step 1/4 : FROM python:3.11\nsomething odd happened\nProcess exited with code 1\n";
        let records = extract(log.as_bytes(), None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_kind, ErrorKind::Unknown);
        assert_eq!(records[0].test_identifier, SYNTHETIC_TEST_IDENTIFIER);
        assert_eq!(records[0].message, "Process exited with code 1");
        assert!(records[0].raw_excerpt.contains("something odd happened"));
        assert_eq!(records[0].format, LogFormat::Unstructured);
    }

    #[test]
    fn test_synthetic_excerpt_is_bounded_tail() {
        let mut log = String::new();
        for i in 0..2000 {
            log.push_str(&format!("noise line {}\n", i));
        }
        let records = extract(log.as_bytes(), None).unwrap();
        let excerpt = &records[0].raw_excerpt;
        assert!(excerpt.chars().count() <= FALLBACK_TAIL_CHARS);
        assert!(excerpt.ends_with("noise line 1999"));
    }

    #[test]
    fn test_extract_strips_ansi_and_timestamps() {
        let colored = PYTEST_LOG
            .lines()
            .map(|line| format!("2024-05-01T10:00:00.1234567Z \x1b[31m{}\x1b[0m", line))
            .collect::<Vec<_>>()
            .join("\n");
        let records = extract(colored.as_bytes(), None).unwrap();
        assert_eq!(records[0].error_kind, ErrorKind::Assertion);
        assert_eq!(records[0].line_number, Some(12));
    }

    #[test]
    fn test_format_hint_reorders_matchers() {
        // Both a libtest block and a Python traceback: the hint decides which wins.
        let log = "\
---- tests::parses stdout ----
thread 'tests::parses' panicked at src/lib.rs:7:9:
assertion `left == right` failed
  left: 1
 right: 2

Traceback (most recent call last):
  File \"scripts/gen.py\", line 3, in <module>
    main()
ValueError: bad input
";
        let default = extract(log.as_bytes(), None).unwrap();
        assert_eq!(default[0].format, LogFormat::CargoTest);

        let hinted = extract(log.as_bytes(), Some(FormatHint::Traceback)).unwrap();
        assert_eq!(hinted[0].format, LogFormat::Traceback);
        assert_eq!(hinted[0].error_kind, ErrorKind::Exception);
    }

    #[test]
    fn test_extract_is_deterministic() {
        let a = extract(PYTEST_LOG.as_bytes(), None).unwrap();
        let b = extract(PYTEST_LOG.as_bytes(), None).unwrap();
        assert_eq!(a, b);
    }
}
