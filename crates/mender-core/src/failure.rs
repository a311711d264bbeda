//! Structured failure facts extracted from build output.

use crate::util::hash_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Classification of a detected failure.
///
/// `Unknown` is used whenever the extractor cannot classify confidently;
/// it is never a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Assertion,
    Exception,
    Timeout,
    Syntax,
    Unknown,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Assertion => "assertion",
            ErrorKind::Exception => "exception",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Classify from an exception type name, panic message, or error line.
    pub fn classify(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return ErrorKind::Unknown;
        }
        let lower = trimmed.to_ascii_lowercase();

        if lower.contains("assertionerror")
            || lower.starts_with("assert ")
            || lower.starts_with("assert(")
            || lower.contains("assertion failed")
            || lower.contains("assertion `left")
            || lower.contains("assertion left")
        {
            return ErrorKind::Assertion;
        }
        if lower.contains("syntaxerror")
            || lower.contains("indentationerror")
            || lower.contains("taberror")
            || lower.starts_with("error[e")
        {
            return ErrorKind::Syntax;
        }
        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorKind::Timeout;
        }
        // pytest's own outcome: `pytest.fail(..)`, `pytest.raises` that did not raise.
        if trimmed == "Failed"
            || trimmed.starts_with("Failed:")
            || lower.contains("did not raise")
        {
            return ErrorKind::Assertion;
        }
        if lower.contains("panicked at") || looks_like_exception_name(trimmed) {
            return ErrorKind::Exception;
        }
        ErrorKind::Unknown
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Assertion => "Assertion",
            ErrorKind::Exception => "Exception",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Syntax => "Syntax",
            ErrorKind::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// `ValueError`, `java.lang.IllegalStateException: boom`, `KeyError('x')`...
fn looks_like_exception_name(text: &str) -> bool {
    let head = text
        .split(|c: char| c == ':' || c == '(' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    let name = head.rsplit('.').next().unwrap_or(head);
    let starts_upper = name.chars().next().is_some_and(|c| c.is_ascii_uppercase());
    starts_upper
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && (name.ends_with("Error") || name.ends_with("Exception"))
}

/// The test-report format a record was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogFormat {
    Pytest,
    CargoTest,
    Traceback,
    Unstructured,
}

impl LogFormat {
    pub fn label(&self) -> &'static str {
        match self {
            LogFormat::Pytest => "pytest",
            LogFormat::CargoTest => "cargo test",
            LogFormat::Traceback => "traceback",
            LogFormat::Unstructured => "unstructured",
        }
    }
}

/// Caller-supplied hint naming the matcher to try first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatHint {
    Pytest,
    CargoTest,
    Traceback,
}

impl FormatHint {
    pub fn format(&self) -> LogFormat {
        match self {
            FormatHint::Pytest => LogFormat::Pytest,
            FormatHint::CargoTest => LogFormat::CargoTest,
            FormatHint::Traceback => LogFormat::Traceback,
        }
    }
}

/// One detected failure unit. Immutable once extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Repository-relative source file, when the extractor could localize it.
    pub source_file: Option<PathBuf>,
    pub line_number: Option<u32>,
    /// Framework-qualified name (`tests/test_main.py::test_add`) or a
    /// synthetic identifier when none is available.
    pub test_identifier: String,
    pub error_kind: ErrorKind,
    pub message: String,
    /// Verbatim log snippet used as diagnosis context. Never empty.
    pub raw_excerpt: String,
    /// Advisory: the same log shows evidence this failure is non-deterministic.
    #[serde(default)]
    pub flaky: bool,
    pub format: LogFormat,
}

impl FailureRecord {
    /// Short test name: the last `::` segment of the identifier.
    pub fn short_name(&self) -> &str {
        short_test_name(&self.test_identifier)
    }

    /// Stable signature of this failure, used to derive deterministic branch names.
    pub fn signature(&self) -> String {
        let file = self
            .source_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let digest = hash_str(&format!(
            "{}|{}|{}",
            self.test_identifier,
            self.error_kind.label(),
            file
        ));
        digest[..8].to_string()
    }
}

pub fn short_test_name(identifier: &str) -> &str {
    let name = identifier.rsplit("::").next().unwrap_or(identifier);
    // pytest parametrization: test_x[case-1]
    name.split('[').next().unwrap_or(name)
}
