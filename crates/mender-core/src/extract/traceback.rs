use super::{excerpt, FailureMatcher};
use crate::failure::{ErrorKind, FailureRecord, LogFormat};
use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Generic stack traces: Python tracebacks and JVM/JS `at frame(file:line)` stacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracebackMatcher;

const PY_HEADER: &str = "Traceback (most recent call last):";

struct Patterns {
    py_frame: Regex,
    py_exception: Regex,
    stack_header: Regex,
    jvm_frame: Regex,
    js_frame: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        py_frame: Regex::new(r#"^\s*File "([^"]+)", line (\d+)(?:, in (\S+))?"#)
            .expect("valid frame regex"),
        py_exception: Regex::new(r"^([A-Za-z_][\w.]*)(?::\s*(.*))?$")
            .expect("valid exception regex"),
        stack_header: Regex::new(
            r#"^(?:Exception in thread "[^"]*" |Caused by: |Uncaught )?([A-Za-z_$][\w$.]*(?:Error|Exception|Failure)\w*)(?::\s*(.*))?$"#,
        )
        .expect("valid stack header regex"),
        jvm_frame: Regex::new(r"^\s+at ([\w$.<>]+)\(([\w$]+\.(?:java|kt|scala|groovy)):(\d+)\)")
            .expect("valid JVM frame regex"),
        js_frame: Regex::new(
            r"^\s+at (?:(\S+) \()?([^\s()]+\.(?:js|mjs|cjs|ts|tsx)):(\d+):(\d+)\)?$",
        )
            .expect("valid JS frame regex"),
    })
}

impl FailureMatcher for TracebackMatcher {
    fn format(&self) -> LogFormat {
        LogFormat::Traceback
    }

    fn try_match(&self, text: &str) -> Option<Vec<FailureRecord>> {
        let lines: Vec<&str> = text.lines().collect();

        let mut found = python_tracebacks(&lines);
        if found.is_empty() {
            found = stack_traces(&lines);
        }

        let mut seen = HashSet::new();
        let records: Vec<FailureRecord> = found
            .into_iter()
            .filter(|r| seen.insert((r.test_identifier.clone(), r.message.clone())))
            .collect();

        if records.is_empty() {
            None
        } else {
            Some(records)
        }
    }
}

struct PyFrame {
    file: String,
    line: Option<u32>,
    function: Option<String>,
}

impl PyFrame {
    /// Frames inside installed packages or the interpreter are not fixable.
    fn is_project_frame(&self) -> bool {
        !self.file.contains("site-packages")
            && !self.file.contains("dist-packages")
            && !self.file.starts_with('<')
            && !self.file.starts_with("/usr/lib")
    }
}

fn python_tracebacks(lines: &[&str]) -> Vec<FailureRecord> {
    let p = patterns();
    let mut out: Vec<FailureRecord> = Vec::new();
    let mut chained = false;
    let mut idx = 0;

    while idx < lines.len() {
        let trimmed = lines[idx].trim();
        if trimmed.starts_with("During handling of the above exception")
            || trimmed.starts_with("The above exception was the direct cause")
        {
            chained = true;
        }
        if trimmed != PY_HEADER {
            idx += 1;
            continue;
        }

        let start = idx;
        let mut frames = Vec::new();
        let mut exception_line = None;
        idx += 1;
        while idx < lines.len() {
            let line = lines[idx].trim_end();
            if let Some(caps) = p.py_frame.captures(line) {
                frames.push(PyFrame {
                    file: caps[1].to_string(),
                    line: caps[2].parse::<u32>().ok(),
                    function: caps.get(3).map(|m| m.as_str().to_string()),
                });
            } else if !line.is_empty() && !line.starts_with(char::is_whitespace) {
                exception_line = Some(line.trim().to_string());
                idx += 1;
                break;
            }
            idx += 1;
        }

        let Some(exception) = exception_line else {
            continue;
        };
        let frame = frames
            .iter()
            .rev()
            .find(|f| f.is_project_frame())
            .or_else(|| frames.last());

        let error_kind = match ErrorKind::classify(&exception) {
            ErrorKind::Unknown if p.py_exception.is_match(&exception) => ErrorKind::Exception,
            kind => kind,
        };
        let test_identifier = match frame {
            Some(f) => format!(
                "{}::{}",
                f.file,
                f.function.as_deref().unwrap_or("<module>")
            ),
            None => "traceback".to_string(),
        };

        let record = FailureRecord {
            source_file: frame.map(|f| PathBuf::from(&f.file)),
            line_number: frame.and_then(|f| f.line),
            test_identifier,
            error_kind,
            message: exception,
            raw_excerpt: excerpt(lines, start, idx),
            flaky: false,
            format: LogFormat::Traceback,
        };

        // A chained traceback replaces the one it was raised while handling.
        if chained && !out.is_empty() {
            out.pop();
        }
        chained = false;
        out.push(record);
    }
    out
}

fn stack_traces(lines: &[&str]) -> Vec<FailureRecord> {
    let p = patterns();
    let mut out = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        let Some(caps) = p.stack_header.captures(line.trim_end()) else {
            continue;
        };
        let frames_end = lines
            .iter()
            .enumerate()
            .skip(idx + 1)
            .find(|(_, l)| !l.trim_start().starts_with("at ") && !l.trim_start().starts_with("..."))
            .map(|(i, _)| i)
            .unwrap_or(lines.len());
        if frames_end == idx + 1 {
            continue;
        }

        // Top frame is where the exception was thrown.
        let top = lines[idx + 1..frames_end].iter().find_map(|frame| {
            if let Some(c) = p.jvm_frame.captures(frame) {
                return Some((c[1].to_string(), c[2].to_string(), c[3].parse::<u32>().ok()));
            }
            p.js_frame.captures(frame).map(|c| {
                let function = c
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| "<anonymous>".to_string());
                (function, c[2].to_string(), c[3].parse::<u32>().ok())
            })
        });
        let Some((function, file, line_number)) = top else {
            continue;
        };

        let message = line.trim().to_string();
        let error_kind = match ErrorKind::classify(&caps[1]) {
            ErrorKind::Unknown => ErrorKind::classify(&message),
            kind => kind,
        };
        let error_kind = match error_kind {
            ErrorKind::Unknown => ErrorKind::Exception,
            kind => kind,
        };

        out.push(FailureRecord {
            source_file: Some(PathBuf::from(file)),
            line_number,
            test_identifier: function,
            error_kind,
            message,
            raw_excerpt: excerpt(lines, idx, frames_end),
            flaky: false,
            format: LogFormat::Traceback,
        });
    }
    out
}
