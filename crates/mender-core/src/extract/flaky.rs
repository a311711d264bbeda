//! Flaky indicators: evidence in the same log that a failing test also
//! passed or was re-run.

use crate::failure::FailureRecord;
use regex::Regex;
use std::sync::OnceLock;

/// Outcome words that mean "this test ran again" or "this test passed".
const OUTCOME_MARKERS: &[&str] = &["RERUN", "PASSED", "PASS", "FLAKY"];

fn libtest_ok_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^test (\S+) \.\.\. ok$").expect("valid libtest regex"))
}

pub(super) fn flag_flaky(text: &str, records: &mut [FailureRecord]) {
    let evidence = outcome_identifiers(text);
    if evidence.is_empty() {
        return;
    }
    for record in records.iter_mut() {
        let hit = evidence
            .iter()
            .any(|id| same_test(id, &record.test_identifier));
        if hit {
            tracing::debug!(test = %record.test_identifier, "flaky indicator found");
            record.flaky = true;
        }
    }
}

/// Test identifiers that appear next to a pass or re-run outcome.
fn outcome_identifiers(text: &str) -> Vec<&str> {
    let mut ids = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(caps) = libtest_ok_regex().captures(line) {
            if let Some(id) = caps.get(1) {
                ids.push(id.as_str());
            }
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if !tokens.iter().any(|t| is_outcome_marker(t)) {
            continue;
        }
        // Ids keep their brackets: `test_x[1]` is a parametrized case.
        ids.extend(
            tokens
                .into_iter()
                .filter(|t| !is_outcome_marker(t))
                .filter(|t| looks_like_test_id(t)),
        );
    }
    ids
}

/// Identical ids, or one is the other minus its leading `path::` qualifiers.
/// Parametrized cases and same-named tests in other files never match.
fn same_test(evidence: &str, failed: &str) -> bool {
    evidence == failed || qualifies(evidence, failed) || qualifies(failed, evidence)
}

fn qualifies(full: &str, bare: &str) -> bool {
    !bare.is_empty()
        && full
            .strip_suffix(bare)
            .is_some_and(|prefix| prefix.ends_with("::"))
}

/// `PASSED`, or a bracketed form such as `[PASS]`.
fn is_outcome_marker(token: &str) -> bool {
    OUTCOME_MARKERS.contains(&token.trim_matches(|c| c == '[' || c == ']'))
}

fn looks_like_test_id(token: &str) -> bool {
    token.contains("::") || token.starts_with("test")
}

#[cfg(test)]
mod tests {
    use crate::extract::extract;

    const FLAKY_LOG: &str = "\
============================= test session starts ==============================
collected 2 items

tests/test_net.py::test_ping PASSED                                       [ 50%]
tests/test_net.py::test_intermittent FAILED                               [100%]

=================================== FAILURES ===================================
______________________________ test_intermittent _______________________________

    def test_intermittent():
>       assert fetch_status() == 200
E       assert 503 == 200

tests/test_net.py:21: AssertionError
=========================== short test summary info ============================
FAILED tests/test_net.py::test_intermittent - assert 503 == 200
========================= 1 failed, 1 passed in 0.40s ==========================
Re-running failed tests (attempt 2/2)
tests/test_net.py::test_intermittent PASSED                               [100%]
============================== 1 passed in 0.12s ===============================
";

    #[test]
    fn test_fail_then_pass_is_flaky() {
        let records = extract(FLAKY_LOG.as_bytes(), None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].test_identifier, "tests/test_net.py::test_intermittent");
        assert!(records[0].flaky);
    }

    #[test]
    fn test_rerun_marker_is_flaky() {
        let log = FLAKY_LOG.replace(
            "tests/test_net.py::test_intermittent PASSED",
            "tests/test_net.py::test_intermittent RERUN",
        );
        let records = extract(log.as_bytes(), None).unwrap();
        assert!(records[0].flaky);
    }

    #[test]
    fn test_other_test_passing_is_not_evidence() {
        let log = FLAKY_LOG.replace(
            "tests/test_net.py::test_intermittent PASSED",
            "tests/test_net.py::test_other PASSED",
        );
        let records = extract(log.as_bytes(), None).unwrap();
        assert!(!records[0].flaky);
    }

    #[test]
    fn test_other_parametrized_case_passing_is_not_evidence() {
        let log = "\
tests/test_p.py::test_x[1] PASSED                                         [ 50%]
tests/test_p.py::test_x[2] FAILED                                         [100%]

=================================== FAILURES ===================================
_________________________________ test_x[2] __________________________________

    def test_x(n):
>       assert n == 1
E       assert 2 == 1

tests/test_p.py:5: AssertionError
=========================== short test summary info ============================
FAILED tests/test_p.py::test_x[2] - assert 2 == 1
";
        let records = extract(log.as_bytes(), None).unwrap();
        assert_eq!(records[0].test_identifier, "tests/test_p.py::test_x[2]");
        assert!(!records[0].flaky);
    }

    #[test]
    fn test_same_name_in_another_file_is_not_evidence() {
        let log = FLAKY_LOG.replace(
            "tests/test_net.py::test_intermittent PASSED",
            "tests/test_dns.py::test_intermittent PASSED",
        );
        let records = extract(log.as_bytes(), None).unwrap();
        assert!(!records[0].flaky);
    }

    #[test]
    fn test_identifier_matching() {
        assert!(super::same_test("tests::racy", "tests::racy"));
        assert!(super::same_test("test_a", "tests/test_m.py::test_a"));
        assert!(!super::same_test("test_a", "tests/test_m.py::test_a[1]"));
        assert!(!super::same_test("st_a", "tests/test_m.py::test_a"));
        assert!(!super::same_test("a.py::test_a", "b.py::test_a"));
    }

    #[test]
    fn test_libtest_ok_after_failure_is_flaky() {
        let log = "\
---- tests::racy stdout ----
thread 'tests::racy' panicked at src/lib.rs:3:5:
timed out waiting for lock

test result: FAILED. 0 passed; 1 failed
test tests::racy ... ok
";
        let records = extract(log.as_bytes(), None).unwrap();
        assert!(records[0].flaky);
    }
}
