// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Correlation of raw runner outcomes back to parsed definitions.
//!
//! Both sides of the correlation are flattened with the same ordering
//! contract -- depth-first, left-to-right, leaf specs before child suites --
//! and then zipped positionally. The runner preserving source order across
//! retries and parallel specs is an assumption of this design, not something
//! it can verify; see [`flatten_outcomes`].
//!
//! Every degradation here becomes a structured [`TestResult`] rather than an
//! error: downstream automation always receives data to act on.

use crate::{
    coverage::CoverageData,
    definitions::{ParsedDefinitions, TestCase},
    errors::ReportExtractError,
    report::{RunnerReport, SuiteNode},
};
use chrono::Utc;
use itertools::{EitherOrBoth, Itertools};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;

/// One correlated outcome, ordered by definition order.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// The definition this outcome was matched to. Synthetic when no
    /// definition exists for the slot.
    pub test: TestCase,
    /// Derived solely from the runner's reported status for the matched
    /// entry.
    pub passed: bool,
    /// Trimmed, human-scannable excerpt of the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The untruncated message and stack.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_error: Option<String>,
    /// Populated by callers that capture their own result traces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_result: Option<Value>,
    /// Coverage attribution for the run this result came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_data: Option<CoverageData>,
}

/// Correlates one run's extraction outcome against parsed definitions.
///
/// `transcript` is the full captured diagnostic text (progress lines plus
/// stderr); it is embedded wholesale into the synthetic result when the
/// runner's output could not be used.
pub fn correlate_run(
    defs: &ParsedDefinitions,
    extracted: Result<RunnerReport, ReportExtractError>,
    transcript: &str,
) -> Vec<TestResult> {
    let report = match extracted {
        Ok(report) => report,
        Err(error) => {
            return vec![synthetic_failure(&format!("{error}\n\n{transcript}"))];
        }
    };

    if report.is_load_failure() {
        let mut detail = String::new();
        for error in &report.errors {
            if let Some(message) = &error.message {
                detail.push_str(message);
                detail.push('\n');
            }
        }
        detail.push('\n');
        detail.push_str(transcript);
        return vec![synthetic_failure(&detail)];
    }

    let outcomes = flatten_outcomes(&report);
    let flat_defs = defs.flat_tests();

    if flat_defs.is_empty() {
        // No definitions to correlate against: emit one result per runner
        // outcome under the runner's own labels.
        return outcomes
            .into_iter()
            .enumerate()
            .map(|(idx, outcome)| {
                let test = runner_labeled_test(&outcome.title, idx);
                result_for_outcome(test, outcome)
            })
            .collect();
    }

    flat_defs
        .into_iter()
        .zip_longest(outcomes)
        .enumerate()
        .map(|(idx, pair)| match pair {
            EitherOrBoth::Both(test, outcome) => result_for_outcome(test.clone(), outcome),
            EitherOrBoth::Left(test) => TestResult {
                test: test.clone(),
                passed: false,
                error: Some("runner reported no result for this test".to_owned()),
                full_error: None,
                actual_result: None,
                coverage_data: None,
            },
            EitherOrBoth::Right(outcome) => {
                let test = runner_labeled_test(&outcome.title, idx);
                result_for_outcome(test, outcome)
            }
        })
        .collect()
}

/// Produces one failed result per known definition when process execution
/// itself failed (the last-resort path). With no definitions, a single
/// synthetic result carries the message.
pub fn results_for_execution_error(defs: &ParsedDefinitions, message: &str) -> Vec<TestResult> {
    let flat_defs = defs.flat_tests();
    if flat_defs.is_empty() {
        return vec![synthetic_failure(message)];
    }
    flat_defs
        .into_iter()
        .map(|test| TestResult {
            test: test.clone(),
            passed: false,
            error: Some(message.to_owned()),
            full_error: Some(message.to_owned()),
            actual_result: None,
            coverage_data: None,
        })
        .collect()
}

/// Builds the single fabricated result representing a pipeline-level
/// failure, carrying the full diagnostic context.
pub fn synthetic_failure(detail: &str) -> TestResult {
    let detail = detail.trim();
    TestResult {
        test: TestCase {
            id: "run-diagnostics-0".to_owned(),
            feature_id: "run-diagnostics".to_owned(),
            title: "Test run".to_owned(),
            description: None,
            input: None,
            expected_result: None,
            sort_order: 0,
            created_at: Utc::now(),
        },
        passed: false,
        error: Some(detail.to_owned()),
        full_error: Some(detail.to_owned()),
        actual_result: None,
        coverage_data: None,
    }
}

fn runner_labeled_test(title: &str, idx: usize) -> TestCase {
    TestCase {
        id: format!("runner-test-{idx}"),
        feature_id: "runner".to_owned(),
        title: title.to_owned(),
        description: None,
        input: None,
        expected_result: None,
        sort_order: idx,
        created_at: Utc::now(),
    }
}

fn result_for_outcome(test: TestCase, outcome: SpecOutcome) -> TestResult {
    let passed = outcome.status.as_deref() == Some("passed");
    let full_error = match (&outcome.message, &outcome.stack) {
        (Some(message), Some(stack)) => Some(format!("{message}\n{stack}")),
        (Some(message), None) => Some(message.clone()),
        (None, Some(stack)) => Some(stack.clone()),
        (None, None) => None,
    };
    let error = outcome.message.as_deref().map(|message| {
        let condensed = condense_failure_message(message);
        if condensed.is_empty() {
            message.trim().to_owned()
        } else {
            condensed
        }
    });

    TestResult {
        test,
        passed,
        error: if passed { None } else { error },
        full_error: if passed { None } else { full_error },
        actual_result: None,
        coverage_data: None,
    }
}

/// One atomic runner outcome after flattening.
#[derive(Clone, Debug)]
pub(crate) struct SpecOutcome {
    pub(crate) title: String,
    pub(crate) status: Option<String>,
    pub(crate) message: Option<String>,
    pub(crate) stack: Option<String>,
}

/// Flattens the report's suite tree into ordered atomic outcomes.
///
/// Ordering contract (shared with
/// [`ParsedDefinitions::flat_tests`]): depth-first, left-to-right, a
/// suite's own specs before its child suites; each spec's `tests` entries
/// (retry attempts) flat-mapped in place, the final `results` entry deciding
/// status and error. Known risk: if the runner reorders specs under internal
/// parallelism, positional correlation misattributes outcomes -- nothing in
/// the report allows detecting that here.
pub(crate) fn flatten_outcomes(report: &RunnerReport) -> Vec<SpecOutcome> {
    fn visit(suite: &SuiteNode, out: &mut Vec<SpecOutcome>) {
        for spec in &suite.specs {
            if spec.tests.is_empty() {
                out.push(SpecOutcome {
                    title: spec.title.clone(),
                    status: None,
                    message: None,
                    stack: None,
                });
                continue;
            }
            for test in &spec.tests {
                let last = test.results.last();
                out.push(SpecOutcome {
                    title: spec.title.clone(),
                    status: last.map(|r| r.status.clone()),
                    message: last.and_then(|r| r.error.as_ref()).and_then(|e| e.message.clone()),
                    stack: last.and_then(|r| r.error.as_ref()).and_then(|e| e.stack.clone()),
                });
            }
        }
        for child in &suite.suites {
            visit(child, out);
        }
    }

    let mut out = Vec::new();
    for suite in &report.suites {
        visit(suite, &mut out);
    }
    out
}

static SOURCE_CONTEXT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*>?\s*\d+\s*\|").expect("source context regex is valid")
});

static STACK_FRAME_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+at\s").expect("stack frame regex is valid"));

static CARET_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\|?\s*\^+\s*$").expect("caret regex is valid"));

static ERROR_MARKER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]*Error\b").expect("error marker regex is valid"));

/// Reduces a raw multi-line failure message to its human-scannable core.
///
/// Dropped: blank lines, source-context/line-number decorations, stack
/// frames, caret underlines. Kept: error-marker lines (plus the immediately
/// following custom-message line when it is not an `Expected:`/`Received:`
/// line), `Expected:`/`Received:` lines, and lines containing an assertion
/// call.
pub fn condense_failure_message(raw: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut after_error_marker = false;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if SOURCE_CONTEXT_LINE.is_match(line)
            || STACK_FRAME_LINE.is_match(line)
            || CARET_LINE.is_match(line)
        {
            continue;
        }

        if ERROR_MARKER_LINE.is_match(trimmed) {
            kept.push(trimmed);
            after_error_marker = true;
            continue;
        }
        if trimmed.starts_with("Expected:") || trimmed.starts_with("Received:") {
            kept.push(trimmed);
            after_error_marker = false;
            continue;
        }
        if trimmed.contains("expect(") {
            kept.push(trimmed);
            after_error_marker = false;
            continue;
        }
        if after_error_marker {
            // The custom message the author attached to the assertion.
            kept.push(trimmed);
            after_error_marker = false;
        }
    }

    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{definitions::parse_definitions, report::extract_report};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn report_from(json: &str) -> RunnerReport {
        extract_report(&format!("\n{json}")).expect("test report parses")
    }

    fn defs_with_titles(titles: &[&[&str]]) -> ParsedDefinitions {
        use std::fmt::Write;

        let mut source = String::from("describe('Outer', () => {\n");
        for (i, tests) in titles.iter().enumerate() {
            writeln!(source, "describe('Feature {i}', () => {{").unwrap();
            for title in *tests {
                writeln!(source, "test('{title}', () => {{}});").unwrap();
            }
            source.push_str("});\n");
        }
        source.push_str("});\n");
        parse_definitions(&source, Some("n1"))
    }

    #[test]
    fn flatten_follows_the_ordering_contract() {
        let report = report_from(indoc! {r#"
            {"suites": [{"title": "file.spec.ts",
              "specs": [{"title": "top-level", "tests": [{"results": [{"status": "passed"}]}]}],
              "suites": [
                {"title": "A", "specs": [
                  {"title": "a1", "tests": [{"results": [{"status": "passed"}]}]},
                  {"title": "a2", "tests": [{"results": [{"status": "failed"}]}]}
                ]},
                {"title": "B", "suites": [{"title": "B inner", "specs": [
                  {"title": "b1", "tests": [{"results": [{"status": "passed"}]}]}
                ]}]}
              ]}]}
        "#});

        let titles: Vec<_> = flatten_outcomes(&report)
            .into_iter()
            .map(|o| o.title)
            .collect();
        assert_eq!(titles, vec!["top-level", "a1", "a2", "b1"]);
    }

    #[test]
    fn retry_attempts_flat_map_and_last_result_wins() {
        let report = report_from(indoc! {r#"
            {"suites": [{"title": "s", "specs": [
              {"title": "flaky", "tests": [
                {"results": [{"status": "failed", "error": {"message": "first"}},
                             {"status": "passed"}]}
              ]}
            ]}]}
        "#});

        let outcomes = flatten_outcomes(&report);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status.as_deref(), Some("passed"));
        assert_eq!(outcomes[0].message, None);
    }

    #[test]
    fn positional_zip_matches_definition_order() {
        let defs = defs_with_titles(&[&["a", "b"], &["c"]]);
        let report = report_from(indoc! {r#"
            {"suites": [{"title": "file", "suites": [
              {"title": "Feature 0", "specs": [
                {"title": "a", "tests": [{"results": [{"status": "passed"}]}]},
                {"title": "b", "tests": [{"results": [{"status": "failed",
                  "error": {"message": "Error: expect(received).toBe(expected)"}}]}]}
              ]},
              {"title": "Feature 1", "specs": [
                {"title": "c", "tests": [{"results": [{"status": "passed"}]}]}
              ]}
            ]}]}
        "#});

        let results = correlate_run(&defs, Ok(report), "");
        let summary: Vec<_> = results
            .iter()
            .map(|r| (r.test.title.as_str(), r.passed))
            .collect();
        assert_eq!(summary, vec![("a", true), ("b", false), ("c", true)]);
        // Results follow definition ordering, so ids come from the parse.
        assert_eq!(results[0].test.id, "n1-feature-0-test-0");
        assert!(results[1].error.as_deref().unwrap().contains("expect("));
    }

    #[test]
    fn no_definitions_falls_back_to_runner_titles() {
        let defs = ParsedDefinitions::default();
        let report = report_from(
            r#"{"suites": [{"title": "s", "specs": [
                {"title": "from runner", "tests": [{"results": [{"status": "passed"}]}]}
            ]}]}"#,
        );

        let results = correlate_run(&defs, Ok(report), "");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].test.title, "from runner");
        assert!(results[0].passed);
    }

    #[test]
    fn definition_without_outcome_fails_explicitly() {
        let defs = defs_with_titles(&[&["a", "b"]]);
        let report = report_from(
            r#"{"suites": [{"title": "s", "specs": [
                {"title": "a", "tests": [{"results": [{"status": "passed"}]}]}
            ]}]}"#,
        );

        let results = correlate_run(&defs, Ok(report), "");
        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert_eq!(
            results[1].error.as_deref(),
            Some("runner reported no result for this test")
        );
    }

    #[test]
    fn extra_outcome_is_appended_under_runner_label() {
        let defs = defs_with_titles(&[&["a"]]);
        let report = report_from(
            r#"{"suites": [{"title": "s", "specs": [
                {"title": "a", "tests": [{"results": [{"status": "passed"}]}]},
                {"title": "unexpected", "tests": [{"results": [{"status": "failed"}]}]}
            ]}]}"#,
        );

        let results = correlate_run(&defs, Ok(report), "");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].test.title, "unexpected");
        assert_eq!(results[1].test.feature_id, "runner");
    }

    #[test]
    fn load_failure_becomes_one_synthetic_result() {
        let defs = defs_with_titles(&[&["a"]]);
        let report = report_from(r#"{"suites": [], "errors": [{"message": "SyntaxError: oops"}]}"#);

        let results = correlate_run(&defs, Ok(report), "transcript line\nstderr line");
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
        let error = results[0].error.as_deref().unwrap();
        assert!(error.contains("SyntaxError"));
        assert!(error.contains("transcript line"));
    }

    #[test]
    fn extraction_failure_embeds_the_transcript() {
        let defs = ParsedDefinitions::default();
        let results = correlate_run(
            &defs,
            Err(crate::errors::ReportExtractError::NoJsonDocument),
            "progress output\nmore output",
        );
        assert_eq!(results.len(), 1);
        let error = results[0].error.as_deref().unwrap();
        assert!(error.contains("no embedded JSON document"));
        assert!(error.contains("progress output"));
    }

    #[test]
    fn execution_error_marks_every_known_test_failed() {
        let defs = defs_with_titles(&[&["a", "b"]]);
        let results = results_for_execution_error(&defs, "spawn failed: ENOENT");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.passed));
        assert!(
            results
                .iter()
                .all(|r| r.error.as_deref() == Some("spawn failed: ENOENT"))
        );
    }

    #[test]
    fn condense_keeps_the_scannable_core() {
        let raw = indoc! {r#"
            Error: expect(received).toBe(expected) // Object.is equality

            Expected: true
            Received: false

               5 |   const expectedResult = {ok:true};
            >  6 |   expect(res.ok).toBe(expectedResult.ok);
                 |                  ^
               7 | });

                at /repo/tests/auth.spec.ts:6:20
                at runTest (/deps/runner.js:100:5)
        "#};

        let condensed = condense_failure_message(raw);
        assert_eq!(
            condensed,
            indoc! {"
                Error: expect(received).toBe(expected) // Object.is equality
                Expected: true
                Received: false"}
            .trim_end()
        );
    }

    #[test]
    fn condense_keeps_custom_message_after_marker() {
        let raw = "Error: assertion failed\nlogin should have succeeded\n\n    at x.js:1:1";
        assert_eq!(
            condense_failure_message(raw),
            "Error: assertion failed\nlogin should have succeeded"
        );
    }

    #[test]
    fn condense_empty_falls_back_upstream() {
        // Decoration-only input condenses to nothing; result_for_outcome
        // then falls back to the raw trimmed message.
        assert_eq!(condense_failure_message("   \n  at foo.js:1:1\n"), "");
    }
}
