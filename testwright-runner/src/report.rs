// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The runner's JSON report: isolation from interleaved stdout, and the
//! serde model of its nested suite tree.
//!
//! The runner is invoked with two reporters at once, so its stdout carries a
//! human-readable progress transcript with exactly one embedded JSON
//! document. [`extract_report`] isolates that document: its start is the
//! first newline immediately followed by `{`, its end is the last `}` in the
//! stream. Extraction is total -- any failure is a structured error the
//! correlator turns into a synthetic result, never a panic.

use crate::errors::ReportExtractError;
use serde::Deserialize;

/// Top-level document emitted by the runner's JSON reporter.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerReport {
    /// Arbitrarily nested suite nodes: file, then grouping levels.
    #[serde(default)]
    pub suites: Vec<SuiteNode>,
    /// Load-time failures: the runner could not even load the test file.
    #[serde(default)]
    pub errors: Vec<RunnerError>,
}

impl RunnerReport {
    /// True if the runner reported load-time errors and produced no suite
    /// data at all -- e.g. a syntax or import error in the test file.
    pub fn is_load_failure(&self) -> bool {
        !self.errors.is_empty() && self.suites.is_empty()
    }
}

/// One suite (grouping) node. Suites nest to arbitrary depth.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteNode {
    /// Suite label, e.g. a file name or a grouping title.
    #[serde(default)]
    pub title: String,
    /// Child grouping nodes.
    #[serde(default)]
    pub suites: Vec<SuiteNode>,
    /// Leaf specs owned directly by this suite.
    #[serde(default)]
    pub specs: Vec<SpecNode>,
}

/// A leaf spec: an atomic test identity, as opposed to a grouping node.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecNode {
    /// The spec's own label.
    #[serde(default)]
    pub title: String,
    /// One entry per execution of this spec (retry attempts).
    #[serde(default)]
    pub tests: Vec<SpecTest>,
}

/// One execution of a spec, carrying its per-attempt results.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecTest {
    /// Per-attempt results; the final entry is the attempt that counts.
    #[serde(default)]
    pub results: Vec<SpecResult>,
}

/// One attempt's outcome.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecResult {
    /// The runner's reported status for this attempt.
    #[serde(default)]
    pub status: String,
    /// Error detail, present on failed attempts.
    pub error: Option<SpecError>,
}

/// Error detail attached to a failed attempt.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecError {
    /// The failure message.
    pub message: Option<String>,
    /// The failure stack trace.
    pub stack: Option<String>,
}

/// A load-time error reported at the top level of the document.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerError {
    /// The load error message.
    pub message: Option<String>,
    /// The load error stack trace.
    pub stack: Option<String>,
}

/// Isolates and parses the single JSON document embedded in `raw_stdout`.
pub fn extract_report(raw_stdout: &str) -> Result<RunnerReport, ReportExtractError> {
    let document = isolate_json_document(raw_stdout).ok_or(ReportExtractError::NoJsonDocument)?;
    serde_json::from_str(document).map_err(ReportExtractError::Parse)
}

/// Finds the document substring: first `\n{` through the last `}`.
fn isolate_json_document(raw_stdout: &str) -> Option<&str> {
    let start = raw_stdout.find("\n{")? + 1;
    let end = raw_stdout.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw_stdout[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn extracts_document_from_interleaved_output() {
        let stdout = indoc! {r#"
            Running 2 tests using 1 worker

              ok 1 auth.spec.ts:3:5 > Login > succeeds (312ms)
              x  2 auth.spec.ts:9:5 > Login > rejects bad password (280ms)

            {"suites": [{"title": "auth.spec.ts", "suites": [{"title": "Login", "specs": [
              {"title": "succeeds", "tests": [{"results": [{"status": "passed"}]}]},
              {"title": "rejects bad password", "tests": [{"results": [{"status": "failed",
                "error": {"message": "expect failed"}}]}]}
            ]}]}], "errors": []}

            2 tests ran
        "#};

        let report = extract_report(stdout).expect("document parses");
        assert_eq!(report.suites.len(), 1);
        let login = &report.suites[0].suites[0];
        assert_eq!(login.title, "Login");
        assert_eq!(login.specs.len(), 2);
        assert_eq!(login.specs[0].tests[0].results[0].status, "passed");
        assert!(!report.is_load_failure());
    }

    #[test]
    fn last_brace_wins_over_braces_in_transcript() {
        // Progress lines before the document may contain `{` mid-line; the
        // document start requires a newline immediately followed by `{`.
        let stdout = "progress {not json}\nplain line\n{\"suites\": [], \"errors\": []}\n";
        let report = extract_report(stdout).expect("document parses");
        assert!(report.suites.is_empty());
    }

    #[test]
    fn load_failure_detection() {
        let stdout = "\n{\"suites\": [], \"errors\": [{\"message\": \"SyntaxError: unexpected token\"}]}";
        let report = extract_report(stdout).expect("document parses");
        assert!(report.is_load_failure());
        assert_eq!(
            report.errors[0].message.as_deref(),
            Some("SyntaxError: unexpected token")
        );
    }

    #[test]
    fn extraction_is_total() {
        // For any input, extraction returns a report or a structured error.
        let inputs = [
            "",
            "no json here",
            "{\"at start, not preceded by newline\": 1}",
            "\n{ truncated",
            "\n{]}",
            "text\n{\"suites\": }",
        ];
        for input in inputs {
            let res = extract_report(input);
            assert!(res.is_err(), "expected structured error for {input:?}");
        }
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let stdout = "\n{\"config\": {\"workers\": 4}, \"suites\": [], \"errors\": [], \"stats\": {}}";
        extract_report(stdout).expect("unknown fields are ignored");
    }
}
