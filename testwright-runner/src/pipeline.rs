// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The verification pipeline: one entry point running the whole
//! parse → execute → extract → correlate → attribute flow for a node.
//!
//! Every failure mode downstream of process spawn becomes structured
//! [`TestResult`] data; this module never returns an error to the caller.
//! Retries, if any, are the calling automation layer's decision -- invoking
//! the pipeline again is always safe.

use crate::{
    correlate::{TestResult, correlate_run, results_for_execution_error},
    coverage::{MergedCoverage, merge_coverage_dir},
    definitions::{ParsedDefinitions, parse_definitions},
    exec::{CommandOutput, CommandSpec, OutputSink, ProcessExecutor},
    report::extract_report,
    time::stopwatch,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Uuid kind for verification runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum VerificationRunKind {}

impl TypedUuidKind for VerificationRunKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("verification-run");
        TAG
    }
}

/// Identifies one verification run in logs and summaries.
pub type RunId = TypedUuid<VerificationRunKind>;

/// The workflow node a verification run belongs to.
///
/// Supplied by the host's workflow store; an input interface, not
/// re-specified here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Stable node id; definition ids are derived from it.
    pub id: String,
    /// Human-facing title.
    pub title: String,
    /// Owning workflow, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Nodes this one depends on.
    #[serde(default)]
    pub dependency_ids: Vec<String>,
}

/// How to invoke the external runner.
///
/// The invocation is a single shell command combining the runner binary, the
/// test file, an explicit config path and a dual reporter selection -- one
/// human-readable stream and one JSON document from the same run.
#[derive(Clone, Debug)]
pub struct RunnerCommand {
    /// The runner binary and subcommand, e.g. `npx playwright test`.
    pub program: String,
    /// Explicit config file passed with `--config`.
    pub config_file: Utf8PathBuf,
    /// The human-readable progress reporter.
    pub human_reporter: String,
    /// The JSON reporter whose document gets extracted.
    pub json_reporter: String,
}

impl Default for RunnerCommand {
    fn default() -> Self {
        Self {
            program: "npx playwright test".to_owned(),
            config_file: "playwright.config.ts".into(),
            human_reporter: "list".to_owned(),
            json_reporter: "json".to_owned(),
        }
    }
}

impl RunnerCommand {
    /// Builds the shell command line for one test file.
    pub fn command_line(&self, test_file: &Utf8Path) -> String {
        format!(
            "{} {} --config={} --reporter={},{}",
            self.program,
            shell_words::quote(test_file.as_str()),
            shell_words::quote(self.config_file.as_str()),
            self.human_reporter,
            self.json_reporter,
        )
    }
}

/// Pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Runner invocation shape.
    pub runner: RunnerCommand,
    /// Working directory for the runner process.
    pub cwd: Utf8PathBuf,
    /// Timeout for one runner invocation.
    pub timeout: Duration,
    /// Where the runner's workers write coverage output.
    pub coverage_dir: Utf8PathBuf,
}

impl PipelineOptions {
    /// Conventional options for a project rooted at `cwd`: default runner
    /// shape, coverage under `<cwd>/coverage`.
    pub fn for_project(cwd: impl Into<Utf8PathBuf>, timeout: Duration) -> Self {
        let cwd = cwd.into();
        let coverage_dir = cwd.join("coverage");
        Self {
            runner: RunnerCommand::default(),
            cwd,
            timeout,
            coverage_dir,
        }
    }
}

/// Summary of one completed verification run.
#[derive(Clone, Debug)]
pub struct VerificationRun {
    /// This run's id, also present in its log lines.
    pub run_id: RunId,
    /// Correlated results in definition order.
    pub results: Vec<TestResult>,
    /// True if the runner hit the timeout.
    pub timed_out: bool,
    /// The runner's exit code, when the OS reported one.
    pub exit_code: Option<i32>,
    /// Wall-clock start of the run.
    pub started_at: DateTime<Local>,
    /// How long the run took.
    pub duration: Duration,
}

impl VerificationRun {
    /// Count of passing results.
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Count of failing results.
    pub fn failed_count(&self) -> usize {
        self.results.len() - self.passed_count()
    }
}

/// Drives verification runs for generated test files.
#[derive(Clone, Debug)]
pub struct TestPipeline {
    executor: ProcessExecutor,
    options: PipelineOptions,
}

impl TestPipeline {
    /// Creates a pipeline with an idle executor.
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            executor: ProcessExecutor::new(),
            options,
        }
    }

    /// Returns a handle that cancels the in-flight run, if any.
    pub fn cancel_handle(&self) -> crate::exec::CancelHandle {
        self.executor.cancel_handle()
    }

    /// Runs the full verification flow for `node`'s generated test file.
    ///
    /// `definitions_file` is parsed for declarative definitions (missing file
    /// means none yet -- the normal state before first generation);
    /// `test_file` is handed to the runner. Always resolves to a
    /// [`VerificationRun`]; failures become structured results.
    pub async fn run_verification(
        &self,
        node: &Node,
        definitions_file: &Utf8Path,
        test_file: &Utf8Path,
        sink: &mut dyn OutputSink,
    ) -> VerificationRun {
        let run_id = RunId::new_v4();
        let watch = stopwatch();
        info!(%run_id, node = %node.title, %test_file, "starting verification run");

        let defs = load_definitions(definitions_file, &node.id).await;
        debug!(
            %run_id,
            features = defs.features.len(),
            tests = defs.flat_tests().len(),
            "parsed definitions"
        );

        let command = self.options.runner.command_line(test_file);
        let spec = CommandSpec::new(command, self.options.cwd.clone(), self.options.timeout);

        let output = match self.executor.run(&spec, sink).await {
            Ok(output) => output,
            Err(error) => {
                warn!(%run_id, %error, "runner process failed to execute");
                let results = results_for_execution_error(&defs, &error.to_string());
                let snapshot = watch.snapshot();
                return VerificationRun {
                    run_id,
                    results,
                    timed_out: false,
                    exit_code: None,
                    started_at: snapshot.start_time,
                    duration: snapshot.duration,
                };
            }
        };

        let transcript = build_transcript(&output, self.options.timeout);
        let extracted = extract_report(&output.stdout);
        let mut results = correlate_run(&defs, extracted, &transcript);

        if let Some(coverage) =
            merge_coverage_dir(&self.options.coverage_dir).map(MergedCoverage::into_coverage_data)
        {
            debug!(
                %run_id,
                source_files = coverage.source_files.len(),
                traces = coverage.test_traces.len(),
                "attaching coverage data"
            );
            for result in &mut results {
                result.coverage_data = Some(coverage.clone());
            }
        }

        let snapshot = watch.snapshot();
        let passed = results.iter().filter(|r| r.passed).count();
        info!(
            %run_id,
            total = results.len(),
            passed,
            failed = results.len() - passed,
            timed_out = output.timed_out,
            "verification run finished"
        );

        VerificationRun {
            run_id,
            results,
            timed_out: output.timed_out,
            exit_code: output.exit_code,
            started_at: snapshot.start_time,
            duration: snapshot.duration,
        }
    }
}

async fn load_definitions(path: &Utf8Path, node_id: &str) -> ParsedDefinitions {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_definitions(&text, Some(node_id)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            debug!(%path, "no definitions file yet");
            ParsedDefinitions::default()
        }
        Err(error) => {
            warn!(%path, %error, "failed to read definitions file; continuing without");
            ParsedDefinitions::default()
        }
    }
}

/// The full diagnostic text embedded into synthetic results: all captured
/// stdout plus stderr, with a leading note when the run timed out.
fn build_transcript(output: &CommandOutput, timeout: Duration) -> String {
    let mut transcript = if output.timed_out {
        format!(
            "runner timed out after {}s; partial output follows\n\n",
            timeout.as_secs()
        )
    } else {
        String::new()
    };
    transcript.push_str(&output.stdout);
    if !output.stderr.is_empty() {
        if !transcript.is_empty() {
            transcript.push('\n');
        }
        transcript.push_str(&output.stderr);
    }
    transcript
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_line_shape() {
        let runner = RunnerCommand::default();
        assert_eq!(
            runner.command_line(Utf8Path::new("tests/auth.spec.ts")),
            "npx playwright test tests/auth.spec.ts --config=playwright.config.ts --reporter=list,json"
        );
    }

    #[test]
    fn command_line_quotes_awkward_paths() {
        let runner = RunnerCommand::default();
        let line = runner.command_line(Utf8Path::new("tests/with space.spec.ts"));
        assert!(line.contains("'tests/with space.spec.ts'"));
    }

    #[test]
    fn transcript_carries_timeout_note_and_stderr() {
        let output = CommandOutput {
            stdout: "progress".to_owned(),
            stderr: "warning".to_owned(),
            exit_code: None,
            timed_out: true,
        };
        let transcript = build_transcript(&output, Duration::from_secs(30));
        assert!(transcript.starts_with("runner timed out after 30s"));
        assert!(transcript.contains("progress"));
        assert!(transcript.ends_with("warning"));
    }

    #[test]
    fn project_options_derive_coverage_dir() {
        let options = PipelineOptions::for_project("/repo", Duration::from_secs(60));
        assert_eq!(options.coverage_dir, Utf8PathBuf::from("/repo/coverage"));
    }
}
