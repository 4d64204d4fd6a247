// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line interface for the testwright verification pipeline.
//!
//! Human-facing output goes to stderr; stdout is reserved for machine-read
//! JSON so the CLI composes into automation.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use std::time::Duration;
use testwright_runner::{
    coverage::{MergedCoverage, merge_coverage_dir},
    definitions::parse_definitions,
    exec::WriterSink,
    pipeline::{Node, PipelineOptions, RunnerCommand, TestPipeline, VerificationRun},
};

/// Installs the stderr tracing subscriber, filtered by `RUST_LOG`.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

/// The testwright CLI.
#[derive(Debug, Parser)]
#[command(
    name = "testwright",
    about = "Runs declarative verification tests and attributes coverage",
    version
)]
pub struct TestwrightApp {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the verification pipeline for one generated test file.
    Run {
        /// The test file handed to the runner, relative to the project root.
        test_file: Utf8PathBuf,

        /// The file to parse for declarative definitions. Defaults to the
        /// test file itself.
        #[arg(long)]
        definitions: Option<Utf8PathBuf>,

        /// Project root the runner executes in.
        #[arg(long, default_value = ".")]
        cwd: Utf8PathBuf,

        /// Runner timeout in seconds.
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,

        /// Coverage output directory. Defaults to `<cwd>/coverage`.
        #[arg(long)]
        coverage_dir: Option<Utf8PathBuf>,

        /// Runner binary and subcommand.
        #[arg(long, default_value = "npx playwright test")]
        runner: String,

        /// Runner config file.
        #[arg(long, default_value = "playwright.config.ts")]
        config: Utf8PathBuf,

        /// Node id the definitions belong to.
        #[arg(long, default_value = "local")]
        node_id: String,

        /// Node title, for log lines.
        #[arg(long, default_value = "ad-hoc run")]
        node_title: String,

        /// Emit the full results as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Parse a file's declarative definitions and print them as JSON.
    ParseDefs {
        /// The file to parse.
        file: Utf8PathBuf,

        /// Node id to derive definition ids from.
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Merge a coverage directory and print the attribution as JSON.
    Coverage {
        /// The directory the runner's workers wrote coverage into.
        dir: Utf8PathBuf,
    },
}

impl TestwrightApp {
    /// Executes the selected command, returning the process exit code.
    pub fn exec(self) -> Result<i32> {
        match self.command {
            Command::Run {
                test_file,
                definitions,
                cwd,
                timeout_secs,
                coverage_dir,
                runner,
                config,
                node_id,
                node_title,
                json,
            } => {
                let definitions_file = definitions.unwrap_or_else(|| cwd.join(&test_file));
                let options = PipelineOptions {
                    runner: RunnerCommand {
                        program: runner,
                        config_file: config,
                        ..RunnerCommand::default()
                    },
                    coverage_dir: coverage_dir.unwrap_or_else(|| cwd.join("coverage")),
                    cwd,
                    timeout: Duration::from_secs(timeout_secs),
                };
                let node = Node {
                    id: node_id,
                    title: node_title,
                    workflow_id: None,
                    dependency_ids: vec![],
                };

                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .wrap_err("failed to build tokio runtime")?;

                let pipeline = TestPipeline::new(options);
                let mut sink = WriterSink::new(std::io::stderr());
                let run = runtime.block_on(pipeline.run_verification(
                    &node,
                    &definitions_file,
                    &test_file,
                    &mut sink,
                ));

                print_summary(&run);
                if json {
                    serde_json::to_writer_pretty(std::io::stdout(), &run.results)
                        .wrap_err("failed to serialize results")?;
                    println!();
                }
                Ok(if run.failed_count() == 0 { 0 } else { 1 })
            }

            Command::ParseDefs { file, node_id } => {
                let source = std::fs::read_to_string(&file)
                    .wrap_err_with(|| format!("failed to read {file}"))?;
                let parsed = parse_definitions(&source, node_id.as_deref());
                serde_json::to_writer_pretty(std::io::stdout(), &parsed)
                    .wrap_err("failed to serialize definitions")?;
                println!();
                Ok(0)
            }

            Command::Coverage { dir } => {
                let merged = merge_coverage_dir(&dir)
                    .ok_or_else(|| eyre!("no coverage output found under {dir}"))?;
                let data = MergedCoverage::into_coverage_data(merged);
                serde_json::to_writer_pretty(std::io::stdout(), &data)
                    .wrap_err("failed to serialize coverage")?;
                println!();
                Ok(0)
            }
        }
    }
}

fn print_summary(run: &VerificationRun) {
    for result in &run.results {
        let marker = if result.passed { "PASS" } else { "FAIL" };
        eprintln!("{marker} {}", result.test.title);
        if let Some(error) = &result.error {
            for line in error.lines() {
                eprintln!("       {line}");
            }
        }
    }
    let tests = if run.results.len() == 1 {
        "test"
    } else {
        "tests"
    };
    eprintln!(
        "{} {tests}: {} passed, {} failed in {:.2}s{}",
        run.results.len(),
        run.passed_count(),
        run.failed_count(),
        run.duration.as_secs_f64(),
        if run.timed_out { " (timed out)" } else { "" },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_defaults() {
        let app =
            TestwrightApp::try_parse_from(["testwright", "run", "tests/app.spec.ts"]).unwrap();
        let Command::Run {
            test_file,
            timeout_secs,
            json,
            ..
        } = app.command
        else {
            panic!("expected run command");
        };
        assert_eq!(test_file, Utf8PathBuf::from("tests/app.spec.ts"));
        assert_eq!(timeout_secs, 600);
        assert!(!json);
    }

    #[test]
    fn cli_requires_a_subcommand() {
        assert!(TestwrightApp::try_parse_from(["testwright"]).is_err());
    }
}
