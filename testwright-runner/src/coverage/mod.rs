// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Coverage attribution: merging per-worker shard files and decoding their
//! URLs into repository-relative source paths.
//!
//! The runner's workers each write their own shard file, so a run's coverage
//! has no single writer. The merge reads each shard exactly once, keeps the
//! lightweight per-test traces and the *set* of executed source paths, and
//! drops the raw per-file instrumentation entries immediately -- peak memory
//! stays bounded no matter how many workers ran. Shards may still be
//! appearing or half-written while we read; unparseable files are skipped,
//! never fatal.

pub mod backend;
pub mod source_paths;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Coverage attribution for one verification run.
///
/// Built fresh per invocation and attached to each [`TestResult`]
/// (crate::correlate::TestResult); never persisted by this subsystem.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageData {
    /// Executed user source files. Set semantics; sorted for determinism.
    pub source_files: Vec<String>,
    /// Plausible backend files derived from captured API calls. Heuristic --
    /// candidates may not exist on disk.
    pub inferred_backend_files: Vec<String>,
    /// Per-test trace data, keyed by test title.
    pub test_traces: IndexMap<String, TestTrace>,
}

/// Lightweight trace captured for one test by the runner's instrumentation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestTrace {
    /// API calls observed during the test.
    #[serde(default)]
    pub api_requests: Vec<ApiRequest>,
    /// Whatever else the instrumentation recorded; passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One captured API request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    /// The request URL.
    pub url: String,
    /// Response status, when the trace recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Whatever else the trace recorded about this request.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The merge output before backend inference.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedCoverage {
    /// Executed user source files, sorted.
    pub source_files: Vec<String>,
    /// Per-test traces, last writer wins across shards.
    pub test_traces: IndexMap<String, TestTrace>,
}

impl MergedCoverage {
    /// Attaches backend inference, producing the caller-facing
    /// [`CoverageData`].
    pub fn into_coverage_data(self) -> CoverageData {
        let inferred_backend_files = backend::infer_backend_files(
            self.test_traces
                .values()
                .flat_map(|trace| trace.api_requests.iter()),
        );
        CoverageData {
            source_files: self.source_files,
            inferred_backend_files,
            test_traces: self.test_traces,
        }
    }
}

// On-disk shard shape, shared by the per-worker files and the single-file
// legacy format.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShardFile {
    #[serde(default)]
    test_traces: IndexMap<String, TestTrace>,
    #[serde(default)]
    js_coverage: Vec<ScriptCoverage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptCoverage {
    #[serde(default)]
    url: String,
    #[serde(default)]
    functions: Vec<FunctionCoverage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionCoverage {
    #[serde(default)]
    ranges: Vec<CoverageRange>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoverageRange {
    #[serde(default)]
    count: u64,
}

// The single-file legacy format is either the shard shape or a bare
// jsCoverage array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacySingleFile {
    Shard(ShardFile),
    Scripts(Vec<ScriptCoverage>),
}

// Statement-percentage legacy map. The reserved `total` key is skipped.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryEntry {
    statements: Option<SummaryMetric>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryMetric {
    #[serde(default)]
    pct: f64,
}

#[derive(Debug)]
enum CoverageSource {
    WorkerShards(Vec<Utf8PathBuf>),
    LegacySingle(Utf8PathBuf),
    LegacySummary(Utf8PathBuf),
}

/// Merges whatever coverage output exists under `dir`.
///
/// Returns `None` when the directory is absent or carries no recognized
/// coverage files. Three format generations are supported, most specific
/// checked first: `coverage-worker-*.json` shards, then `coverage.json`,
/// then `coverage-summary.json`.
pub fn merge_coverage_dir(dir: &Utf8Path) -> Option<MergedCoverage> {
    let source = discover_source(dir)?;
    let mut source_files = BTreeSet::new();
    let mut test_traces = IndexMap::new();

    match source {
        CoverageSource::WorkerShards(paths) => {
            for path in &paths {
                let Some(shard) = read_shard(path) else {
                    continue;
                };
                absorb_shard(shard, &mut source_files, &mut test_traces);
            }
        }
        CoverageSource::LegacySingle(path) => {
            let shard = match read_json::<LegacySingleFile>(&path)? {
                LegacySingleFile::Shard(shard) => shard,
                LegacySingleFile::Scripts(js_coverage) => ShardFile {
                    test_traces: IndexMap::new(),
                    js_coverage,
                },
            };
            absorb_shard(shard, &mut source_files, &mut test_traces);
        }
        CoverageSource::LegacySummary(path) => {
            let summary = read_json::<IndexMap<String, SummaryEntry>>(&path)?;
            for (file_path, entry) in summary {
                if file_path == "total" {
                    continue;
                }
                let covered = entry.statements.is_some_and(|metric| metric.pct > 0.0);
                if !covered {
                    continue;
                }
                record_source_url(&file_path, &mut source_files);
            }
        }
    }

    Some(MergedCoverage {
        source_files: source_files.into_iter().collect(),
        test_traces,
    })
}

fn discover_source(dir: &Utf8Path) -> Option<CoverageSource> {
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(error) => {
            debug!(%dir, %error, "no coverage directory to merge");
            return None;
        }
    };

    let mut shards: Vec<Utf8PathBuf> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name();
            (name.starts_with("coverage-worker-") && name.ends_with(".json"))
                .then(|| entry.path().to_owned())
        })
        .collect();
    // Worker index order, for a deterministic last-writer-wins.
    shards.sort();

    if !shards.is_empty() {
        return Some(CoverageSource::WorkerShards(shards));
    }

    let single = dir.join("coverage.json");
    if single.is_file() {
        return Some(CoverageSource::LegacySingle(single));
    }

    let summary = dir.join("coverage-summary.json");
    if summary.is_file() {
        return Some(CoverageSource::LegacySummary(summary));
    }

    None
}

fn read_shard(path: &Utf8Path) -> Option<ShardFile> {
    read_json::<ShardFile>(path)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Utf8Path) -> Option<T> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) => {
            warn!(%path, %error, "skipping unreadable coverage file");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(error) => {
            // Possibly a partially-written shard from a worker that is still
            // running.
            warn!(%path, %error, "skipping unparseable coverage file");
            None
        }
    }
}

/// Folds one shard into the accumulators and drops its raw instrumentation.
fn absorb_shard(
    shard: ShardFile,
    source_files: &mut BTreeSet<String>,
    test_traces: &mut IndexMap<String, TestTrace>,
) {
    for (title, trace) in shard.test_traces {
        test_traces.insert(title, trace);
    }
    for script in shard.js_coverage {
        if !script_was_executed(&script) {
            continue;
        }
        record_source_url(&script.url, source_files);
    }
}

/// An entry counts as executed only if some function range was actually hit.
fn script_was_executed(script: &ScriptCoverage) -> bool {
    script
        .functions
        .iter()
        .any(|function| function.ranges.iter().any(|range| range.count > 0))
}

fn record_source_url(url: &str, source_files: &mut BTreeSet<String>) {
    if let Some(path) = source_paths::decode_source_path(url)
        && source_paths::is_user_source_file(&path)
    {
        source_files.insert(path);
    }
}
