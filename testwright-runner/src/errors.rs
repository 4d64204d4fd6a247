// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testwright.

use std::sync::Arc;
use thiserror::Error;

/// An error that occurred while starting or supervising the runner process.
///
/// Only true process-level failures surface here. A failing test suite exits
/// nonzero but still resolves to a [`CommandOutput`](crate::exec::CommandOutput);
/// callers distinguish "tests failed" from "process failed" by whether
/// structured output could subsequently be extracted.
#[derive(Clone, Debug, Error)]
pub enum ExecuteError {
    /// A run is already in flight on this executor.
    ///
    /// At most one child process may be active per executor instance; the
    /// caller must wait for (or cancel) the prior run first.
    #[error("a runner process is already active on this executor")]
    AlreadyInProgress,

    /// The child process could not be spawned.
    #[error("failed to spawn runner process")]
    Spawn(#[source] Arc<std::io::Error>),
}

/// An error isolating or parsing the JSON report embedded in runner stdout.
///
/// This is always converted into a synthetic failing result by the
/// correlator -- it never propagates out of the pipeline.
#[derive(Debug, Error)]
pub enum ReportExtractError {
    /// No embedded JSON document was found in the captured stdout.
    #[error("runner output contains no embedded JSON document")]
    NoJsonDocument,

    /// The isolated document failed to parse.
    #[error("failed to parse embedded JSON document")]
    Parse(#[source] serde_json::Error),
}
