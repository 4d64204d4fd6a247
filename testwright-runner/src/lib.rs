// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for [testwright](https://crates.io/crates/testwright-cli),
//! the verification pipeline for AI-generated code changes.
//!
//! The flow: [`definitions`] recovers declarative test definitions from a
//! generated source file, [`exec`] runs the external test runner under a
//! timeout/cancellation contract, [`report`] isolates the runner's embedded
//! JSON document, [`correlate`] matches raw outcomes back to definitions,
//! and [`coverage`] attributes executed source files (plus inferred backend
//! files) to the run. [`pipeline`] ties these together behind one entry
//! point.

pub mod correlate;
pub mod coverage;
pub mod definitions;
pub mod errors;
pub mod exec;
pub mod pipeline;
pub mod report;
pub mod source_blocks;
mod time;
