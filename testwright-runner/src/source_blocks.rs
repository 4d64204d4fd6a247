// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Brace-balanced extraction of block bodies from source text.
//!
//! The definition grammar nests grouping constructs to arbitrary depth, so a
//! regex alone cannot recover a block's body. Header regexes find where a
//! block *starts*; this module's balance scan finds where it *ends*. Keeping
//! the two concerns apart lets each be tested on its own.

/// A block body located by [`balanced_block`].
///
/// `body` spans the text strictly between the opening brace and its matching
/// closing brace. `end` is the byte offset one past the closing brace,
/// suitable as the resume point for scanning subsequent blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockSpan {
    /// Offset of the first byte of the body (just after the opening brace).
    pub start: usize,
    /// Offset one past the closing brace.
    pub end: usize,
}

impl BlockSpan {
    /// Returns the body text within `source`.
    pub fn body<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end - 1]
    }
}

/// Scans forward from `open_end`, the offset just past an already-consumed
/// opening brace, and returns the span of the balanced body.
///
/// The scan starts at balance 1 and adjusts on every `{` and `}`. Returns
/// `None` if the text ends before the balance returns to zero (a truncated
/// or malformed block).
pub fn balanced_block(source: &str, open_end: usize) -> Option<BlockSpan> {
    let mut depth = 1usize;
    for (idx, b) in source[open_end..].bytes().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(BlockSpan {
                        start: open_end,
                        end: open_end + idx + 1,
                    });
                }
            }
            _ => {}
        }
    }
    None
}
