// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoding of coverage URLs into repository-relative source paths.
//!
//! The bundler mangles source paths into chunk names, the server renders
//! from absolute paths, and instrumentation reports framework internals
//! alongside user code. [`decode_source_path`] tries a fixed heuristic chain,
//! first match wins; [`is_user_source_file`] gates the final merged set no
//! matter which branch matched. Both are pure and deterministic.

use percent_encoding::percent_decode_str;
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

/// Extensions that count as user source.
const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];

/// Directory segments that never hold user source.
const BLOCKED_DIR_SEGMENTS: &[&str] = &[
    "node_modules",
    ".next",
    ".turbo",
    "dist",
    "build",
    "coverage",
    "test-results",
];

/// Top-level directories a repository-relative source path can start with.
const SOURCE_ROOT_DIRS: &[&str] = &["frontend", "backend", "src", "app"];

/// Segments marking server-internal render paths.
const SERVER_INTERNAL_SEGMENTS: &[&str] = &[".next", "node_modules"];

const EXTENSION_SCHEMES: &[&str] = &[
    "chrome-extension://",
    "moz-extension://",
    "safari-web-extension://",
];

// Chunk name carrying the extension as an inline `_ext_` marker:
// `frontend_app_page_tsx_abc123._.js` -> frontend/app/page.tsx
static CHUNK_WITH_EXT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.$-]+)_(tsx|ts|jsx|js|mjs|cjs)_[0-9a-zA-Z]+\._\.js$")
        .expect("chunk marker regex is valid")
});

// Chunk name keeping the real extension inline:
// `frontend_app_page.tsx_abc123.js` -> frontend/app/page.tsx
static CHUNK_WITH_EMBEDDED_EXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.$-]+\.(?:tsx|ts|jsx|js|mjs|cjs))_[0-9a-zA-Z]+\.js$")
        .expect("embedded ext regex is valid")
});

static TRAILING_SOURCE_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_.$-]+\.(?:tsx|ts|jsx|js|mjs|cjs))$")
        .expect("trailing file regex is valid")
});

/// Returns the best-effort canonical repository-relative path for one
/// coverage URL, or `None` for framework and build artifacts.
///
/// Heuristics are tried in order, first match wins. Idempotent on paths that
/// are already repository-relative.
pub fn decode_source_path(url: &str) -> Option<String> {
    let decoded = percent_decode_str(url).decode_utf8_lossy().into_owned();
    // Query strings and fragments never carry path information.
    let decoded = decoded
        .split(['?', '#'])
        .next()
        .expect("split yields at least one item");

    if is_rejected_outright(decoded) {
        return None;
    }

    let last_segment = decoded.rsplit('/').next().unwrap_or(decoded);
    if let Some(caps) = CHUNK_WITH_EXT_MARKER.captures(last_segment) {
        let body = caps[1].replace('_', "/");
        let ext = &caps[2];
        return Some(format!("{body}.{ext}"));
    }
    if let Some(caps) = CHUNK_WITH_EMBEDDED_EXT.captures(last_segment) {
        return Some(caps[1].replace('_', "/"));
    }

    if let Some(path) = decode_server_render_path(decoded) {
        return Some(path);
    }
    match decode_url_path(decoded) {
        UrlPathDecision::Source(path) => return Some(path),
        // A URL that parsed but named framework internals (or a non-source
        // scheme) is rejected for good -- the trailing-name fallback would
        // otherwise attribute framework chunks to user code.
        UrlPathDecision::Internal => return None,
        UrlPathDecision::NotAUrl => {}
    }

    TRAILING_SOURCE_FILE
        .captures(decoded)
        .map(|caps| caps[1].to_owned())
}

fn is_rejected_outright(url: &str) -> bool {
    if EXTENSION_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return true;
    }
    url.contains("node_modules")
        || url.contains(".next/")
        || url.contains("webpack-internal:")
        || url.contains("__nextjs")
}

/// Server-side-render paths: possibly absolute, possibly backslash-delimited,
/// containing a known top-level source directory. Rejected when any segment
/// is server-internal.
fn decode_server_render_path(path: &str) -> Option<String> {
    let normalized = path.replace('\\', "/");
    let segments: Vec<&str> = normalized.split('/').collect();
    if segments
        .iter()
        .any(|segment| SERVER_INTERNAL_SEGMENTS.contains(segment))
    {
        return None;
    }
    let root = segments
        .iter()
        .position(|segment| SOURCE_ROOT_DIRS.contains(segment))?;
    Some(segments[root..].join("/"))
}

enum UrlPathDecision {
    Source(String),
    Internal,
    NotAUrl,
}

/// Standard URL-path parsing, rejecting internal-framework prefixes.
fn decode_url_path(url: &str) -> UrlPathDecision {
    let Ok(parsed) = Url::parse(url) else {
        return UrlPathDecision::NotAUrl;
    };
    if !matches!(parsed.scheme(), "http" | "https" | "file") {
        return UrlPathDecision::Internal;
    }
    let path = parsed.path().trim_start_matches('/');
    if path.is_empty()
        || path.starts_with("_next/")
        || path.starts_with("__next")
        || path.starts_with('@')
    {
        return UrlPathDecision::Internal;
    }
    // `Url` re-encodes non-ASCII path segments; undo that so the output
    // matches the repository's actual file names.
    UrlPathDecision::Source(percent_decode_str(path).decode_utf8_lossy().into_owned())
}

/// Whether a decoded path belongs to user source: recognized extension and
/// no blocked directory segment. Gates the merged set independent of which
/// decoder branch matched.
pub fn is_user_source_file(path: &str) -> bool {
    let has_source_ext = path
        .rsplit('.')
        .next()
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
    let blocked = path
        .split('/')
        .any(|segment| BLOCKED_DIR_SEGMENTS.contains(&segment));
    has_source_ext && !blocked
}
