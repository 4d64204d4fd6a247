// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recovery of declarative test definitions from generated source files.
//!
//! Generated test files carry a two-level grammar: one outer `describe`-style
//! grouping call wrapping feature-level `describe` calls, each of which wraps
//! leaf `test` calls. Header regexes locate each construct's opening brace;
//! [`balanced_block`] recovers the body regardless of nesting depth.
//!
//! Absence is the normal state here, not an error: a missing outer construct
//! yields an empty feature list, and an unparseable `input` or
//! `expectedResult` literal yields `None` for that field.

use crate::source_blocks::balanced_block;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

/// A feature-level grouping recovered from one inner `describe` block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    /// Deterministic id derived from the node id and parse order.
    pub id: String,
    /// The node this feature belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// The describe title, byte-for-byte as written in source.
    pub description: String,
    /// Parse order among kept features, starting at 0.
    pub sort_order: usize,
    /// Leaf tests in parse order.
    pub tests: Vec<TestCase>,
}

/// A leaf test recovered from one `test` block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    /// Deterministic id derived from the owning feature id and parse order.
    pub id: String,
    /// Id of the owning [`Feature`].
    pub feature_id: String,
    /// The test title, byte-for-byte as written in source.
    pub title: String,
    /// Richer description, owned by callers with their own metadata store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Structured `const input = {...};` payload, if present and parseable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Structured `const expectedResult = {...};` payload, if present and
    /// parseable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_result: Option<Value>,
    /// Parse order within the owning feature, starting at 0.
    pub sort_order: usize,
    /// When this definition was parsed.
    pub created_at: DateTime<Utc>,
}

/// Output of [`parse_definitions`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedDefinitions {
    /// Kept features in source order.
    pub features: Vec<Feature>,
}

impl ParsedDefinitions {
    /// Flattens to the definition ordering contract: features in source
    /// order, then tests in source order within each feature.
    ///
    /// This is the left side of the positional correlation in
    /// [`crate::correlate`]; the runner's suite tree is flattened with the
    /// same depth-first, left-to-right contract.
    pub fn flat_tests(&self) -> Vec<&TestCase> {
        self.features
            .iter()
            .flat_map(|feature| feature.tests.iter())
            .collect()
    }

    /// Returns true if no features were recovered.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

// Quote alternation rather than a backreference: the regex crate has no
// backreferences, and titles are taken literally (no escape processing) so
// the round-trip stays byte-for-byte.
static DESCRIBE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\w+\.)?describe\(\s*(?:'([^']*)'|"([^"]*)"|`([^`]*)`)\s*,\s*(?:async\s*)?\([^)]*\)\s*=>\s*\{"#,
    )
    .expect("describe header regex is valid")
});

static TEST_SYNC_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\w+\.)?(?:test|it)\(\s*(?:'([^']*)'|"([^"]*)"|`([^`]*)`)\s*,\s*\(\s*\)\s*=>\s*\{"#,
    )
    .expect("sync test header regex is valid")
});

static TEST_ASYNC_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\w+\.)?(?:test|it)\(\s*(?:'([^']*)'|"([^"]*)"|`([^`]*)`)\s*,\s*async\s*\(\s*\{[^}]*\}\s*\)\s*=>\s*\{"#,
    )
    .expect("async test header regex is valid")
});

static CONST_INPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"const\s+input\s*=\s*\{").expect("input const regex is valid")
});

static CONST_EXPECTED_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"const\s+expectedResult\s*=\s*\{").expect("expectedResult const regex is valid")
});

fn quoted_title(caps: &regex::Captures<'_>) -> String {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().to_owned())
        .unwrap_or_default()
}

/// Parses a source file's text into ordered features and tests.
///
/// Returns the empty set when no outer grouping construct exists -- the
/// normal state before first generation.
pub fn parse_definitions(source: &str, node_id: Option<&str>) -> ParsedDefinitions {
    let Some(outer) = DESCRIBE_HEADER.captures(source) else {
        return ParsedDefinitions::default();
    };
    let outer_open = outer.get(0).expect("group 0 always matches").end();
    let Some(outer_span) = balanced_block(source, outer_open) else {
        debug!("outer grouping construct never closes; treating as no definitions");
        return ParsedDefinitions::default();
    };
    let outer_body = outer_span.body(source);

    let mut features = Vec::new();
    let mut pos = 0;
    while let Some(caps) = DESCRIBE_HEADER.captures_at(outer_body, pos) {
        let header = caps.get(0).expect("group 0 always matches");
        let Some(span) = balanced_block(outer_body, header.end()) else {
            // Unclosed block: nothing further can be recovered reliably.
            break;
        };
        pos = span.end;

        let body = span.body(outer_body);
        if !TEST_SYNC_HEADER.is_match(body) && !TEST_ASYNC_HEADER.is_match(body) {
            // Grouping without any leaf test call, e.g. a fixture or setup
            // block. Not a feature.
            debug!(title = %quoted_title(&caps), "discarding grouping block with no test calls");
            continue;
        }

        let sort_order = features.len();
        let id = match node_id {
            Some(node_id) => format!("{node_id}-feature-{sort_order}"),
            None => format!("feature-{sort_order}"),
        };
        let tests = parse_tests(body, &id);
        features.push(Feature {
            id,
            node_id: node_id.map(str::to_owned),
            description: quoted_title(&caps),
            sort_order,
            tests,
        });
    }

    ParsedDefinitions { features }
}

fn parse_tests(feature_body: &str, feature_id: &str) -> Vec<TestCase> {
    let mut tests = Vec::new();
    let mut pos = 0;

    while let Some((caps, header_end)) = next_test_header(feature_body, pos) {
        let Some(span) = balanced_block(feature_body, header_end) else {
            break;
        };
        pos = span.end;

        let body = span.body(feature_body);
        let sort_order = tests.len();
        tests.push(TestCase {
            id: format!("{feature_id}-test-{sort_order}"),
            feature_id: feature_id.to_owned(),
            title: quoted_title(&caps),
            description: None,
            input: const_object_value(body, &CONST_INPUT),
            expected_result: const_object_value(body, &CONST_EXPECTED_RESULT),
            sort_order,
            created_at: Utc::now(),
        });
    }

    tests
}

/// Finds the earliest test header at or after `pos`, trying both the
/// synchronous-literal and async-destructured-argument variants.
fn next_test_header<'a>(body: &'a str, pos: usize) -> Option<(regex::Captures<'a>, usize)> {
    let sync = TEST_SYNC_HEADER.captures_at(body, pos);
    let async_ = TEST_ASYNC_HEADER.captures_at(body, pos);

    let start_of = |caps: &Option<regex::Captures<'_>>| {
        caps.as_ref()
            .map(|c| c.get(0).expect("group 0 always matches").start())
    };

    let earliest = match (start_of(&sync), start_of(&async_)) {
        (Some(s), Some(a)) => {
            if s <= a {
                sync
            } else {
                async_
            }
        }
        (Some(_), None) => sync,
        (None, _) => async_,
    }?;

    let end = earliest.get(0).expect("group 0 always matches").end();
    Some((earliest, end))
}

fn const_object_value(test_body: &str, header: &Regex) -> Option<Value> {
    let m = header.find(test_body)?;
    let span = balanced_block(test_body, m.end())?;
    // Reconstruct the braces around the body; the header regex consumed the
    // opening one.
    let literal = &test_body[m.end() - 1..span.end];
    parse_object_literal(literal)
}

/// Parses an object literal captured from source into structured data.
///
/// Strict JSON is tried first; on failure the literal is normalized from the
/// source grammar's looser form (bare keys, single/backtick quotes, trailing
/// commas, comments, `undefined`) and retried. Failure yields `None`.
pub(crate) fn parse_object_literal(literal: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(literal) {
        return Some(value);
    }
    serde_json::from_str(&normalize_object_literal(literal)).ok()
}

fn normalize_object_literal(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len() + 16);
    let bytes = literal.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '"' => {
                let end = copy_string(&mut out, literal, i, '"');
                i = end;
            }
            '\'' | '`' => {
                let end = requote_string(&mut out, literal, i, c);
                i = end;
            }
            '/' if bytes.get(i + 1) == Some(&b'/') => {
                i = literal[i..].find('\n').map_or(literal.len(), |n| i + n);
            }
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                i = literal[i + 2..]
                    .find("*/")
                    .map_or(literal.len(), |n| i + 2 + n + 2);
            }
            ',' => {
                // Trailing commas are legal in the source grammar, not in
                // JSON.
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                    j += 1;
                }
                if !matches!(bytes.get(j), Some(b'}') | Some(b']')) {
                    out.push(',');
                }
                i += 1;
            }
            _ if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < bytes.len() {
                    let w = bytes[i] as char;
                    if w.is_ascii_alphanumeric() || w == '_' || w == '$' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &literal[start..i];

                let mut j = i;
                while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                    j += 1;
                }
                let is_key = bytes.get(j) == Some(&b':');

                if is_key {
                    out.push('"');
                    out.push_str(word);
                    out.push('"');
                } else if word == "undefined" {
                    out.push_str("null");
                } else {
                    // true/false/null pass through; anything else (a variable
                    // reference) will fail the JSON parse, which is the
                    // intended degradation.
                    out.push_str(word);
                }
            }
            _ => {
                let ch = literal[i..].chars().next().expect("in-bounds char");
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    out
}

/// Copies a double-quoted string verbatim, returning the index past the
/// closing quote.
fn copy_string(out: &mut String, literal: &str, start: usize, delim: char) -> usize {
    let bytes = literal.as_bytes();
    out.push('"');
    let mut i = start + 1;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '\\' && i + 1 < bytes.len() && bytes[i + 1].is_ascii() {
            out.push('\\');
            out.push(bytes[i + 1] as char);
            i += 2;
        } else if c == delim {
            out.push('"');
            return i + 1;
        } else {
            let ch = literal[i..].chars().next().expect("in-bounds char");
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    i
}

/// Rewrites a single- or backtick-quoted string as a double-quoted one,
/// returning the index past the closing quote.
fn requote_string(out: &mut String, literal: &str, start: usize, delim: char) -> usize {
    let bytes = literal.as_bytes();
    out.push('"');
    let mut i = start + 1;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '\\' && i + 1 < bytes.len() && bytes[i + 1].is_ascii() {
            let escaped = bytes[i + 1] as char;
            if escaped == delim {
                // The escape was only needed for the original delimiter.
                out.push(escaped);
            } else {
                out.push('\\');
                out.push(escaped);
            }
            i += 2;
        } else if c == delim {
            out.push('"');
            return i + 1;
        } else if c == '"' {
            out.push_str("\\\"");
            i += 1;
        } else {
            let ch = literal[i..].chars().next().expect("in-bounds char");
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    i
}

/// Returns the source text preceding the first grouping construct.
///
/// This is the implementation code a regeneration must preserve. Leading
/// lines starting with a comment marker are skipped. With no grouping
/// construct present, the whole text (minus leading comment lines) is
/// returned.
pub fn implementation_prelude(source: &str) -> &str {
    let prelude = match DESCRIBE_HEADER.find(source) {
        Some(m) => &source[..m.start()],
        None => source,
    };

    let mut rest = prelude;
    loop {
        let trimmed = rest.trim_start_matches(['\n', '\r']);
        if trimmed.trim_start().starts_with("//") {
            match trimmed.find('\n') {
                Some(n) => rest = &trimmed[n + 1..],
                None => return "",
            }
        } else {
            return trimmed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn nested_describe_with_literals() {
        let source = indoc! {r#"
            describe('Auth', () => {
              describe('Login', () => {
                test('succeeds', () => {
                  const input = {u:1};
                  const expectedResult = {ok:true};
                  run(input, expectedResult);
                });
              });
            });
        "#};

        let parsed = parse_definitions(source, Some("node-1"));
        assert_eq!(parsed.features.len(), 1);

        let feature = &parsed.features[0];
        assert_eq!(feature.description, "Login");
        assert_eq!(feature.id, "node-1-feature-0");
        assert_eq!(feature.node_id.as_deref(), Some("node-1"));
        assert_eq!(feature.tests.len(), 1);

        let test = &feature.tests[0];
        assert_eq!(test.title, "succeeds");
        assert_eq!(test.feature_id, feature.id);
        assert_eq!(test.input, Some(json!({"u": 1})));
        assert_eq!(test.expected_result, Some(json!({"ok": true})));
    }

    #[test]
    fn features_and_tests_keep_source_order() {
        let source = indoc! {r#"
            describe('Suite', () => {
              describe('First', () => {
                test('a', () => {});
                test('b', () => {});
              });
              describe('Second', () => {
                test('c', () => {});
              });
            });
        "#};

        let parsed = parse_definitions(source, None);
        let descriptions: Vec<_> = parsed
            .features
            .iter()
            .map(|f| (f.description.as_str(), f.sort_order))
            .collect();
        assert_eq!(descriptions, vec![("First", 0), ("Second", 1)]);

        let titles: Vec<_> = parsed
            .flat_tests()
            .iter()
            .map(|t| (t.title.as_str(), t.sort_order))
            .collect();
        assert_eq!(titles, vec![("a", 0), ("b", 1), ("c", 0)]);
    }

    #[test]
    fn grouping_without_tests_is_discarded() {
        let source = indoc! {r#"
            describe('Suite', () => {
              describe('Fixtures', () => {
                setupDatabase();
              });
              describe('Real', () => {
                test('works', () => {});
              });
            });
        "#};

        let parsed = parse_definitions(source, None);
        assert_eq!(parsed.features.len(), 1);
        assert_eq!(parsed.features[0].description, "Real");
        // Sort order counts kept features only.
        assert_eq!(parsed.features[0].sort_order, 0);
    }

    #[test]
    fn titles_round_trip_byte_for_byte() {
        let source = indoc! {r#"
            describe('Outer', () => {
              describe('Lögin — flow ✓  ', () => {
                test('  spaced  title  ', () => {});
              });
            });
        "#};

        let parsed = parse_definitions(source, None);
        assert_eq!(parsed.features[0].description, "Lögin — flow ✓  ");
        assert_eq!(parsed.features[0].tests[0].title, "  spaced  title  ");
    }

    #[test]
    fn async_destructured_variant() {
        let source = indoc! {r#"
            describe('Suite', () => {
              describe('Pages', () => {
                test('renders', async ({ page }) => {
                  const input = { path: '/home' };
                  await page.goto(input.path);
                });
              });
            });
        "#};

        let parsed = parse_definitions(source, None);
        let test = &parsed.features[0].tests[0];
        assert_eq!(test.title, "renders");
        assert_eq!(test.input, Some(json!({"path": "/home"})));
        assert_eq!(test.expected_result, None);
    }

    #[test]
    fn malformed_literal_degrades_to_none() {
        let source = indoc! {r#"
            describe('Suite', () => {
              describe('Feature', () => {
                test('t', () => {
                  const input = { value: computeSomething() };
                  const expectedResult = { ok: true };
                });
              });
            });
        "#};

        let parsed = parse_definitions(source, None);
        let test = &parsed.features[0].tests[0];
        assert_eq!(test.input, None);
        assert_eq!(test.expected_result, Some(json!({"ok": true})));
    }

    #[test]
    fn no_outer_construct_yields_empty() {
        assert_eq!(parse_definitions("", None), ParsedDefinitions::default());
        assert_eq!(
            parse_definitions("const x = 1;\n", None),
            ParsedDefinitions::default()
        );
    }

    #[test]
    fn object_literal_normalization() {
        let tests: &[(&str, Option<Value>)] = &[
            (r#"{"a": 1}"#, Some(json!({"a": 1}))),
            ("{a: 1}", Some(json!({"a": 1}))),
            ("{a: 'x', b: [1, 2,]}", Some(json!({"a": "x", "b": [1, 2]}))),
            (
                "{nested: {deep: true}, n: null}",
                Some(json!({"nested": {"deep": true}, "n": null})),
            ),
            ("{a: undefined}", Some(json!({"a": null}))),
            ("{a: `tick`}", Some(json!({"a": "tick"}))),
            ("{a: 'it\\'s'}", Some(json!({"a": "it's"}))),
            ("{a: 1, // comment\n b: 2}", Some(json!({"a": 1, "b": 2}))),
            ("{a: someVar}", None),
            ("{a: }", None),
        ];

        for (input, expected) in tests {
            assert_eq!(
                parse_object_literal(input),
                *expected,
                "for input {input:?}"
            );
        }
    }

    #[test]
    fn prelude_skips_leading_comment_lines() {
        let source = indoc! {r#"
            // Generated by the verification agent.
            // Do not edit above this line.
            import { helper } from './helpers';

            const shared = makeShared();

            describe('Suite', () => {
              describe('F', () => { test('t', () => {}); });
            });
        "#};

        let prelude = implementation_prelude(source);
        assert!(prelude.starts_with("import { helper }"));
        assert!(prelude.contains("const shared = makeShared();"));
        assert!(!prelude.contains("describe("));
        assert!(!prelude.contains("Generated by"));
    }

    #[test]
    fn prelude_without_describe_returns_everything() {
        let source = "// header\nconst a = 1;\n";
        assert_eq!(implementation_prelude(source), "const a = 1;\n");
    }
}
