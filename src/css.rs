//! Rule-boundary scanning over raw stylesheet text.
//!
//! The merger never emits part of a rule; it expands captured byte ranges to
//! the enclosing top-level statement. A top-level statement is either a
//! `{}`-block (style rule or at-rule such as `@media`, taken whole up to its
//! matching close brace) or a semicolon-terminated at-statement (`@import`,
//! `@charset`). Comments and whitespace between statements belong to no rule.

use crate::coverage::ByteRange;

/// Byte span of one top-level statement in a stylesheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSpan {
    pub start: usize,
    pub end: usize,
}

impl RuleSpan {
    pub fn intersects(&self, range: &ByteRange) -> bool {
        range.intersects(self.start, self.end)
    }
}

/// Scan a stylesheet into its top-level statement spans, in source order.
///
/// The scanner tracks block comments, string literals (including escapes)
/// and brace depth, so braces inside strings or comments never terminate a
/// rule. Malformed input (unbalanced braces, unterminated strings) degrades
/// to a single span running to end of text rather than an error: emitting
/// too much is safe, emitting a partial rule is not.
pub fn rule_spans(css: &str) -> Vec<RuleSpan> {
    let bytes = css.as_bytes();
    let len = bytes.len();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < len {
        // Whitespace and comments between statements are skipped.
        if bytes[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if bytes[i] == b'/' && i + 1 < len && bytes[i + 1] == b'*' {
            i = skip_comment(bytes, i);
            continue;
        }

        let start = i;
        let mut depth = 0usize;

        while i < len {
            match bytes[i] {
                b'/' if i + 1 < len && bytes[i + 1] == b'*' => {
                    i = skip_comment(bytes, i);
                    continue;
                }
                quote @ (b'"' | b'\'') => {
                    i = skip_string(bytes, i, quote);
                    continue;
                }
                b'{' => depth += 1,
                b'}' => {
                    if depth <= 1 {
                        i += 1;
                        break;
                    }
                    depth -= 1;
                }
                b';' if depth == 0 => {
                    i += 1;
                    break;
                }
                _ => {}
            }
            i += 1;
        }

        spans.push(RuleSpan { start, end: i });
    }

    spans
}

/// Advance past a `/* ... */` comment starting at `i`. Unterminated comments
/// run to end of text.
fn skip_comment(bytes: &[u8], i: usize) -> usize {
    let mut j = i + 2;
    while j + 1 < bytes.len() {
        if bytes[j] == b'*' && bytes[j + 1] == b'/' {
            return j + 2;
        }
        j += 1;
    }
    bytes.len()
}

/// Advance past a string literal starting at the opening quote at `i`.
fn skip_string(bytes: &[u8], i: usize, quote: u8) -> usize {
    let mut j = i + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b if b == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}
