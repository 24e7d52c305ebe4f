//! Coverage Merger: combines per-viewport coverage into one critical
//! stylesheet, preserving cascade order and never splitting a rule.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::coverage::{union_ranges, ByteRange, ViewportCoverage};
use crate::css::rule_spans;
use crate::errors::EngineError;

/// One emitted rule fragment, tagged with its origin so order can be audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRule {
    pub stylesheet_id: String,
    pub source_order_index: usize,
    /// Byte offset of the rule in its original stylesheet.
    pub start: usize,
    pub text: String,
}

/// The ordered critical-CSS output of one job. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedCriticalCss {
    pub rules: Vec<MergedRule>,
}

impl MergedCriticalCss {
    /// Concatenated rule text, one rule per line, in cascade order.
    pub fn css_text(&self) -> String {
        let mut out = String::new();
        for rule in &self.rules {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&rule.text);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Per-stylesheet accounting of what the merge emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StylesheetMergeStats {
    pub stylesheet_id: String,
    pub source_order_index: usize,
    pub emitted_rules: usize,
    pub total_rules: usize,
}

impl StylesheetMergeStats {
    /// A stylesheet is fully absorbed when every one of its rules made it
    /// into the critical output. Anything else still needs a deferred load.
    pub fn fully_absorbed(&self) -> bool {
        self.total_rules > 0 && self.emitted_rules == self.total_rules
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutput {
    pub merged: MergedCriticalCss,
    /// Ascending `source_order_index`, one entry per stylesheet seen in any
    /// viewport.
    pub stylesheets: Vec<StylesheetMergeStats>,
}

impl MergeOutput {
    /// Stylesheets that were not fully absorbed and therefore must be loaded
    /// asynchronously after first render.
    pub fn deferred_stylesheet_ids(&self) -> Vec<String> {
        self.stylesheets
            .iter()
            .filter(|s| !s.fully_absorbed())
            .map(|s| s.stylesheet_id.clone())
            .collect()
    }
}

struct SheetEntry {
    full_text: String,
    ranges: Vec<ByteRange>,
}

/// Merge the coverage of all successful viewports of one job.
///
/// Per stylesheet, the used ranges contributed by every viewport are
/// unioned, each unioned interval is expanded to enclosing rule boundaries,
/// and rules are emitted in ascending `(source_order_index, rule offset)` —
/// the original cascade order. The merge is commutative over its inputs and
/// deterministic, so it is never retried.
///
/// Fails with [`EngineError::Merge`] when coverage data is malformed: the
/// same stylesheet id reported with diverging source text or document
/// position, or ranges beyond the stylesheet text.
pub fn merge(coverages: &[ViewportCoverage]) -> Result<MergeOutput, EngineError> {
    // Keyed by (source_order_index, stylesheet_id): deterministic cascade
    // order even if distinct sheets were captured at the same position.
    let mut sheets: BTreeMap<(usize, String), SheetEntry> = BTreeMap::new();
    let mut seen_order: BTreeMap<String, usize> = BTreeMap::new();

    for coverage in coverages {
        for usage in &coverage.stylesheets {
            if let Some(&order) = seen_order.get(&usage.stylesheet_id) {
                if order != usage.source_order_index {
                    return Err(EngineError::Merge(format!(
                        "stylesheet {} captured at conflicting positions {} and {}",
                        usage.stylesheet_id, order, usage.source_order_index
                    )));
                }
            } else {
                seen_order.insert(usage.stylesheet_id.clone(), usage.source_order_index);
            }

            let key = (usage.source_order_index, usage.stylesheet_id.clone());
            let entry = sheets.entry(key).or_insert_with(|| SheetEntry {
                full_text: usage.full_text.clone(),
                ranges: Vec::new(),
            });

            if entry.full_text != usage.full_text {
                return Err(EngineError::Merge(format!(
                    "stylesheet {} has diverging source text across viewports",
                    usage.stylesheet_id
                )));
            }
            for range in &usage.used_ranges {
                if range.end > entry.full_text.len() {
                    return Err(EngineError::Merge(format!(
                        "range {}..{} exceeds stylesheet {} ({} bytes)",
                        range.start,
                        range.end,
                        usage.stylesheet_id,
                        entry.full_text.len()
                    )));
                }
                entry.ranges.push(*range);
            }
        }
    }

    let mut rules = Vec::new();
    let mut stats = Vec::new();

    for ((order, id), entry) in sheets {
        let used = union_ranges(entry.ranges);
        let spans = rule_spans(&entry.full_text);
        let total_rules = spans.len();
        let mut emitted = 0usize;
        let mut seen_text: HashSet<&str> = HashSet::new();

        if !used.is_empty() {
            for span in &spans {
                if !used.iter().any(|r| span.intersects(r)) {
                    continue;
                }
                let text = &entry.full_text[span.start..span.end];
                // Identical repeated rules are emitted once; dropping the
                // later duplicate cannot change which declarations win.
                if !seen_text.insert(text) {
                    continue;
                }
                emitted += 1;
                rules.push(MergedRule {
                    stylesheet_id: id.clone(),
                    source_order_index: order,
                    start: span.start,
                    text: text.to_string(),
                });
            }
        }

        stats.push(StylesheetMergeStats {
            stylesheet_id: id,
            source_order_index: order,
            emitted_rules: emitted,
            total_rules,
        });
    }

    Ok(MergeOutput {
        merged: MergedCriticalCss { rules },
        stylesheets: stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::StylesheetUsage;

    fn sheet(id: &str, order: usize, text: &str, ranges: Vec<ByteRange>) -> StylesheetUsage {
        StylesheetUsage {
            stylesheet_id: id.to_string(),
            source_order_index: order,
            full_text: text.to_string(),
            used_ranges: ranges,
        }
    }

    fn viewport(name: &str, sheets: Vec<StylesheetUsage>) -> ViewportCoverage {
        ViewportCoverage {
            viewport_name: name.to_string(),
            stylesheets: sheets,
            above_fold_height_px: 900,
        }
    }

    // Five 40-byte rules, 200 bytes total.
    fn main_css() -> String {
        (0..5)
            .map(|i| format!(".rule-{i}{{margin:{i}px;padding:{i}0px;flex:{i}1}}"))
            .collect()
    }

    #[test]
    fn overlapping_viewport_ranges_union_to_one_pass() {
        let text = main_css();
        assert_eq!(text.len(), 200);

        let desktop = viewport(
            "desktop",
            vec![sheet("main.css", 0, &text, vec![ByteRange::new(0, 120)])],
        );
        let mobile = viewport(
            "mobile",
            vec![sheet("main.css", 0, &text, vec![ByteRange::new(100, 200)])],
        );
        let both = merge(&[desktop.clone(), mobile.clone()]).unwrap();

        // Union [0, 200) covers every rule exactly once, in original order.
        let whole = viewport(
            "any",
            vec![sheet("main.css", 0, &text, vec![ByteRange::new(0, 200)])],
        );
        let reference = merge(&[whole]).unwrap();
        assert_eq!(both.merged, reference.merged);
        assert_eq!(both.merged.rules.len(), 5);

        // All 200 bytes absorbed: nothing left to defer.
        assert!(both.deferred_stylesheet_ids().is_empty());

        // Commutative over viewport order.
        let swapped = merge(&[mobile, desktop]).unwrap();
        assert_eq!(swapped.merged, both.merged);
    }

    #[test]
    fn partial_absorption_marks_stylesheet_deferred() {
        let text = main_css();
        let cov = viewport(
            "desktop",
            vec![sheet("main.css", 0, &text, vec![ByteRange::new(0, 50)])],
        );
        let out = merge(&[cov]).unwrap();
        assert_eq!(out.merged.rules.len(), 2); // [0,50) touches rules 0 and 1
        assert_eq!(out.deferred_stylesheet_ids(), vec!["main.css".to_string()]);
    }

    #[test]
    fn union_is_monotonic_rule_wise() {
        let text = main_css();
        let a = viewport(
            "desktop",
            vec![sheet("main.css", 0, &text, vec![ByteRange::new(0, 41)])],
        );
        let b = viewport(
            "mobile",
            vec![sheet("main.css", 0, &text, vec![ByteRange::new(170, 200)])],
        );

        let only_a: Vec<_> = merge(std::slice::from_ref(&a)).unwrap().merged.rules;
        let only_b: Vec<_> = merge(std::slice::from_ref(&b)).unwrap().merged.rules;
        let both = merge(&[a, b]).unwrap().merged.rules;

        for rule in only_a.iter().chain(only_b.iter()) {
            assert!(both.contains(rule), "union dropped rule {:?}", rule.text);
        }
    }

    #[test]
    fn cascade_order_is_preserved_across_stylesheets() {
        let theme = ".t{color:red}";
        let base = ".b{color:blue}";
        // Viewports report the sheets in different capture order; output must
        // still follow source_order_index.
        let a = viewport(
            "desktop",
            vec![
                sheet("theme.css", 1, theme, vec![ByteRange::new(0, 5)]),
                sheet("base.css", 0, base, vec![ByteRange::new(0, 5)]),
            ],
        );
        let out = merge(&[a]).unwrap();
        let ids: Vec<_> = out.merged.rules.iter().map(|r| r.stylesheet_id.as_str()).collect();
        assert_eq!(ids, vec!["base.css", "theme.css"]);

        let offsets_sorted = out
            .merged
            .rules
            .windows(2)
            .all(|w| (w[0].source_order_index, w[0].start) <= (w[1].source_order_index, w[1].start));
        assert!(offsets_sorted);
    }

    #[test]
    fn emitted_fragments_align_with_rule_boundaries() {
        let text = format!("@media (min-width:600px){{.m{{top:0}}}}{}", main_css());
        let cov = viewport(
            "desktop",
            vec![sheet("main.css", 0, &text, vec![ByteRange::new(10, 30)])],
        );
        let out = merge(&[cov]).unwrap();

        let boundary_texts: Vec<&str> = crate::css::rule_spans(&text)
            .into_iter()
            .map(|s| &text[s.start..s.end])
            .collect();
        for rule in &out.merged.rules {
            assert!(
                boundary_texts.contains(&rule.text.as_str()),
                "fragment is not a whole rule: {:?}",
                rule.text
            );
        }
        // A range inside the @media block keeps the whole block.
        assert!(out.merged.rules[0].text.starts_with("@media"));
        assert!(out.merged.rules[0].text.ends_with("}}"));
    }

    #[test]
    fn merge_is_idempotent() {
        let text = main_css();
        let covs = vec![
            viewport(
                "desktop",
                vec![sheet("main.css", 0, &text, vec![ByteRange::new(30, 90)])],
            ),
            viewport(
                "mobile",
                vec![sheet("main.css", 0, &text, vec![ByteRange::new(150, 160)])],
            ),
        ];
        let first = merge(&covs).unwrap();
        let second = merge(&covs).unwrap();
        assert_eq!(first.merged.css_text(), second.merged.css_text());
    }

    #[test]
    fn unused_stylesheet_contributes_nothing_but_is_deferred() {
        let text = main_css();
        let cov = viewport(
            "desktop",
            vec![
                sheet("main.css", 0, &text, vec![ByteRange::new(0, 200)]),
                sheet("print.css", 1, ".p{size:a4}", vec![]),
            ],
        );
        let out = merge(&[cov]).unwrap();
        assert!(out.merged.rules.iter().all(|r| r.stylesheet_id == "main.css"));
        assert_eq!(out.deferred_stylesheet_ids(), vec!["print.css".to_string()]);
    }

    #[test]
    fn stylesheet_missing_from_one_viewport_is_still_included() {
        let text = main_css();
        let extra = ".x{left:1px}";
        let desktop = viewport(
            "desktop",
            vec![sheet("main.css", 0, &text, vec![ByteRange::new(0, 10)])],
        );
        let mobile = viewport(
            "mobile",
            vec![
                sheet("main.css", 0, &text, vec![ByteRange::new(0, 10)]),
                sheet("mobile.css", 1, extra, vec![ByteRange::new(0, 4)]),
            ],
        );
        let out = merge(&[desktop, mobile]).unwrap();
        assert!(out
            .merged
            .rules
            .iter()
            .any(|r| r.stylesheet_id == "mobile.css"));
    }

    #[test]
    fn diverging_source_text_is_a_merge_error() {
        let a = viewport(
            "desktop",
            vec![sheet("main.css", 0, ".a{top:0}", vec![ByteRange::new(0, 5)])],
        );
        let b = viewport(
            "mobile",
            vec![sheet("main.css", 0, ".b{top:1}", vec![ByteRange::new(0, 5)])],
        );
        assert!(matches!(merge(&[a, b]), Err(EngineError::Merge(_))));
    }

    #[test]
    fn out_of_bounds_range_is_a_merge_error() {
        let cov = viewport(
            "desktop",
            vec![sheet("main.css", 0, ".a{top:0}", vec![ByteRange::new(0, 500)])],
        );
        assert!(matches!(merge(&[cov]), Err(EngineError::Merge(_))));
    }
}
