use serde::{Deserialize, Serialize};

/// Half-open byte interval `[start, end)` over a stylesheet's source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True when the two ranges overlap or touch end-to-start, i.e. their
    /// union is a single interval.
    pub fn joins(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// True when the range shares at least one byte with `[start, end)`.
    pub fn intersects(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

/// Union a set of ranges into the minimal sorted sequence of disjoint
/// intervals. Overlapping and adjacent ranges are merged; empty ranges are
/// dropped.
pub fn union_ranges(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort();

    let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.joins(&range) => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

/// Per-stylesheet usage data from one render session.
///
/// `source_order_index` is the stylesheet's position in the page's cascade
/// (document order of link/style tags, inline styles interleaved); the merger
/// sorts by it and never reorders across it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StylesheetUsage {
    /// URL of a linked stylesheet, or a synthetic id for inline styles.
    pub stylesheet_id: String,
    pub source_order_index: usize,
    pub full_text: String,
    /// Disjoint, ascending intervals over `full_text` that were applied to
    /// rendered elements.
    pub used_ranges: Vec<ByteRange>,
}

/// Everything captured from one (job, viewport) render session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportCoverage {
    pub viewport_name: String,
    /// In ascending `source_order_index`.
    pub stylesheets: Vec<StylesheetUsage>,
    /// Visible height of the viewport at capture time, not the scrollable
    /// document height.
    pub above_fold_height_px: u32,
}

/// Raw per-stylesheet range data as a render session reports it: document
/// order, ranges possibly overlapping or out of bounds.
#[derive(Debug, Clone, Default)]
pub struct RawStylesheet {
    pub id: String,
    pub full_text: String,
    pub raw_ranges: Vec<ByteRange>,
}

/// Unprocessed output of a render session, before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawCapture {
    /// Stylesheets in document inclusion order.
    pub stylesheets: Vec<RawStylesheet>,
    pub above_fold_height_px: u32,
    /// Optional debug screenshot; advisory, forwarded to the artifact store.
    pub screenshot: Option<Vec<u8>>,
}

/// Normalize a raw capture into a [`ViewportCoverage`]: assign source order
/// from document position, clamp ranges to the stylesheet text, and union
/// each stylesheet's own ranges into a minimal disjoint set.
pub fn normalize(capture: RawCapture, viewport_name: &str) -> ViewportCoverage {
    let stylesheets = capture
        .stylesheets
        .into_iter()
        .enumerate()
        .map(|(index, sheet)| {
            let len = sheet.full_text.len();
            let clamped = sheet
                .raw_ranges
                .into_iter()
                .map(|r| ByteRange::new(r.start.min(len), r.end.min(len)))
                .collect();
            StylesheetUsage {
                stylesheet_id: sheet.id,
                source_order_index: index,
                full_text: sheet.full_text,
                used_ranges: union_ranges(clamped),
            }
        })
        .collect();

    ViewportCoverage {
        viewport_name: viewport_name.to_string(),
        stylesheets,
        above_fold_height_px: capture.above_fold_height_px,
    }
}
