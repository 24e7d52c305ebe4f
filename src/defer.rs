//! Defer Snippet Composer: markup for loading non-critical stylesheets
//! asynchronously once the page is interactive. Pure, no side effects.

use serde::{Deserialize, Serialize};

/// Deferred-load strategy for the stylesheets not absorbed into the critical
/// CSS: a human-readable description plus the markup to emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferInstructions {
    pub description: String,
    pub snippet: String,
}

/// Compose deferral instructions for the given stylesheet URLs/ids.
///
/// Uses the preload-then-activate pattern: the browser fetches the sheet
/// without blocking render, then the `onload` handler switches the link to a
/// live stylesheet. A `<noscript>` fallback keeps the page styled without
/// JavaScript.
pub fn compose(deferred: &[String]) -> DeferInstructions {
    if deferred.is_empty() {
        return DeferInstructions {
            description: "All stylesheet rules were absorbed into the critical CSS; \
                          nothing needs to be deferred."
                .to_string(),
            snippet: String::new(),
        };
    }

    let mut snippet = String::new();
    for url in deferred {
        let href = escape_attr(url);
        snippet.push_str(&format!(
            "<link rel=\"preload\" href=\"{href}\" as=\"style\" \
             onload=\"this.onload=null;this.rel='stylesheet'\">\n"
        ));
    }
    snippet.push_str("<noscript>\n");
    for url in deferred {
        let href = escape_attr(url);
        snippet.push_str(&format!("<link rel=\"stylesheet\" href=\"{href}\">\n"));
    }
    snippet.push_str("</noscript>");

    DeferInstructions {
        description: format!(
            "Inline the critical CSS in <head> and swap in the remaining {} stylesheet{} \
             once loaded to avoid render-blocking.",
            deferred.len(),
            if deferred.len() == 1 { "" } else { "s" }
        ),
        snippet,
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_preloads_each_deferred_stylesheet() {
        let out = compose(&["/static/app.css".to_string(), "/static/print.css".to_string()]);
        assert!(out
            .snippet
            .contains("<link rel=\"preload\" href=\"/static/app.css\" as=\"style\""));
        assert!(out.snippet.contains("this.rel='stylesheet'"));
        assert!(out.snippet.contains("<noscript>"));
        assert!(out
            .snippet
            .contains("<link rel=\"stylesheet\" href=\"/static/print.css\">"));
        assert!(out.description.contains("2 stylesheets"));
    }

    #[test]
    fn nothing_deferred_yields_empty_snippet() {
        let out = compose(&[]);
        assert!(out.snippet.is_empty());
        assert!(out.description.contains("nothing needs to be deferred"));
    }

    #[test]
    fn urls_are_attribute_escaped() {
        let out = compose(&["/a.css?x=1&y=\"2\"".to_string()]);
        assert!(out.snippet.contains("/a.css?x=1&amp;y=&quot;2&quot;"));
    }
}
