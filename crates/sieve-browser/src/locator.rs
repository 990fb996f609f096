//! Element locators and selector-language detection.

use serde::{Deserialize, Serialize};
use sieve_core::SelectorKind;
use std::fmt;

/// A selector expression tagged with the language it is evaluated in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "expr", rename_all = "lowercase")]
pub enum Locator {
    Css(String),
    Xpath(String),
}

impl Locator {
    pub fn new(expr: impl Into<String>, kind: SelectorKind) -> Self {
        match kind {
            SelectorKind::Css => Self::Css(expr.into()),
            SelectorKind::Xpath => Self::Xpath(expr.into()),
        }
    }

    /// Build a locator from a raw template selector.
    ///
    /// An explicit `css:` or `xpath:` prefix wins over the declared kind.
    pub fn parse(raw: &str, declared: SelectorKind) -> Self {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix("xpath:") {
            return Self::Xpath(rest.trim().to_string());
        }
        if let Some(rest) = trimmed.strip_prefix("css:") {
            return Self::Css(rest.trim().to_string());
        }
        Self::new(trimmed, declared)
    }

    #[must_use]
    pub fn kind(&self) -> SelectorKind {
        match self {
            Self::Css(_) => SelectorKind::Css,
            Self::Xpath(_) => SelectorKind::Xpath,
        }
    }

    #[must_use]
    pub fn expr(&self) -> &str {
        match self {
            Self::Css(expr) | Self::Xpath(expr) => expr,
        }
    }

    /// The same expression interpreted in the other selector language.
    #[must_use]
    pub fn reinterpreted(&self) -> Self {
        Self::new(self.expr(), self.kind().other())
    }

    /// Make an XPath expression relative to its context node.
    ///
    /// `//a` evaluated against an element still searches the whole document,
    /// so scoped lookups rewrite it to `.//a`. CSS locators are unchanged.
    #[must_use]
    pub fn scoped(&self) -> Self {
        match self {
            Self::Xpath(expr) if expr.starts_with('/') => Self::Xpath(format!(".{expr}")),
            Self::Xpath(expr) if expr.starts_with('(') && expr[1..].starts_with('/') => {
                Self::Xpath(format!("(.{}", &expr[1..]))
            }
            other => other.clone(),
        }
    }

    /// JavaScript expression evaluating to an array of matching elements.
    ///
    /// `scope` must be a JavaScript expression yielding a node.
    #[must_use]
    pub fn to_js_query(&self, scope: &str) -> String {
        let expr = js_string(self.expr());
        match self {
            Self::Css(_) => format!("Array.from(({scope}).querySelectorAll({expr}))"),
            Self::Xpath(_) => format!(
                "(() => {{ const r = document.evaluate({expr}, {scope}, null, \
                 XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null); const out = []; \
                 for (let i = 0; i < r.snapshotLength; i++) {{ const n = r.snapshotItem(i); \
                 out.push(n.nodeType === 1 ? n : n.parentElement || n.ownerElement); }} \
                 return out.filter((n, i, a) => n && a.indexOf(n) === i); }})()"
            ),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.expr())
    }
}

/// Quote a string as a JavaScript literal.
pub(crate) fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Whether an expression reads as XPath rather than CSS.
#[must_use]
pub fn looks_like_xpath(expr: &str) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return false;
    }
    expr.starts_with('/')
        || expr.starts_with("./")
        || expr.starts_with("..")
        || expr.starts_with("xpath:")
        || (expr.starts_with('(') && expr.contains('/'))
        || expr.contains("[@")
        || expr.contains("text()")
        || expr.contains("normalize-space(")
        || expr.contains("contains(")
        || expr.contains("::")
}

/// Whether an expression parses as CSS and does not read as XPath.
#[must_use]
pub fn looks_like_css(expr: &str) -> bool {
    !looks_like_xpath(expr) && scraper::Selector::parse(expr.trim()).is_ok()
}

/// Guess the selector language of an expression.
#[must_use]
pub fn detect_kind(expr: &str) -> Option<SelectorKind> {
    if looks_like_xpath(expr) {
        Some(SelectorKind::Xpath)
    } else if looks_like_css(expr) {
        Some(SelectorKind::Css)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefix_overrides_declared_kind() {
        let locator = Locator::parse("xpath://div[@class='card']", SelectorKind::Css);
        assert_eq!(locator, Locator::Xpath("//div[@class='card']".to_string()));

        let locator = Locator::parse("css: .card", SelectorKind::Xpath);
        assert_eq!(locator, Locator::Css(".card".to_string()));

        let locator = Locator::parse(" .card ", SelectorKind::Css);
        assert_eq!(locator.expr(), ".card");
    }

    #[test]
    fn test_reinterpreted_swaps_kind() {
        let locator = Locator::Css("//li".to_string());
        assert_eq!(locator.reinterpreted(), Locator::Xpath("//li".to_string()));
    }

    #[test]
    fn test_scoped_relativizes_absolute_xpath() {
        assert_eq!(
            Locator::Xpath("//a".to_string()).scoped().expr(),
            ".//a"
        );
        assert_eq!(
            Locator::Xpath("(//a)[1]".to_string()).scoped().expr(),
            "(.//a)[1]"
        );
        assert_eq!(Locator::Xpath(".//a".to_string()).scoped().expr(), ".//a");
        assert_eq!(Locator::Css("a".to_string()).scoped().expr(), "a");
    }

    #[test]
    fn test_looks_like_xpath() {
        for expr in ["//div", "./span", "..", "(//li)[2]", "div[@id='x']", "a[contains(., 'Next')]"] {
            assert!(looks_like_xpath(expr), "expected xpath: {expr}");
        }
        for expr in ["div.card", "#main > ul li", "a[href]", "button.load-more"] {
            assert!(!looks_like_xpath(expr), "expected css: {expr}");
        }
    }

    #[test]
    fn test_detect_kind() {
        assert_eq!(detect_kind("ul > li.item"), Some(SelectorKind::Css));
        assert_eq!(detect_kind("//ul/li"), Some(SelectorKind::Xpath));
        assert_eq!(detect_kind("ul >> ??"), None);
    }

    #[test]
    fn test_js_query_escapes_expression() {
        let js = Locator::Css("a[title=\"x\"]".to_string()).to_js_query("document");
        assert!(js.contains(r#"querySelectorAll("a[title=\"x\"]")"#));
        let js = Locator::Xpath("//a".to_string()).to_js_query("document");
        assert!(js.contains("ORDERED_NODE_SNAPSHOT_TYPE"));
    }
}
