//! Fallback strategies for selector resolution.
//!
//! When a declared selector finds nothing (or too much), the resolver asks
//! each strategy in its chain for alternative locators and tries them in the
//! same scope. Strategies only propose locators; they never touch the page.

use regex::Regex;
use sieve_browser::{looks_like_css, looks_like_xpath, Locator};
use sieve_core::{ResolverConfig, SelectorKind, VocabularyEntry};
use sieve_template::ElementSpec;
use std::sync::OnceLock;

/// Why the declared selector was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Miss {
    /// The selector does not parse in its declared language.
    Invalid,
    Empty,
    /// More matches than the configured container cap.
    OverBroad,
}

/// Source of alternative locators for a field.
pub trait FallbackStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the strategy should run for this kind of miss.
    fn applies(&self, _miss: Miss) -> bool {
        true
    }

    /// Candidate locators, tried in order.
    fn candidates(&self, spec: &ElementSpec) -> Vec<Locator>;
}

/// Retry the declared expression in the other selector language when it
/// reads as that language.
#[derive(Debug, Default)]
pub struct Reinterpret;

impl FallbackStrategy for Reinterpret {
    fn name(&self) -> &'static str {
        "reinterpret"
    }

    fn applies(&self, miss: Miss) -> bool {
        miss != Miss::OverBroad
    }

    fn candidates(&self, spec: &ElementSpec) -> Vec<Locator> {
        let expr = spec.locator.expr();
        let other_matches = match spec.locator.kind() {
            SelectorKind::Css => looks_like_xpath(expr),
            SelectorKind::Xpath => looks_like_css(expr),
        };
        if other_matches {
            vec![spec.locator.reinterpreted()]
        } else {
            Vec::new()
        }
    }
}

/// Relaxed variants of the declared selector: positional filters dropped,
/// leading ancestor steps dropped, compound class lists reduced, classes
/// matched by substring.
#[derive(Debug, Default)]
pub struct Similarity;

impl FallbackStrategy for Similarity {
    fn name(&self) -> &'static str {
        "similarity"
    }

    fn candidates(&self, spec: &ElementSpec) -> Vec<Locator> {
        let variants = match &spec.locator {
            Locator::Css(expr) => relax_css(expr).into_iter().map(Locator::Css).collect(),
            Locator::Xpath(expr) => relax_xpath(expr).into_iter().map(Locator::Xpath).collect(),
        };
        dedup_excluding(variants, &spec.locator)
    }
}

/// Attribute heuristics derived from the field label.
#[derive(Debug, Default)]
pub struct LabelGuided;

impl FallbackStrategy for LabelGuided {
    fn name(&self) -> &'static str {
        "label"
    }

    fn applies(&self, miss: Miss) -> bool {
        miss != Miss::OverBroad
    }

    fn candidates(&self, spec: &ElementSpec) -> Vec<Locator> {
        let label = spec.label.as_str();
        if label.contains(['\'', '"', '\\']) {
            return Vec::new();
        }

        let words: Vec<String> = spec
            .label
            .normalized()
            .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
            .filter(|word| !word.is_empty())
            .map(String::from)
            .collect();
        if words.is_empty() {
            return Vec::new();
        }

        let mut slugs = vec![words.join("-")];
        if words.len() > 1 {
            slugs.push(words.join("_"));
            slugs.push(words.concat());
        }

        let mut candidates = Vec::new();
        for slug in &slugs {
            candidates.push(format!("[itemprop='{slug}']"));
            candidates.push(format!("[data-label='{slug}']"));
            candidates.push(format!("[class*='{slug}']"));
            candidates.push(format!("[id*='{slug}']"));
        }
        candidates.push(format!("[aria-label*='{label}']"));

        dedup_excluding(
            candidates.into_iter().map(Locator::Css).collect(),
            &spec.locator,
        )
    }
}

/// Configured keyword to selector mappings.
#[derive(Debug, Default)]
pub struct Vocabulary {
    entries: Vec<VocabularyEntry>,
}

impl Vocabulary {
    #[must_use]
    pub fn new(entries: Vec<VocabularyEntry>) -> Self {
        Self { entries }
    }
}

impl FallbackStrategy for Vocabulary {
    fn name(&self) -> &'static str {
        "vocabulary"
    }

    fn applies(&self, miss: Miss) -> bool {
        miss != Miss::OverBroad
    }

    fn candidates(&self, spec: &ElementSpec) -> Vec<Locator> {
        let label = spec.label.normalized();
        let candidates = self
            .entries
            .iter()
            .filter(|entry| {
                entry
                    .keywords
                    .iter()
                    .any(|keyword| label.contains(&keyword.to_lowercase()))
            })
            .flat_map(|entry| entry.selectors.iter().cloned().map(Locator::Css))
            .collect();
        dedup_excluding(candidates, &spec.locator)
    }
}

/// The default chain for a resolver configuration.
#[must_use]
pub fn default_chain(config: &ResolverConfig) -> Vec<Box<dyn FallbackStrategy>> {
    let mut chain: Vec<Box<dyn FallbackStrategy>> = vec![Box::new(Reinterpret)];
    if config.similarity_search {
        chain.push(Box::new(Similarity));
    }
    if config.label_guided_search {
        chain.push(Box::new(LabelGuided));
    }
    if !config.vocabulary.is_empty() {
        chain.push(Box::new(Vocabulary::new(config.vocabulary.clone())));
    }
    chain
}

fn dedup_excluding(candidates: Vec<Locator>, declared: &Locator) -> Vec<Locator> {
    let mut out: Vec<Locator> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if candidate.expr().trim().is_empty() || &candidate == declared || out.contains(&candidate) {
            continue;
        }
        out.push(candidate);
    }
    out
}

fn css_positional() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r":(?:nth-child|nth-last-child|nth-of-type|nth-last-of-type|eq)\([^)]*\)|:(?:first|last|only)-(?:child|of-type)",
        )
        .expect("valid regex")
    })
}

fn css_class() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.([A-Za-z_][\w-]*)").expect("valid regex"))
}

fn css_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][\w-]*").expect("valid regex"))
}

fn css_id() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#([A-Za-z_][\w-]*)").expect("valid regex"))
}

fn relax_css(expr: &str) -> Vec<String> {
    if expr.contains(',') {
        return Vec::new();
    }
    let mut variants = Vec::new();

    let unpositioned = css_positional().replace_all(expr, "").trim().to_string();
    variants.push(unpositioned.clone());

    let steps: Vec<&str> = unpositioned
        .split(|c: char| c.is_whitespace() || matches!(c, '>' | '+' | '~'))
        .filter(|step| !step.is_empty())
        .collect();
    let Some(last) = steps.last().copied() else {
        return variants;
    };
    if steps.len() > 2 {
        variants.push(steps[steps.len() - 2..].join(" "));
    }
    variants.push(last.to_string());

    let tag = css_tag().find(last).map(|m| m.as_str());
    let classes: Vec<&str> = css_class()
        .captures_iter(last)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if let Some(first) = classes.first() {
        if let Some(tag) = tag {
            variants.push(format!("{tag}.{first}"));
        }
        variants.push(format!(".{first}"));
    }
    for class in &classes {
        variants.push(format!("[class*='{class}']"));
    }
    if let Some(id) = css_id().captures(last).and_then(|c| c.get(1)) {
        variants.push(format!("[id*='{}']", id.as_str()));
    }

    variants
}

fn xpath_positional() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\s*(?:\d+|last\(\))\s*\]").expect("valid regex"))
}

fn xpath_predicates() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\[\]]*\]").expect("valid regex"))
}

fn xpath_class_literal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"@class\s*=\s*['"]([^'"]+)['"]"#).expect("valid regex")
    })
}

fn relax_xpath(expr: &str) -> Vec<String> {
    if expr.contains('|') {
        return Vec::new();
    }
    let mut variants = Vec::new();

    let unpositioned = xpath_positional().replace_all(expr, "").to_string();
    variants.push(unpositioned.clone());

    let last = last_xpath_step(&unpositioned);
    if last.is_empty() || last.starts_with('@') || (last.contains("()") && !last.contains('[')) {
        return variants;
    }
    variants.push(format!("//{last}"));

    let bare = xpath_predicates().replace_all(last, "").to_string();
    if let Some(class_list) = xpath_class_literal()
        .captures(last)
        .and_then(|c| c.get(1))
    {
        for class in class_list.as_str().split_whitespace() {
            variants.push(format!("//{bare}[contains(@class,'{class}')]"));
        }
    }
    if !bare.is_empty() && bare != "*" {
        variants.push(format!("//{bare}"));
    }

    variants
}

/// Final location step of a path, ignoring slashes inside predicates.
fn last_xpath_step(expr: &str) -> &str {
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, c) in expr.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            '/' if depth == 0 => start = index + 1,
            _ => {}
        }
    }
    expr[start..].trim()
}
