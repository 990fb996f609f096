#![allow(clippy::must_use_candidate)]

//! Pre-navigation filtering of detail links.

use regex::Regex;
use std::fmt;

/// Why a link was not crawled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    Fragment,
    Scheme,
    External,
    NotAllowed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Empty => "empty link",
            Self::Fragment => "fragment-only link",
            Self::Scheme => "not an http(s) link",
            Self::External => "external host",
            Self::NotAllowed => "does not match the subpage allow pattern",
        };
        f.write_str(reason)
    }
}

/// Decides which links the subpage crawler may visit.
///
/// Links on the start page's host are allowed unless an allow pattern is set
/// and they do not match it. Links on other hosts are allowed only through
/// the allow pattern.
#[derive(Debug, Clone)]
pub struct LinkFilter {
    host: Option<String>,
    allow: Option<Regex>,
}

impl LinkFilter {
    pub fn new(start_url: &str, allow: Option<Regex>) -> Self {
        let host = url::Url::parse(start_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase));
        Self { host, allow }
    }

    /// `Ok(())` when `link` should be crawled.
    pub fn check(&self, link: &str) -> Result<(), SkipReason> {
        let link = link.trim();
        if link.is_empty() {
            return Err(SkipReason::Empty);
        }
        if link.starts_with('#') {
            return Err(SkipReason::Fragment);
        }

        let lower = link.to_ascii_lowercase();
        if ["javascript:", "mailto:", "tel:", "data:"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
        {
            return Err(SkipReason::Scheme);
        }

        let parsed = url::Url::parse(link).map_err(|_| SkipReason::Scheme)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SkipReason::Scheme);
        }

        let allowed = self.allow.as_ref().map(|allow| allow.is_match(link));
        let same_host = match (&self.host, parsed.host_str()) {
            (Some(host), Some(other)) => host.eq_ignore_ascii_case(other),
            _ => false,
        };

        match (same_host, allowed) {
            (_, Some(true)) | (true, None) => Ok(()),
            (true, Some(false)) => Err(SkipReason::NotAllowed),
            (false, _) => Err(SkipReason::External),
        }
    }

    pub fn allows(&self, link: &str) -> bool {
        self.check(link).is_ok()
    }
}
