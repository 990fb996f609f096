//! In-memory page source for offline runs and tests.
//!
//! A fixture page is a list of HTML stages. Loading the page shows stage 0;
//! the configured interaction moves to the next stage, which is how
//! "load more" buttons and infinite scroll are simulated.

use crate::error::{BrowserError, Result};
use crate::locator::Locator;
use crate::static_session::{query_document, raw_ordinal, Interaction, PageSource};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// What moves a staged page to its next stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Never,
    OnScroll,
    /// Clicking an element matching this CSS selector.
    OnClick(String),
}

#[derive(Debug, Clone)]
enum Behavior {
    Serve,
    Timeout,
    Fail(String),
}

#[derive(Debug, Clone)]
struct FixturePage {
    stages: Vec<String>,
    stage: usize,
    advance: Advance,
    behavior: Behavior,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub visits: usize,
    pub clicks: usize,
    pub scrolls: usize,
}

/// A set of canned pages keyed by URL.
#[derive(Debug, Default)]
pub struct FixtureSite {
    pages: Mutex<HashMap<String, FixturePage>>,
    stats: Mutex<HashMap<String, PageStats>>,
}

fn key(url: &str) -> String {
    url::Url::parse(url).map_or_else(|_| url.to_string(), String::from)
}

impl FixtureSite {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(self, url: &str, page: FixturePage) -> Self {
        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(key(url), page);
        }
        self
    }

    #[must_use]
    pub fn with_page(self, url: &str, html: impl Into<String>) -> Self {
        self.with_staged_page(url, vec![html.into()], Advance::Never)
    }

    #[must_use]
    pub fn with_staged_page(self, url: &str, stages: Vec<String>, advance: Advance) -> Self {
        self.insert(
            url,
            FixturePage {
                stages,
                stage: 0,
                advance,
                behavior: Behavior::Serve,
            },
        )
    }

    /// Requests for `url` time out.
    #[must_use]
    pub fn with_timeout(self, url: &str) -> Self {
        self.insert(
            url,
            FixturePage {
                stages: Vec::new(),
                stage: 0,
                advance: Advance::Never,
                behavior: Behavior::Timeout,
            },
        )
    }

    /// Requests for `url` fail with a navigation error.
    #[must_use]
    pub fn with_failure(self, url: &str, reason: &str) -> Self {
        self.insert(
            url,
            FixturePage {
                stages: Vec::new(),
                stage: 0,
                advance: Advance::Never,
                behavior: Behavior::Fail(reason.to_string()),
            },
        )
    }

    #[must_use]
    pub fn stats(&self, url: &str) -> PageStats {
        self.stats
            .lock()
            .ok()
            .and_then(|stats| stats.get(&key(url)).copied())
            .unwrap_or_default()
    }

    /// Total page loads across every URL.
    #[must_use]
    pub fn total_visits(&self) -> usize {
        self.stats
            .lock()
            .map(|stats| stats.values().map(|s| s.visits).sum())
            .unwrap_or_default()
    }

    fn record(&self, url: &str, update: impl FnOnce(&mut PageStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(stats.entry(key(url)).or_default());
        }
    }

    fn load(&self, url: &str) -> Result<String> {
        self.record(url, |s| s.visits += 1);
        let mut pages = self
            .pages
            .lock()
            .map_err(|_| BrowserError::NavigationError("fixture lock poisoned".to_string()))?;
        let page = pages
            .get_mut(&key(url))
            .ok_or_else(|| BrowserError::NavigationError(format!("404 Not Found: {url}")))?;

        match &page.behavior {
            Behavior::Timeout => Err(BrowserError::Timeout(url.to_string())),
            Behavior::Fail(reason) => Err(BrowserError::NavigationError(format!("{url}: {reason}"))),
            Behavior::Serve => {
                page.stage = 0;
                page.stages
                    .first()
                    .cloned()
                    .ok_or_else(|| BrowserError::NavigationError(format!("empty fixture: {url}")))
            }
        }
    }

    fn react(&self, url: &str, interaction: Interaction<'_>) -> Result<Option<String>> {
        match interaction {
            Interaction::Click(_) => self.record(url, |s| s.clicks += 1),
            Interaction::Scroll(_) => self.record(url, |s| s.scrolls += 1),
            Interaction::Type(..) => {}
        }

        let mut pages = self
            .pages
            .lock()
            .map_err(|_| BrowserError::NavigationError("fixture lock poisoned".to_string()))?;
        let Some(page) = pages.get_mut(&key(url)) else {
            return Ok(None);
        };
        let Some(current) = page.stages.get(page.stage) else {
            return Ok(None);
        };

        let triggered = match (&page.advance, interaction) {
            (Advance::OnScroll, Interaction::Scroll(_)) => true,
            (Advance::OnClick(selector), Interaction::Click(element)) => {
                let triggers = query_document(current, 0, &Locator::Css(selector.clone()), None)?;
                let clicked = raw_ordinal(&element.handle);
                triggers
                    .iter()
                    .any(|trigger| raw_ordinal(&trigger.handle) == clicked)
            }
            _ => false,
        };

        if triggered && page.stage + 1 < page.stages.len() {
            page.stage += 1;
            return Ok(page.stages.get(page.stage).cloned());
        }
        Ok(None)
    }
}

#[async_trait]
impl PageSource for FixtureSite {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.load(url)
    }

    async fn interact(&self, url: &str, interaction: Interaction<'_>) -> Result<Option<String>> {
        self.react(url, interaction)
    }
}
