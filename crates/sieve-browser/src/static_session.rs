//! Session backend over server-rendered HTML.
//!
//! Pages come from a [`PageSource`]; every query re-parses the current HTML
//! so nothing non-`Send` is held across an await. Element handles encode the
//! document generation and the element's position in document order, and go
//! stale as soon as the document changes.

use crate::error::{BrowserError, Result};
use crate::locator::Locator;
use crate::politeness::PolitenessGate;
use crate::session::{
    extract_domain, normalize_whitespace, BrowserSession, ContentMetric, ElementHandle,
    ElementSnapshot, ScrollTarget,
};
use crate::xpath::XPath;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Nominal rendered height of one element, used to estimate page height.
const LINE_HEIGHT_PX: u64 = 24;

const DEFAULT_VIEWPORT_HEIGHT: u64 = 800;

/// A user interaction forwarded to the page source.
#[derive(Debug, Clone, Copy)]
pub enum Interaction<'a> {
    Scroll(ScrollTarget),
    Click(&'a ElementSnapshot),
    Type(&'a ElementSnapshot, &'a str),
}

/// Supplies HTML for a [`StaticSession`].
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch the initial HTML of `url`.
    async fn fetch(&self, url: &str) -> Result<String>;

    /// React to an interaction on the page currently showing `url`.
    ///
    /// Returns the replacement HTML when the interaction changed the page.
    async fn interact(&self, _url: &str, _interaction: Interaction<'_>) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Fetches pages over plain HTTP.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: &sieve_core::BrowserConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.navigation_timeout());
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|e| BrowserError::NavigationError(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                BrowserError::Timeout(url.to_string())
            } else {
                BrowserError::NavigationError(format!("{url}: {e}"))
            }
        })?;
        let response = response
            .error_for_status()
            .map_err(|e| BrowserError::NavigationError(format!("{url}: {e}")))?;
        response
            .text()
            .await
            .map_err(|e| BrowserError::NavigationError(format!("{url}: {e}")))
    }
}

#[derive(Debug, Clone)]
struct LoadedPage {
    url: String,
    html: String,
    generation: u64,
}

/// [`BrowserSession`] that renders nothing and runs no scripts.
pub struct StaticSession {
    source: Arc<dyn PageSource>,
    page: RwLock<Option<LoadedPage>>,
    generation: std::sync::atomic::AtomicU64,
    politeness: Arc<PolitenessGate>,
    viewport_height: u64,
}

impl StaticSession {
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self {
            source,
            page: RwLock::new(None),
            generation: std::sync::atomic::AtomicU64::new(0),
            politeness: Arc::new(PolitenessGate::disabled()),
            viewport_height: DEFAULT_VIEWPORT_HEIGHT,
        }
    }

    /// Session over live HTTP using the browser settings for timeouts.
    pub fn http(config: &sieve_core::BrowserConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpSource::new(config)?))
            .with_politeness(Duration::from_millis(config.politeness_delay_ms))
            .with_viewport_height(u64::from(config.window_height)))
    }

    #[must_use]
    pub fn with_politeness(mut self, min_delay: Duration) -> Self {
        self.politeness = Arc::new(PolitenessGate::new(min_delay));
        self
    }

    #[must_use]
    pub fn with_viewport_height(mut self, height: u64) -> Self {
        self.viewport_height = height;
        self
    }

    /// A fresh session over the same source with its own document.
    ///
    /// Forks share the politeness gate, so per-domain spacing holds across them.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            politeness: Arc::clone(&self.politeness),
            ..Self::new(Arc::clone(&self.source)).with_viewport_height(self.viewport_height)
        }
    }

    /// HTML of the current document.
    pub async fn html(&self) -> Result<String> {
        Ok(self.loaded().await?.html)
    }

    async fn loaded(&self) -> Result<LoadedPage> {
        self.page.read().await.clone().ok_or(BrowserError::NoPage)
    }

    async fn replace_html(&self, url: String, html: String) {
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        *self.page.write().await = Some(LoadedPage {
            url,
            html,
            generation,
        });
    }

    async fn resolve(&self, handle: &ElementHandle) -> Result<(LoadedPage, ElementSnapshot)> {
        let page = self.loaded().await?;
        let ordinal = handle_ordinal(handle, page.generation)?;
        let snapshot = snapshot_at(&page.html, page.generation, ordinal)?;
        Ok((page, snapshot))
    }

    async fn apply(&self, page: &LoadedPage, interaction: Interaction<'_>) -> Result<bool> {
        match self.source.interact(&page.url, interaction).await? {
            Some(html) => {
                self.replace_html(page.url.clone(), html).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl BrowserSession for StaticSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        if let Ok(domain) = extract_domain(url) {
            self.politeness.wait_turn(&domain).await;
        }
        tracing::debug!(url, "static fetch");
        let html = self.source.fetch(url).await?;
        self.replace_html(url.to_string(), html).await;
        Ok(())
    }

    async fn query_all(
        &self,
        locator: &Locator,
        scope: Option<&ElementHandle>,
    ) -> Result<Vec<ElementSnapshot>> {
        let page = self.loaded().await?;
        let scope = scope
            .map(|handle| handle_ordinal(handle, page.generation))
            .transpose()?;
        query_document(&page.html, page.generation, locator, scope)
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        let (page, snapshot) = self.resolve(element).await?;
        if self.apply(&page, Interaction::Click(&snapshot)).await? {
            return Ok(());
        }

        if let Some(target) = snapshot
            .is_link()
            .then(|| snapshot.attr("href"))
            .flatten()
            .and_then(|href| follow_href(&page.url, href))
        {
            return self.navigate(&target).await;
        }

        tracing::trace!(handle = %element, "click had no effect on static page");
        Ok(())
    }

    async fn scroll(&self, target: ScrollTarget) -> Result<()> {
        let page = self.loaded().await?;
        self.apply(&page, Interaction::Scroll(target)).await?;
        Ok(())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<()> {
        let (page, snapshot) = self.resolve(element).await?;
        self.apply(&page, Interaction::Type(&snapshot, text)).await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.loaded().await?.url)
    }

    async fn content_metric(&self) -> Result<ContentMetric> {
        let page = self.loaded().await?;
        let element_count = count_body_elements(&page.html);
        Ok(ContentMetric {
            scroll_height: element_count * LINE_HEIGHT_PX,
            viewport_height: self.viewport_height,
            element_count,
        })
    }
}

/// Build the handle for the element at `ordinal` in document generation `generation`.
#[must_use]
pub(crate) fn make_handle(generation: u64, ordinal: usize) -> ElementHandle {
    ElementHandle::new(format!("{generation}:{ordinal}"))
}

/// Decode a handle, rejecting handles from another document generation.
pub(crate) fn handle_ordinal(handle: &ElementHandle, generation: u64) -> Result<usize> {
    let stale = || BrowserError::StaleHandle(handle.to_string());
    let (handle_generation, ordinal) = handle.as_str().split_once(':').ok_or_else(stale)?;
    if handle_generation.parse::<u64>().ok() != Some(generation) {
        return Err(stale());
    }
    ordinal.parse().map_err(|_| stale())
}

/// Element ordinal without the generation check.
pub(crate) fn raw_ordinal(handle: &ElementHandle) -> Option<usize> {
    handle.as_str().split_once(':')?.1.parse().ok()
}

fn all_elements(document: &Html) -> Vec<ElementRef<'_>> {
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .collect()
}

fn snapshot(element: ElementRef<'_>, generation: u64, ordinal: usize) -> ElementSnapshot {
    ElementSnapshot {
        handle: make_handle(generation, ordinal),
        tag: element.value().name().to_string(),
        text: normalize_whitespace(&element.text().collect::<String>()),
        attributes: element
            .value()
            .attrs()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
        html: element.html(),
    }
}

/// Run `locator` against `html`, optionally scoped to the element at `scope`.
pub(crate) fn query_document(
    html: &str,
    generation: u64,
    locator: &Locator,
    scope: Option<usize>,
) -> Result<Vec<ElementSnapshot>> {
    let document = Html::parse_document(html);
    let elements = all_elements(&document);
    let order: HashMap<_, usize> = elements
        .iter()
        .enumerate()
        .map(|(index, element)| (element.id(), index))
        .collect();

    let scope_element = match scope {
        Some(ordinal) => Some(*elements.get(ordinal).ok_or_else(|| {
            BrowserError::StaleHandle(make_handle(generation, ordinal).to_string())
        })?),
        None => None,
    };

    let matched: Vec<ElementRef<'_>> = match locator {
        Locator::Css(expr) => {
            let selector = Selector::parse(expr).map_err(|e| BrowserError::InvalidSelector {
                selector: expr.clone(),
                reason: format!("{e:?}"),
            })?;
            match scope_element {
                Some(scope) => scope
                    .select(&selector)
                    .filter(|element| element.id() != scope.id())
                    .collect(),
                None => document.select(&selector).collect(),
            }
        }
        Locator::Xpath(expr) => XPath::parse(expr)?.select(&document, scope_element),
    };

    Ok(matched
        .into_iter()
        .filter_map(|element| {
            order
                .get(&element.id())
                .map(|ordinal| snapshot(element, generation, *ordinal))
        })
        .collect())
}

fn snapshot_at(html: &str, generation: u64, ordinal: usize) -> Result<ElementSnapshot> {
    let document = Html::parse_document(html);
    all_elements(&document)
        .get(ordinal)
        .map(|element| snapshot(*element, generation, ordinal))
        .ok_or_else(|| BrowserError::StaleHandle(make_handle(generation, ordinal).to_string()))
}

fn count_body_elements(html: &str) -> u64 {
    let document = Html::parse_document(html);
    let count = document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|element| {
            !matches!(
                element.value().name(),
                "html" | "head" | "body" | "script" | "style" | "meta" | "link" | "title"
            )
        })
        .count();
    count as u64
}

/// Absolute target of a followable link, if any.
fn follow_href(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.to_ascii_lowercase().starts_with("javascript:")
    {
        return None;
    }
    url::Url::parse(base)
        .and_then(|base| base.join(href))
        .ok()
        .map(String::from)
}
