use crate::error::{BrowserError, Result};
use crate::locator::Locator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Opaque reference to an element in a session's current document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementHandle(String);

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time view of a matched element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub handle: ElementHandle,
    pub tag: String,
    /// Visible text with whitespace collapsed.
    pub text: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Outer HTML.
    #[serde(default)]
    pub html: String,
}

impl ElementSnapshot {
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Whitespace-separated class list.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or_default().split_whitespace()
    }

    #[must_use]
    pub fn is_link(&self) -> bool {
        self.tag.eq_ignore_ascii_case("a") && self.attributes.contains_key("href")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollTarget {
    Bottom,
    By(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    Present(Locator),
    Absent(Locator),
    Delay(Duration),
}

/// Size of the currently rendered content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMetric {
    pub scroll_height: u64,
    pub viewport_height: u64,
    pub element_count: u64,
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capabilities the extraction engine needs from a page-driving backend.
///
/// Implementations own one document at a time; two sessions never share DOM
/// state, so a crawler can run on its own session while the primary session
/// keeps paginating.
#[async_trait::async_trait]
pub trait BrowserSession: Send + Sync {
    /// Load `url` and wait until the document is ready.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// All elements matching `locator` in document order.
    ///
    /// With a scope, only descendants of that element are searched.
    async fn query_all(
        &self,
        locator: &Locator,
        scope: Option<&ElementHandle>,
    ) -> Result<Vec<ElementSnapshot>>;

    /// First element matching `locator`, if any.
    async fn query(
        &self,
        locator: &Locator,
        scope: Option<&ElementHandle>,
    ) -> Result<Option<ElementSnapshot>> {
        Ok(self.query_all(locator, scope).await?.into_iter().next())
    }

    async fn click(&self, element: &ElementHandle) -> Result<()>;

    async fn scroll(&self, target: ScrollTarget) -> Result<()>;

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<()>;

    /// Block until `condition` holds or `timeout` elapses.
    async fn wait_for(&self, condition: &WaitCondition, timeout: Duration) -> Result<()> {
        let locator = match condition {
            WaitCondition::Delay(delay) => {
                tokio::time::sleep((*delay).min(timeout)).await;
                return Ok(());
            }
            WaitCondition::Present(locator) | WaitCondition::Absent(locator) => locator,
        };
        let want_present = matches!(condition, WaitCondition::Present(_));

        let poll = async {
            loop {
                let present = !self.query_all(locator, None).await?.is_empty();
                if present == want_present {
                    return Ok::<(), BrowserError>(());
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| BrowserError::Timeout(format!("waiting for {locator}")))?
    }

    async fn current_url(&self) -> Result<String>;

    async fn content_metric(&self) -> Result<ContentMetric>;
}

/// Helper to extract domain from URL
pub fn extract_domain(url: &str) -> Result<String> {
    let url = url::Url::parse(url)
        .map_err(|e| BrowserError::NavigationError(format!("Invalid URL: {e}")))?;

    url.host_str()
        .ok_or_else(|| BrowserError::NavigationError("No host in URL".to_string()))
        .map(ToString::to_string)
}

/// Collapse runs of whitespace into single spaces and trim.
#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
