use crate::error::{BrowserError, Result};
use crate::locator::{js_string, Locator};
use crate::politeness::PolitenessGate;
use crate::session::{
    extract_domain, BrowserSession, ContentMetric, ElementHandle, ElementSnapshot, ScrollTarget,
};
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::Page;
use futures_util::stream::StreamExt;
use sieve_core::BrowserConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Attribute stamped onto matched elements so later calls can find them again.
const HANDLE_ATTR: &str = "data-sieve-handle";

/// Headless Chromium tab driven over the DevTools protocol.
pub struct ChromiumSession {
    browser: Arc<Browser>,
    page: Page,
    config: BrowserConfig,
    politeness: Arc<PolitenessGate>,
    /// Distinguishes handles minted by different tabs of the same browser.
    tab_id: u64,
}

static NEXT_TAB: AtomicU64 = AtomicU64::new(1);

impl ChromiumSession {
    /// Launch a browser and open a blank tab.
    pub async fn launch(config: BrowserConfig) -> Result<Self> {
        let mut builder = ChromiumConfig::builder()
            .no_sandbox()
            .window_size(config.window_width, config.window_height)
            .request_timeout(config.navigation_timeout());
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.arg(format!("--user-agent={user_agent}"));
        }
        let chromium_config = builder.build().map_err(BrowserError::ChromiumError)?;

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?;

        // Spawn browser handler
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::trace!(error = %e, "chromium handler event error");
                }
            }
        });

        let browser = Arc::new(browser);
        let politeness = Arc::new(PolitenessGate::new(Duration::from_millis(
            config.politeness_delay_ms,
        )));
        Self::open(browser, config, politeness).await
    }

    async fn open(
        browser: Arc<Browser>,
        config: BrowserConfig,
        politeness: Arc<PolitenessGate>,
    ) -> Result<Self> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?;

        Ok(Self {
            browser,
            page,
            config,
            politeness,
            tab_id: NEXT_TAB.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Open another tab in the same browser with its own document.
    pub async fn open_secondary(&self) -> Result<Self> {
        Self::open(
            Arc::clone(&self.browser),
            self.config.clone(),
            Arc::clone(&self.politeness),
        )
        .await
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?
            .into_value::<T>()
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    fn handle_lookup(handle: &ElementHandle) -> String {
        format!(
            "document.querySelector({})",
            js_string(&format!("[{HANDLE_ATTR}=\"{}\"]", handle.as_str()))
        )
    }

    async fn element(&self, handle: &ElementHandle) -> Result<chromiumoxide::Element> {
        self.page
            .find_element(format!("[{HANDLE_ATTR}=\"{}\"]", handle.as_str()))
            .await
            .map_err(|_| BrowserError::StaleHandle(handle.to_string()))
    }
}

#[async_trait::async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        let domain = extract_domain(url)?;
        self.politeness.wait_turn(&domain).await;

        tracing::debug!(url, "chromium navigate");
        let navigation = async {
            self.page
                .goto(url)
                .await
                .map_err(|e| BrowserError::NavigationError(format!("{url}: {e}")))?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(|e| BrowserError::NavigationError(format!("{url}: {e}")))?;
            Ok::<(), BrowserError>(())
        };

        tokio::time::timeout(self.config.navigation_timeout(), navigation)
            .await
            .map_err(|_| BrowserError::Timeout(url.to_string()))?
    }

    async fn query_all(
        &self,
        locator: &Locator,
        scope: Option<&ElementHandle>,
    ) -> Result<Vec<ElementSnapshot>> {
        let scope_js = scope.map_or_else(|| "document".to_string(), Self::handle_lookup);
        let query = locator.to_js_query("__scope");
        let prefix = js_string(&format!("{}-", self.tab_id));
        let script = format!(
            r"(() => {{
                const __scope = {scope_js};
                if (!__scope) {{ return null; }}
                window.__sieveNext = window.__sieveNext || 0;
                return {query}.map((el) => {{
                    if (!el.hasAttribute('{HANDLE_ATTR}')) {{
                        el.setAttribute('{HANDLE_ATTR}', {prefix} + (window.__sieveNext++));
                    }}
                    const attributes = {{}};
                    for (const a of el.attributes) {{
                        if (a.name !== '{HANDLE_ATTR}') {{ attributes[a.name] = a.value; }}
                    }}
                    return {{
                        handle: el.getAttribute('{HANDLE_ATTR}'),
                        tag: el.tagName.toLowerCase(),
                        text: (el.innerText || el.textContent || '').replace(/\s+/g, ' ').trim(),
                        attributes,
                        html: el.outerHTML,
                    }};
                }});
            }})()"
        );

        let result: Option<Vec<ElementSnapshot>> = self.eval(script).await.map_err(|e| {
            BrowserError::InvalidSelector {
                selector: locator.to_string(),
                reason: e.to_string(),
            }
        })?;

        match (result, scope) {
            (Some(elements), _) => Ok(elements),
            (None, Some(handle)) => Err(BrowserError::StaleHandle(handle.to_string())),
            (None, None) => Ok(Vec::new()),
        }
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        let target = self.element(element).await?;
        target
            .scroll_into_view()
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?;
        target
            .click()
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?;
        Ok(())
    }

    async fn scroll(&self, target: ScrollTarget) -> Result<()> {
        let script = match target {
            ScrollTarget::Bottom => {
                "window.scrollTo(0, document.documentElement.scrollHeight); true".to_string()
            }
            ScrollTarget::By(pixels) => format!("window.scrollBy(0, {pixels}); true"),
        };
        let _: bool = self.eval(script).await?;
        Ok(())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<()> {
        let target = self.element(element).await?;
        target
            .click()
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?
            .type_str(text)
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.page
            .url()
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?
            .ok_or(BrowserError::NoPage)
    }

    async fn content_metric(&self) -> Result<ContentMetric> {
        self.eval(
            "({ scrollHeight: document.documentElement.scrollHeight, \
               viewportHeight: window.innerHeight, \
               elementCount: document.getElementsByTagName('*').length })"
                .to_string(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_lookup_is_quoted() {
        let lookup = ChromiumSession::handle_lookup(&ElementHandle::new("1-7"));
        assert_eq!(
            lookup,
            r#"document.querySelector("[data-sieve-handle=\"1-7\"]")"#
        );
    }
}
