//! Pagination controller.
//!
//! Drives the main session through more content (infinite scroll, a
//! load-more trigger, or URL-indexed pages), re-harvesting after every step
//! until the content stops growing, the iteration cap is hit, or the run is
//! cancelled.

use crate::diagnostics::{Diagnostic, Diagnostics, Phase};
use crate::error::{EngineError, Result};
use crate::harvest::Harvester;
use crate::paging::PageCursor;
use crate::resolver::absolutize;
use crate::retry::{self, RetryPolicy};
use regex::Regex;
use sieve_browser::{
    detect_kind, BrowserError, BrowserSession, ElementSnapshot, Locator, ScrollTarget,
};
use sieve_core::{PaginationConfig, SelectorKind};
use sieve_template::{PaginationPlan, PaginationSpec, PatternType};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Elements whose text may name a load-more control.
const CLICKABLE: &str = "button, a, [role='button'], input[type='button'], input[type='submit']";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    Idle,
    Detecting,
    ScrollLoop,
    LoadMoreLoop,
    UrlPageLoop,
    Stalled,
    Done,
}

impl fmt::Display for PaginationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the load-more control is found on each iteration.
#[derive(Debug, Clone)]
pub enum Trigger {
    Selector(Locator),
    /// First clickable element whose text matches.
    Text(Regex),
}

/// How the next URL-indexed page is reached.
#[derive(Debug, Clone)]
pub enum UrlPager {
    Index(PageCursor),
    NextLink(Locator),
}

/// Detected paging mechanism.
#[derive(Debug, Clone)]
pub enum Mode {
    Scroll,
    LoadMore(Trigger),
    UrlPage(UrlPager),
}

impl Mode {
    fn state(&self) -> PaginationState {
        match self {
            Self::Scroll => PaginationState::ScrollLoop,
            Self::LoadMore(_) => PaginationState::LoadMoreLoop,
            Self::UrlPage(_) => PaginationState::UrlPageLoop,
        }
    }
}

/// What pagination did.
#[derive(Debug, Clone, Default)]
pub struct PaginationOutcome {
    /// Loop iterations performed.
    pub iterations: u32,
    /// Documents loaded beyond the first page.
    pub pages_loaded: u32,
    pub incomplete: bool,
    pub cancelled: bool,
}

pub struct PaginationController<'a> {
    config: &'a PaginationConfig,
    navigation_timeout: Duration,
    cancel: CancellationToken,
    state: PaginationState,
}

impl<'a> PaginationController<'a> {
    pub fn new(
        config: &'a PaginationConfig,
        navigation_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            navigation_timeout,
            cancel,
            state: PaginationState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> PaginationState {
        self.state
    }

    fn enter(&mut self, state: PaginationState) {
        debug!(from = %self.state, to = %state, "pagination state");
        self.state = state;
    }

    fn action_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.action_retries,
            Duration::from_millis(self.config.retry_backoff_ms),
        )
    }

    /// Paginate from the current document. `initial` is the number of
    /// container instances on the first view.
    pub async fn run(
        &mut self,
        session: &dyn BrowserSession,
        plan: &PaginationPlan,
        harvester: &mut Harvester,
        initial: usize,
        diagnostics: &mut Diagnostics,
    ) -> Result<PaginationOutcome> {
        let mut outcome = PaginationOutcome::default();
        self.enter(PaginationState::Detecting);

        let (mode, max_iterations, pause) = match plan {
            PaginationPlan::Disabled => (None, 0, Duration::ZERO),
            PaginationPlan::Declared(spec) => (
                self.declared(session, spec).await?,
                spec.max_iterations.unwrap_or(self.config.default_max_iterations),
                spec.pause,
            ),
            PaginationPlan::AutoDetect => (
                self.detect(session).await?,
                self.config.default_max_iterations,
                self.config.default_pause(),
            ),
        };

        let Some(mode) = mode else {
            debug!("no pagination mechanism");
            self.enter(PaginationState::Done);
            return Ok(outcome);
        };

        info!(mode = ?mode, max_iterations, "paginating");
        self.enter(mode.state());
        match mode {
            Mode::UrlPage(pager) => {
                self.url_loop(
                    session,
                    pager,
                    max_iterations,
                    pause,
                    harvester,
                    diagnostics,
                    &mut outcome,
                )
                .await?;
            }
            mode => {
                self.content_loop(
                    session,
                    &mode,
                    max_iterations,
                    pause,
                    harvester,
                    initial,
                    diagnostics,
                    &mut outcome,
                )
                .await?;
            }
        }
        self.enter(PaginationState::Done);
        Ok(outcome)
    }

    async fn declared(
        &self,
        session: &dyn BrowserSession,
        spec: &PaginationSpec,
    ) -> Result<Option<Mode>> {
        let mode = match spec.pattern {
            PatternType::None => None,
            PatternType::InfiniteScroll => Some(Mode::Scroll),
            PatternType::LoadMore => match &spec.trigger {
                Some(locator) => Some(Mode::LoadMore(Trigger::Selector(locator.clone()))),
                None => self.detect_load_more(session).await?.map(Mode::LoadMore),
            },
            PatternType::UrlBased => match &spec.trigger {
                Some(locator) => Some(Mode::UrlPage(UrlPager::NextLink(locator.clone()))),
                None => {
                    let url = session.current_url().await?;
                    PageCursor::detect(&url, &self.config.page_params)
                        .or_else(|| {
                            self.config
                                .page_params
                                .first()
                                .and_then(|param| PageCursor::starting(&url, param))
                        })
                        .map(|cursor| Mode::UrlPage(UrlPager::Index(cursor)))
                }
            },
        };
        Ok(mode)
    }

    /// Probe the current document: load-more control, then infinite scroll,
    /// then a page-index parameter.
    async fn detect(&self, session: &dyn BrowserSession) -> Result<Option<Mode>> {
        if let Some(trigger) = self.detect_load_more(session).await? {
            return Ok(Some(Mode::LoadMore(trigger)));
        }
        if self.detect_scroll(session).await? {
            return Ok(Some(Mode::Scroll));
        }
        let url = session.current_url().await?;
        Ok(PageCursor::detect(&url, &self.config.page_params)
            .map(|cursor| Mode::UrlPage(UrlPager::Index(cursor))))
    }

    async fn detect_load_more(&self, session: &dyn BrowserSession) -> Result<Option<Trigger>> {
        for selector in &self.config.load_more_selectors {
            let locator = Locator::parse(selector, detect_kind(selector).unwrap_or(SelectorKind::Css));
            let trigger = Trigger::Selector(locator);
            if find_trigger(session, &trigger).await?.is_some() {
                debug!(selector = %selector, "load-more trigger detected");
                return Ok(Some(trigger));
            }
        }

        let pattern = match Regex::new(&self.config.load_more_text_pattern) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(error = %e, "invalid load-more text pattern; text detection skipped");
                return Ok(None);
            }
        };
        let trigger = Trigger::Text(pattern);
        if find_trigger(session, &trigger).await?.is_some() {
            debug!("load-more trigger detected by text");
            return Ok(Some(trigger));
        }
        Ok(None)
    }

    async fn detect_scroll(&self, session: &dyn BrowserSession) -> Result<bool> {
        let before = session.content_metric().await?;
        #[allow(clippy::cast_precision_loss)]
        let tall = before.scroll_height as f64
            > before.viewport_height as f64 * self.config.scroll_growth_ratio;
        if !tall {
            return Ok(false);
        }
        if let Err(e) = session.scroll(ScrollTarget::Bottom).await {
            debug!(error = %e, "probe scroll failed");
            return Ok(false);
        }
        self.pause(self.config.default_pause()).await;
        let after = session.content_metric().await?;
        Ok(after.scroll_height > before.scroll_height)
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn content_loop(
        &mut self,
        session: &dyn BrowserSession,
        mode: &Mode,
        max_iterations: u32,
        pause: Duration,
        harvester: &mut Harvester,
        initial: usize,
        diagnostics: &mut Diagnostics,
        outcome: &mut PaginationOutcome,
    ) -> Result<()> {
        let policy = self.action_policy();
        let mut last_instances = initial;
        let mut stalled = 0u32;
        let mut failed_in_stall = 0u32;

        loop {
            if outcome.iterations >= max_iterations {
                info!(iterations = outcome.iterations, "pagination iteration cap reached");
                break;
            }
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                outcome.incomplete = true;
                break;
            }

            let action = match mode {
                Mode::LoadMore(trigger) => {
                    if find_trigger(session, trigger).await?.is_none() {
                        info!(iterations = outcome.iterations, "load-more trigger gone; content exhausted");
                        break;
                    }
                    policy
                        .run("Load-more click", |_| true, move || click_trigger(session, trigger))
                        .await
                }
                _ => {
                    policy
                        .run("Scroll", |_| true, move || session.scroll(ScrollTarget::Bottom))
                        .await
                }
            };
            outcome.iterations += 1;

            let action_failed = match action {
                Ok(()) => false,
                Err(e) => {
                    warn!(iteration = outcome.iterations, error = %e, "pagination action failed after retries");
                    true
                }
            };
            if !action_failed && !self.pause(pause).await {
                outcome.cancelled = true;
                outcome.incomplete = true;
                break;
            }

            let harvest = harvester.harvest(session, Phase::Paginating, diagnostics).await?;
            let progressed = harvest.instances > last_instances || harvest.appended > 0;
            last_instances = harvest.instances;
            debug!(
                iteration = outcome.iterations,
                instances = harvest.instances,
                appended = harvest.appended,
                progressed,
                "pagination step"
            );

            if progressed {
                stalled = 0;
                failed_in_stall = 0;
                continue;
            }

            stalled += 1;
            if action_failed {
                failed_in_stall += 1;
            }
            if stalled >= self.config.stall_threshold {
                self.enter(PaginationState::Stalled);
                if failed_in_stall == stalled {
                    let err = EngineError::PaginationStall {
                        iterations: outcome.iterations,
                        reason: format!("{stalled} consecutive actions failed"),
                    };
                    diagnostics.report(Phase::Paginating, "pagination", &err);
                    outcome.incomplete = true;
                } else {
                    info!(iterations = outcome.iterations, "no more content; pagination finished");
                }
                break;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn url_loop(
        &mut self,
        session: &dyn BrowserSession,
        mut pager: UrlPager,
        max_iterations: u32,
        pause: Duration,
        harvester: &mut Harvester,
        diagnostics: &mut Diagnostics,
        outcome: &mut PaginationOutcome,
    ) -> Result<()> {
        let policy = self.action_policy();
        let mut visited = HashSet::new();
        visited.insert(session.current_url().await?);

        loop {
            if outcome.iterations >= max_iterations {
                info!(iterations = outcome.iterations, "pagination iteration cap reached");
                break;
            }
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                outcome.incomplete = true;
                break;
            }

            let next = match &mut pager {
                UrlPager::Index(cursor) => Some(cursor.advance()),
                UrlPager::NextLink(locator) => next_link(session, locator).await?,
            };
            let Some(next) = next else {
                info!("no next page link; pagination finished");
                break;
            };
            if !visited.insert(next.clone()) {
                info!(url = %next, "next page already visited; pagination finished");
                break;
            }
            outcome.iterations += 1;

            if let Err(e) = retry::navigate(session, &next, policy, self.navigation_timeout).await {
                diagnostics.push(Diagnostic::from_error(
                    Phase::Paginating,
                    next.clone(),
                    &EngineError::Navigation { url: next, source: e },
                ));
                outcome.incomplete = true;
                break;
            }
            outcome.pages_loaded += 1;

            if !self.pause(pause).await {
                outcome.cancelled = true;
                outcome.incomplete = true;
                break;
            }

            let harvest = harvester.harvest(session, Phase::Paginating, diagnostics).await?;
            debug!(url = %next, appended = harvest.appended, "url page harvested");
            if harvest.appended == 0 {
                info!(url = %next, "page added no records; pagination finished");
                break;
            }
        }
        Ok(())
    }
}

async fn find_trigger(
    session: &dyn BrowserSession,
    trigger: &Trigger,
) -> Result<Option<ElementSnapshot>> {
    let found = match trigger {
        Trigger::Selector(locator) => match session.query(locator, None).await {
            Ok(found) => found,
            Err(BrowserError::InvalidSelector { .. }) => {
                session.query(&locator.reinterpreted(), None).await.ok().flatten()
            }
            Err(e) => return Err(e.into()),
        },
        Trigger::Text(pattern) => session
            .query_all(&Locator::Css(CLICKABLE.to_string()), None)
            .await?
            .into_iter()
            .find(|element| {
                pattern.is_match(&element.text)
                    || element.attr("value").is_some_and(|value| pattern.is_match(value))
            }),
    };
    Ok(found)
}

async fn click_trigger(session: &dyn BrowserSession, trigger: &Trigger) -> sieve_browser::Result<()> {
    let element = match find_trigger(session, trigger).await {
        Ok(Some(element)) => element,
        Ok(None) => return Err(BrowserError::SelectorNotFound("load-more trigger".to_string())),
        Err(EngineError::Browser(e)) => return Err(e),
        Err(e) => return Err(BrowserError::Script(e.to_string())),
    };
    session.click(&element.handle).await
}

async fn next_link(session: &dyn BrowserSession, locator: &Locator) -> Result<Option<String>> {
    let Some(element) = find_trigger(session, &Trigger::Selector(locator.clone())).await? else {
        return Ok(None);
    };
    let href = match element.attr("href") {
        Some(href) => Some(href.to_string()),
        None => session
            .query(&Locator::Css("a[href]".to_string()), Some(&element.handle))
            .await?
            .and_then(|anchor| anchor.attr("href").map(str::to_string)),
    };
    let base = session.current_url().await?;
    Ok(href.and_then(|href| absolutize(&base, &href)))
}
