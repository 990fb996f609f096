//! Extraction orchestrator for template runs.
//!
//! This module provides the `ExtractionOrchestrator` which analyzes a
//! template, performs its setup actions, extracts the first page, drives
//! pagination and the subpage crawler, and folds everything into one
//! `RunResult`. Only a missing required primary container on the first page
//! and a session that fails before any record is collected end a run early;
//! everything else degrades into diagnostics.

use crate::accumulator::SharedAccumulator;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, Phase};
use crate::error::{EngineError, Result};
use crate::harvest::{Harvester, LinkSink, LinkSource};
use crate::link_filter::LinkFilter;
use crate::pagination::PaginationController;
use crate::record::Record;
use crate::resolver::{FieldContext, SelectorResolver};
use crate::retry::{self, RetryPolicy};
use crate::subpage::{CrawlJob, CrawlReport, SubpageCrawler};
use serde::Serialize;
use sieve_browser::{
    BrowserError, BrowserSession, ChromiumSession, Locator, ScrollTarget, StaticSession,
    WaitCondition,
};
use sieve_core::{BrowserConfig, RunId, SieveConfig, Timestamp};
use sieve_template::{analyze, ActionSpec, ActionType, CrawlPlan, ExtractionPlan, Template};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retries for the initial navigation to the template URL.
const INITIAL_NAVIGATION_RETRIES: u32 = 2;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Analyzing,
    Extracting,
    Paginating,
    Crawling,
    Merging,
    Complete,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: RunId,
    /// Template name, or its URL when unnamed.
    pub template: String,
    /// One record per primary-container instance, or the single page record.
    pub records: Vec<Record>,
    /// Top-level fields outside the primary container of a directory template.
    pub page_fields: Record,
    /// Documents loaded on the main session.
    pub pages_processed: u32,
    pub subpages_processed: usize,
    /// Set when any unit of work was skipped, failed or cancelled.
    pub incomplete: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl RunResult {
    /// Diagnostics of one kind.
    pub fn diagnostics_of(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind == kind)
    }
}

/// The sessions a run drives.
///
/// The main session belongs to extraction and pagination. The crawler uses
/// the secondary session concurrently when one is given, otherwise it runs on
/// the main session after pagination has finished.
#[derive(Clone)]
pub struct Sessions {
    pub main: Arc<dyn BrowserSession>,
    pub secondary: Option<Arc<dyn BrowserSession>>,
}

impl Sessions {
    #[must_use]
    pub fn single(main: Arc<dyn BrowserSession>) -> Self {
        Self {
            main,
            secondary: None,
        }
    }

    #[must_use]
    pub fn dual(main: Arc<dyn BrowserSession>, secondary: Arc<dyn BrowserSession>) -> Self {
        Self {
            main,
            secondary: Some(secondary),
        }
    }

    /// A static session and a fork of it over the same page source.
    #[must_use]
    pub fn from_static(main: StaticSession) -> Self {
        let secondary = main.fork();
        Self::dual(Arc::new(main), Arc::new(secondary))
    }

    /// Two tabs of one freshly launched Chromium.
    pub async fn chromium(config: BrowserConfig) -> Result<Self> {
        let main = ChromiumSession::launch(config).await?;
        let secondary = main.open_secondary().await?;
        Ok(Self::dual(Arc::new(main), Arc::new(secondary)))
    }

    /// Plain HTTP fetching, for server-rendered sites.
    pub fn http(config: &BrowserConfig) -> Result<Self> {
        Ok(Self::from_static(StaticSession::http(config)?))
    }
}

/// Orchestrates template runs.
pub struct ExtractionOrchestrator {
    /// Engine settings
    config: SieveConfig,
    /// Shared by extraction, pagination and the crawler
    resolver: Arc<SelectorResolver>,
}

impl ExtractionOrchestrator {
    /// Create an orchestrator with the default fallback chain for `config`.
    #[must_use]
    pub fn new(config: SieveConfig) -> Self {
        let resolver = Arc::new(SelectorResolver::new(&config.resolver));
        Self { config, resolver }
    }

    /// Use a custom resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: SelectorResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    #[must_use]
    pub fn config(&self) -> &SieveConfig {
        &self.config
    }

    /// Browser settings for `template`, with its session overrides applied.
    #[must_use]
    pub fn browser_config_for(&self, template: &Template) -> BrowserConfig {
        let mut config = self.config.browser.clone();
        let options = &template.session;
        if let Some(headless) = options.headless {
            config.headless = headless;
        }
        if let Some(user_agent) = &options.user_agent {
            config.user_agent = Some(user_agent.clone());
        }
        if let Some(seconds) = options.page_load_timeout.filter(|s| s.is_finite() && *s > 0.0) {
            config.navigation_timeout_ms = millis(seconds);
        }
        if let Some(seconds) = options.wait_timeout.filter(|s| s.is_finite() && *s > 0.0) {
            config.wait_timeout_ms = millis(seconds);
        }
        config
    }

    /// Run `template` to completion.
    ///
    /// Fails only when the template cannot be analyzed, the first navigation
    /// fails, or a required primary container has no instances on the first
    /// page. Every other problem is reported in [`RunResult::diagnostics`].
    pub async fn run(
        &self,
        template: &Template,
        sessions: Sessions,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        let mut run = Run::new(template.display_name().to_string());
        run.enter(RunState::Analyzing);

        let plan = match analyze(template, &self.config.pagination) {
            Ok(plan) => plan,
            Err(e) => {
                run.enter(RunState::Failed);
                return Err(e.into());
            }
        };
        for repair in &plan.repairs {
            let err = EngineError::TemplateInconsistency {
                subject: repair.subject.clone(),
                message: repair.message.clone(),
            };
            run.diagnostics.report(Phase::Analyzing, repair.subject.clone(), &err);
        }

        match self.execute(&mut run, &plan, sessions, cancel).await {
            Ok(()) => {
                run.enter(RunState::Complete);
                Ok(run.finish())
            }
            Err(e) => {
                run.enter(RunState::Failed);
                warn!(run_id = %run.id.as_str(), error = %e, "run failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run: &mut Run,
        plan: &ExtractionPlan,
        sessions: Sessions,
        cancel: CancellationToken,
    ) -> Result<()> {
        let browser = &self.config.browser;
        let main = Arc::clone(&sessions.main);

        let policy = RetryPolicy::new(
            INITIAL_NAVIGATION_RETRIES,
            Duration::from_millis(self.config.subpage.retry_backoff_ms),
        );
        retry::navigate(main.as_ref(), &plan.url, policy, browser.navigation_timeout())
            .await
            .map_err(EngineError::Session)?;
        run.pages_processed = 1;

        self.perform_actions(main.as_ref(), &plan.actions, &mut run.diagnostics, &cancel)
            .await;

        run.enter(RunState::Extracting);
        let accumulator = SharedAccumulator::new();
        let ctx = FieldContext::new(current_url(main.as_ref(), &plan.url).await, Phase::Extracting);

        let crawl = match (&plan.crawl, plan.primary()) {
            (Some(crawl), Some(primary)) => {
                let source = match &crawl.link_field {
                    Some(label) => LinkSource::Field(label.clone()),
                    None => LinkSource::Instance,
                };
                let (page_fields, found) = self
                    .resolver
                    .resolve_record(main.as_ref(), plan.page_fields(), &ctx)
                    .await
                    .map_err(session_failure)?;
                run.page_fields = page_fields;
                run.diagnostics.extend(found);

                let crawler = self.crawler(plan, crawl, &accumulator, &cancel);
                let (sink, handle) = match &sessions.secondary {
                    Some(secondary) => {
                        let (sender, receiver) =
                            mpsc::channel(self.config.subpage.channel_capacity.max(1));
                        let handle = tokio::spawn(crawler.run(Arc::clone(secondary), receiver));
                        (LinkSink::Channel(sender), Some(handle))
                    }
                    None => (LinkSink::Deferred(Vec::new()), None),
                };
                let harvester = Harvester::new(
                    Arc::clone(&self.resolver),
                    primary.clone(),
                    accumulator.clone(),
                )
                .with_links(source, sink);
                self.directory(run, plan, &main, harvester, handle, crawl, &accumulator, &cancel)
                    .await?;
                true
            }
            (None, Some(primary)) => {
                let (page_fields, found) = self
                    .resolver
                    .resolve_record(main.as_ref(), plan.page_fields(), &ctx)
                    .await
                    .map_err(session_failure)?;
                run.page_fields = page_fields;
                run.diagnostics.extend(found);

                let harvester =
                    Harvester::new(Arc::clone(&self.resolver), primary.clone(), accumulator.clone());
                self.paginate(run, plan, &main, harvester, &cancel).await?;
                false
            }
            (crawl, None) => {
                let (record, found) = self
                    .resolver
                    .resolve_record(main.as_ref(), &plan.elements, &ctx)
                    .await
                    .map_err(session_failure)?;
                run.diagnostics.extend(found);
                let jobs = crawl
                    .as_ref()
                    .map(|crawl| single_page_links(&record, crawl))
                    .unwrap_or_default();
                let id = accumulator.append(record).await;

                if let Some(crawl) = crawl {
                    run.enter(RunState::Crawling);
                    let jobs = jobs
                        .into_iter()
                        .map(|link| CrawlJob { record: id, link })
                        .collect();
                    let session = sessions.secondary.clone().unwrap_or_else(|| Arc::clone(&main));
                    let report = self
                        .crawler(plan, crawl, &accumulator, &cancel)
                        .run_jobs(session, jobs)
                        .await;
                    run.absorb(report);
                }
                crawl.is_some()
            }
        };
        debug!(crawled = crawl, "extraction phases finished");

        run.enter(RunState::Merging);
        run.records = accumulator.snapshot().await;
        if cancel.is_cancelled() {
            run.incomplete = true;
            run.diagnostics.push(Diagnostic::new(
                Phase::Merging,
                DiagnosticKind::Cancelled,
                "run",
                "run cancelled; results are partial",
            ));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn directory(
        &self,
        run: &mut Run,
        plan: &ExtractionPlan,
        main: &Arc<dyn BrowserSession>,
        harvester: Harvester,
        handle: Option<JoinHandle<CrawlReport>>,
        crawl: &CrawlPlan,
        accumulator: &SharedAccumulator,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sink = self.paginate(run, plan, main, harvester, cancel).await?;

        run.enter(RunState::Crawling);
        let report = match (sink, handle) {
            (LinkSink::Channel(sender), Some(handle)) => {
                drop(sender);
                match handle.await {
                    Ok(report) => report,
                    Err(e) => {
                        run.incomplete = true;
                        run.diagnostics.push(Diagnostic::new(
                            Phase::Crawling,
                            DiagnosticKind::SubpageMerge,
                            "subpages",
                            format!("crawler task failed: {e}"),
                        ));
                        return Ok(());
                    }
                }
            }
            (LinkSink::Deferred(jobs), _) => {
                self.crawler(plan, crawl, accumulator, cancel)
                    .run_jobs(Arc::clone(main), jobs)
                    .await
            }
            _ => CrawlReport::default(),
        };
        run.absorb(report);
        Ok(())
    }

    /// Harvest the first page, then paginate. Returns the harvester's link sink.
    async fn paginate(
        &self,
        run: &mut Run,
        plan: &ExtractionPlan,
        main: &Arc<dyn BrowserSession>,
        mut harvester: Harvester,
        cancel: &CancellationToken,
    ) -> Result<LinkSink> {
        let first = harvester
            .harvest(main.as_ref(), Phase::Extracting, &mut run.diagnostics)
            .await
            .map_err(session_failure)?;

        if first.instances == 0 {
            if let Some(primary) = plan.primary().filter(|primary| primary.is_required) {
                return Err(EngineError::ContainerNotFound {
                    label: primary.label.to_string(),
                    url: plan.url.clone(),
                });
            }
        }
        info!(instances = first.instances, "first page extracted");

        run.enter(RunState::Paginating);
        let mut controller = PaginationController::new(
            &self.config.pagination,
            self.config.browser.navigation_timeout(),
            cancel.clone(),
        );
        match controller
            .run(
                main.as_ref(),
                &plan.pagination,
                &mut harvester,
                first.instances,
                &mut run.diagnostics,
            )
            .await
        {
            Ok(outcome) => {
                run.pages_processed += outcome.pages_loaded;
                run.incomplete |= outcome.incomplete;
            }
            Err(e) => {
                run.incomplete = true;
                run.diagnostics.report(Phase::Paginating, "pagination", &e);
            }
        }
        Ok(harvester.into_sink())
    }

    fn crawler(
        &self,
        plan: &ExtractionPlan,
        crawl: &CrawlPlan,
        accumulator: &SharedAccumulator,
        cancel: &CancellationToken,
    ) -> SubpageCrawler {
        SubpageCrawler::new(
            Arc::clone(&self.resolver),
            crawl.subpage_elements.clone(),
            LinkFilter::new(&plan.url, plan.subpage_allow_pattern.clone()),
            self.config.subpage.clone(),
            plan.max_subpages.or(self.config.subpage.max_subpages),
            self.config.browser.navigation_timeout(),
            accumulator.clone(),
            cancel.clone(),
        )
    }

    async fn perform_actions(
        &self,
        session: &dyn BrowserSession,
        actions: &[ActionSpec],
        diagnostics: &mut Diagnostics,
        cancel: &CancellationToken,
    ) {
        for action in actions {
            if cancel.is_cancelled() {
                return;
            }
            debug!(label = %action.label, action = ?action.action, "performing action");
            if let Err(e) = self.perform(session, action).await {
                let err = EngineError::Action {
                    label: action.label.clone(),
                    reason: e.to_string(),
                };
                diagnostics.report(Phase::Actions, action.label.clone(), &err);
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(action.wait_after) => {}
            }
        }
    }

    async fn perform(
        &self,
        session: &dyn BrowserSession,
        action: &ActionSpec,
    ) -> std::result::Result<(), BrowserError> {
        match action.action {
            ActionType::Click => {
                let element = find_target(session, action.locator.as_ref()).await?;
                session.click(&element.handle).await
            }
            ActionType::Type => {
                let element = find_target(session, action.locator.as_ref()).await?;
                session
                    .type_text(&element.handle, action.value.as_deref().unwrap_or_default())
                    .await
            }
            ActionType::Scroll => {
                let target = action
                    .value
                    .as_deref()
                    .and_then(|value| value.trim().parse::<i64>().ok())
                    .map_or(ScrollTarget::Bottom, ScrollTarget::By);
                session.scroll(target).await
            }
            ActionType::Wait => match &action.locator {
                Some(locator) => {
                    session
                        .wait_for(
                            &WaitCondition::Present(locator.clone()),
                            self.config.browser.wait_timeout(),
                        )
                        .await
                }
                None => Ok(()),
            },
        }
    }
}

/// Mutable state of one run.
struct Run {
    id: RunId,
    template: String,
    state: RunState,
    started_at: Timestamp,
    page_fields: Record,
    records: Vec<Record>,
    pages_processed: u32,
    subpages_processed: usize,
    incomplete: bool,
    diagnostics: Diagnostics,
}

impl Run {
    fn new(template: String) -> Self {
        let id = RunId::generate();
        info!(run_id = %id.as_str(), template = %template, "run started");
        Self {
            id,
            template,
            state: RunState::Init,
            started_at: Timestamp::now(),
            page_fields: Record::new(),
            records: Vec::new(),
            pages_processed: 0,
            subpages_processed: 0,
            incomplete: false,
            diagnostics: Diagnostics::new(),
        }
    }

    fn enter(&mut self, state: RunState) {
        debug!(run_id = %self.id.as_str(), from = %self.state, to = %state, "run state");
        self.state = state;
    }

    fn absorb(&mut self, report: CrawlReport) {
        self.subpages_processed += report.subpages_processed;
        self.incomplete |= report.incomplete;
        self.diagnostics.extend(report.diagnostics);
    }

    fn finish(self) -> RunResult {
        let finished_at = Timestamp::now();
        info!(
            run_id = %self.id.as_str(),
            records = self.records.len(),
            pages = self.pages_processed,
            subpages = self.subpages_processed,
            incomplete = self.incomplete,
            diagnostics = self.diagnostics.len(),
            elapsed_ms = self.started_at.millis_until(&finished_at),
            "run complete"
        );
        RunResult {
            run_id: self.id,
            template: self.template,
            records: self.records,
            page_fields: self.page_fields,
            pages_processed: self.pages_processed,
            subpages_processed: self.subpages_processed,
            incomplete: self.incomplete,
            diagnostics: self.diagnostics.into_vec(),
            started_at: self.started_at,
            finished_at,
        }
    }
}

/// Browser failures before any record exists end the run.
fn session_failure(err: EngineError) -> EngineError {
    match err {
        EngineError::Browser(e) => EngineError::Session(e),
        other => other,
    }
}

async fn current_url(session: &dyn BrowserSession, fallback: &str) -> String {
    session
        .current_url()
        .await
        .unwrap_or_else(|_| fallback.to_string())
}

async fn find_target(
    session: &dyn BrowserSession,
    locator: Option<&Locator>,
) -> std::result::Result<sieve_browser::ElementSnapshot, BrowserError> {
    let locator =
        locator.ok_or_else(|| BrowserError::SelectorNotFound("action has no selector".to_string()))?;
    let found = match session.query(locator, None).await {
        Err(BrowserError::InvalidSelector { .. }) => {
            session.query(&locator.reinterpreted(), None).await?
        }
        other => other?,
    };
    found.ok_or_else(|| BrowserError::SelectorNotFound(locator.to_string()))
}

/// Detail links of a single-page record, in field order.
fn single_page_links(record: &Record, crawl: &CrawlPlan) -> Vec<String> {
    let Some(label) = &crawl.link_field else {
        return Vec::new();
    };
    let mut links: Vec<String> = Vec::new();
    for link in record
        .get(label.as_str())
        .map(|value| value.strings().map(str::to_string).collect::<Vec<_>>())
        .unwrap_or_default()
    {
        if !links.contains(&link) {
            links.push(link);
        }
    }
    links
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn millis(seconds: f64) -> u64 {
    (seconds * 1000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use sieve_browser::FixtureSite;
    use sieve_core::{PaginationConfig, SubpageConfig};

    const URL: &str = "https://example.com/directory";

    fn quiet_config() -> SieveConfig {
        SieveConfig {
            pagination: PaginationConfig {
                retry_backoff_ms: 0,
                default_pause_ms: 0,
                ..PaginationConfig::default()
            },
            subpage: SubpageConfig {
                inter_navigation_delay_ms: 0,
                retry_backoff_ms: 0,
                ..SubpageConfig::default()
            },
            ..SieveConfig::default()
        }
    }

    fn template(json: &str) -> Template {
        Template::from_json(json).expect("valid template")
    }

    #[tokio::test]
    async fn test_single_page_record_with_actions() {
        let site = FixtureSite::new().with_page(
            URL,
            r#"<html><body><h1>Firm</h1><p class="phone">555</p></body></html>"#,
        );
        let sessions = Sessions::from_static(StaticSession::new(Arc::new(site)));
        let template = template(&format!(
            r#"{{
                "url": "{URL}",
                "elements": [
                    {{"label": "name", "selector": "h1"}},
                    {{"label": "phone", "selector": ".phone"}}
                ],
                "actions": [
                    {{"label": "consent", "selector": "button.accept", "actionType": "click", "waitAfterSeconds": 0}}
                ]
            }}"#
        ));

        let result = ExtractionOrchestrator::new(quiet_config())
            .run(&template, sessions, CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(result.records.len(), 1);
        assert_eq!(
            result.records[0].get("name").and_then(Value::as_scalar),
            Some("Firm")
        );
        assert_eq!(result.diagnostics_of(DiagnosticKind::Action).count(), 1);
        assert_eq!(result.pages_processed, 1);
    }

    #[tokio::test]
    async fn test_first_navigation_failure_is_fatal() {
        let site = FixtureSite::new().with_failure(URL, "connection refused");
        let sessions = Sessions::single(Arc::new(StaticSession::new(Arc::new(site))));
        let template = template(&format!(
            r#"{{"url": "{URL}", "elements": [{{"label": "name", "selector": "h1"}}]}}"#
        ));
        let mut config = quiet_config();
        config.subpage.retry_backoff_ms = 0;

        let err = ExtractionOrchestrator::new(config)
            .run(&template, sessions, CancellationToken::new())
            .await
            .expect_err("navigation fails");
        assert!(matches!(err, EngineError::Session(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_browser_config_overrides() {
        let template = template(
            r#"{"url": "https://example.com", "elements": [{"label": "a", "selector": "a"}],
                "headless": false, "userAgent": "sieve-test", "pageLoadTimeout": 12.5}"#,
        );
        let config = ExtractionOrchestrator::new(SieveConfig::default()).browser_config_for(&template);
        assert!(!config.headless);
        assert_eq!(config.user_agent.as_deref(), Some("sieve-test"));
        assert_eq!(config.navigation_timeout_ms, 12_500);
    }

    #[test]
    fn test_single_page_links_dedup() {
        let mut record = Record::new();
        record.insert(
            "links",
            Value::List(vec!["https://a/1".into(), "https://a/1".into(), "https://a/2".into()]),
        );
        let crawl = CrawlPlan {
            link_field: Some(sieve_core::Label::new("links").expect("valid label")),
            subpage_elements: Vec::new(),
        };
        assert_eq!(single_page_links(&record, &crawl), vec!["https://a/1", "https://a/2"]);
    }
}
