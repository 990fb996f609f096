//! Subpage crawler.
//!
//! Detail links arrive over a channel in parent-record order and are visited
//! one at a time on a session the pagination loop never touches. Whatever a
//! detail page yields is merged into its parent with fill-only semantics, so
//! a failed or skipped link leaves the parent exactly as collected.

use crate::accumulator::{RecordId, SharedAccumulator};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, Phase};
use crate::error::EngineError;
use crate::link_filter::LinkFilter;
use crate::record::Record;
use crate::resolver::{FieldContext, SelectorResolver};
use crate::retry::{self, RetryPolicy};
use sieve_browser::BrowserSession;
use sieve_core::SubpageConfig;
use sieve_template::ElementSpec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A detail link owed to a collected record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlJob {
    pub record: RecordId,
    pub link: String,
}

/// Outcome of a crawl.
#[derive(Debug, Default)]
pub struct CrawlReport {
    /// Detail pages visited and merged.
    pub subpages_processed: usize,
    /// Links dropped by the filter or the visit cap.
    pub skipped: usize,
    /// Links whose visit or extraction failed.
    pub failed: usize,
    pub diagnostics: Vec<Diagnostic>,
    pub incomplete: bool,
    pub cancelled: bool,
}

pub struct SubpageCrawler {
    resolver: Arc<SelectorResolver>,
    fields: Vec<ElementSpec>,
    filter: LinkFilter,
    config: SubpageConfig,
    max_subpages: Option<usize>,
    navigation_timeout: Duration,
    accumulator: SharedAccumulator,
    cancel: CancellationToken,
}

/// Cached result of one link, shared by every record that carries it.
enum Visit {
    Merged(Record),
    Failed,
}

impl SubpageCrawler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<SelectorResolver>,
        fields: Vec<ElementSpec>,
        filter: LinkFilter,
        config: SubpageConfig,
        max_subpages: Option<usize>,
        navigation_timeout: Duration,
        accumulator: SharedAccumulator,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            fields,
            filter,
            config,
            max_subpages,
            navigation_timeout,
            accumulator,
            cancel,
        }
    }

    /// Process jobs until the channel closes.
    ///
    /// After cancellation or abandonment the remaining jobs are drained
    /// without visiting so the sending side never blocks.
    pub async fn run(
        self,
        session: Arc<dyn BrowserSession>,
        mut jobs: mpsc::Receiver<CrawlJob>,
    ) -> CrawlReport {
        let mut report = CrawlReport::default();
        let mut diagnostics = Diagnostics::new();
        let mut visited: HashMap<String, Visit> = HashMap::new();
        let mut consecutive_failures = 0u32;
        let mut navigations = 0usize;
        let mut stopped = false;
        let mut capped = false;

        while let Some(job) = jobs.recv().await {
            if stopped {
                continue;
            }
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                report.incomplete = true;
                stopped = true;
                continue;
            }

            if let Err(reason) = self.filter.check(&job.link) {
                debug!(link = %job.link, %reason, "skipping subpage link");
                report.skipped += 1;
                continue;
            }

            match visited.get(&job.link) {
                Some(Visit::Merged(detail)) => {
                    self.accumulator.merge_fill(job.record, detail).await;
                    continue;
                }
                Some(Visit::Failed) => continue,
                None => {}
            }

            if self.max_subpages.is_some_and(|max| navigations >= max) {
                if !capped {
                    info!(max = ?self.max_subpages, "subpage cap reached; remaining links are not visited");
                    capped = true;
                }
                report.skipped += 1;
                continue;
            }

            if navigations > 0 {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        report.cancelled = true;
                        report.incomplete = true;
                        stopped = true;
                        continue;
                    }
                    () = tokio::time::sleep(self.config.inter_navigation_delay()) => {}
                }
            }
            navigations += 1;

            match self.visit(session.as_ref(), &job.link, &mut diagnostics).await {
                Ok(detail) => {
                    consecutive_failures = 0;
                    let filled = self
                        .accumulator
                        .merge_fill(job.record, &detail)
                        .await
                        .unwrap_or_default();
                    debug!(link = %job.link, filled, "subpage merged");
                    report.subpages_processed += 1;
                    visited.insert(job.link, Visit::Merged(detail));
                }
                Err(err) => {
                    consecutive_failures += 1;
                    report.failed += 1;
                    report.incomplete = true;
                    diagnostics.push(
                        Diagnostic::from_error(Phase::Crawling, job.link.clone(), &err)
                            .on_page(job.link.clone()),
                    );
                    visited.insert(job.link, Visit::Failed);

                    if consecutive_failures >= self.config.max_consecutive_failures {
                        diagnostics.push(Diagnostic::new(
                            Phase::Crawling,
                            DiagnosticKind::SubpageMerge,
                            "subpages",
                            format!(
                                "abandoning remaining links after {consecutive_failures} consecutive failures"
                            ),
                        ));
                        stopped = true;
                    }
                }
            }
        }

        info!(
            processed = report.subpages_processed,
            failed = report.failed,
            skipped = report.skipped,
            "subpage crawl finished"
        );
        report.diagnostics = diagnostics.into_vec();
        report
    }

    /// Crawl a fixed list of jobs on `session`.
    pub async fn run_jobs(
        self,
        session: Arc<dyn BrowserSession>,
        jobs: Vec<CrawlJob>,
    ) -> CrawlReport {
        let (sender, receiver) = mpsc::channel(jobs.len().max(1));
        for job in jobs {
            if sender.try_send(job).is_err() {
                break;
            }
        }
        drop(sender);
        self.run(session, receiver).await
    }

    async fn visit(
        &self,
        session: &dyn BrowserSession,
        link: &str,
        diagnostics: &mut Diagnostics,
    ) -> Result<Record, EngineError> {
        let policy = RetryPolicy::new(
            self.config.navigation_retries,
            Duration::from_millis(self.config.retry_backoff_ms),
        );
        retry::navigate(session, link, policy, self.navigation_timeout)
            .await
            .map_err(|e| EngineError::SubpageMerge {
                link: link.to_string(),
                reason: e.to_string(),
            })?;

        let ctx = FieldContext::new(link, Phase::Crawling);
        let (detail, field_diagnostics) = self
            .resolver
            .resolve_record(session, &self.fields, &ctx)
            .await
            .map_err(|e| EngineError::SubpageMerge {
                link: link.to_string(),
                reason: e.to_string(),
            })?;

        if detail.has_no_data() {
            return Err(EngineError::SubpageMerge {
                link: link.to_string(),
                reason: "no subpage field resolved".to_string(),
            });
        }

        diagnostics.extend(field_diagnostics);
        Ok(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use sieve_browser::{FixtureSite, Locator, StaticSession};
    use sieve_core::{Label, ResolverConfig, SelectorKind};
    use sieve_template::FieldKind;

    const START: &str = "https://example.com/people";

    fn bio() -> ElementSpec {
        ElementSpec {
            label: Label::new("bio").expect("valid label"),
            locator: Locator::new(".bio", SelectorKind::Css),
            kind: FieldKind::Text,
            is_multiple: false,
            is_required: true,
            follow_links: false,
            subpage_elements: Vec::new(),
        }
    }

    fn config() -> SubpageConfig {
        SubpageConfig {
            inter_navigation_delay_ms: 0,
            retry_backoff_ms: 0,
            navigation_retries: 1,
            ..SubpageConfig::default()
        }
    }

    fn crawler(accumulator: &SharedAccumulator, config: SubpageConfig) -> SubpageCrawler {
        SubpageCrawler::new(
            Arc::new(SelectorResolver::new(&ResolverConfig::default())),
            vec![bio()],
            LinkFilter::new(START, None),
            config,
            None,
            Duration::from_secs(5),
            accumulator.clone(),
            CancellationToken::new(),
        )
    }

    fn parent(name: &str) -> Record {
        let mut record = Record::new();
        record.insert("name", Value::Scalar(name.to_string()));
        record
    }

    fn detail(text: &str) -> String {
        format!("<html><body><p class=\"bio\">{text}</p></body></html>")
    }

    #[tokio::test]
    async fn test_failed_link_keeps_parent_and_reports() {
        let site = Arc::new(
            FixtureSite::new()
                .with_page("https://example.com/p/1", detail("first"))
                .with_timeout("https://example.com/p/2")
                .with_page("https://example.com/p/3", detail("third")),
        );
        let session: Arc<dyn BrowserSession> = Arc::new(StaticSession::new(site.clone()));
        let accumulator = SharedAccumulator::new();
        let mut jobs = Vec::new();
        for n in 1..=3 {
            let record = accumulator.append(parent(&format!("p{n}"))).await;
            jobs.push(CrawlJob {
                record,
                link: format!("https://example.com/p/{n}"),
            });
        }

        let report = crawler(&accumulator, config()).run_jobs(session, jobs).await;
        assert_eq!(report.subpages_processed, 2);
        assert_eq!(report.failed, 1);
        assert!(report.incomplete);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].kind, DiagnosticKind::SubpageMerge);
        assert_eq!(site.stats("https://example.com/p/2").visits, 2);

        let records = accumulator.snapshot().await;
        assert_eq!(records[0].get("bio").and_then(Value::as_scalar), Some("first"));
        assert_eq!(records[1], parent("p2"));
        assert_eq!(records[2].get("bio").and_then(Value::as_scalar), Some("third"));
    }

    #[tokio::test]
    async fn test_shared_link_visited_once() {
        let site = Arc::new(FixtureSite::new().with_page("https://example.com/p/1", detail("shared")));
        let session: Arc<dyn BrowserSession> = Arc::new(StaticSession::new(site.clone()));
        let accumulator = SharedAccumulator::new();
        let a = accumulator.append(parent("a")).await;
        let b = accumulator.append(parent("b")).await;
        let link = "https://example.com/p/1".to_string();

        let report = crawler(&accumulator, config())
            .run_jobs(
                session,
                vec![
                    CrawlJob { record: a, link: link.clone() },
                    CrawlJob { record: b, link },
                    CrawlJob { record: b, link: "mailto:x@example.com".to_string() },
                ],
            )
            .await;
        assert_eq!(site.stats("https://example.com/p/1").visits, 1);
        assert_eq!(report.subpages_processed, 1);
        assert_eq!(report.skipped, 1);
        assert!(!report.incomplete);
        for record in accumulator.snapshot().await {
            assert_eq!(record.get("bio").and_then(Value::as_scalar), Some("shared"));
        }
    }

    #[tokio::test]
    async fn test_consecutive_failures_abandon_queue() {
        let mut site = FixtureSite::new();
        for n in 1..=4 {
            site = site.with_failure(&format!("https://example.com/p/{n}"), "500");
        }
        let site = Arc::new(site.with_page("https://example.com/p/5", detail("late")));
        let session: Arc<dyn BrowserSession> = Arc::new(StaticSession::new(site.clone()));
        let accumulator = SharedAccumulator::new();
        let mut jobs = Vec::new();
        for n in 1..=5 {
            let record = accumulator.append(parent(&format!("p{n}"))).await;
            jobs.push(CrawlJob {
                record,
                link: format!("https://example.com/p/{n}"),
            });
        }

        let config = SubpageConfig {
            max_consecutive_failures: 2,
            navigation_retries: 0,
            ..config()
        };
        let report = crawler(&accumulator, config).run_jobs(session, jobs).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.subpages_processed, 0);
        assert_eq!(site.stats("https://example.com/p/5").visits, 0);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.message.contains("abandoning remaining links")));
    }

    #[tokio::test]
    async fn test_visit_cap() {
        let site = Arc::new(
            FixtureSite::new()
                .with_page("https://example.com/p/1", detail("one"))
                .with_page("https://example.com/p/2", detail("two")),
        );
        let session: Arc<dyn BrowserSession> = Arc::new(StaticSession::new(site.clone()));
        let accumulator = SharedAccumulator::new();
        let a = accumulator.append(parent("a")).await;
        let b = accumulator.append(parent("b")).await;

        let mut crawler = crawler(&accumulator, config());
        crawler.max_subpages = Some(1);
        let report = crawler
            .run_jobs(
                session,
                vec![
                    CrawlJob { record: a, link: "https://example.com/p/1".into() },
                    CrawlJob { record: b, link: "https://example.com/p/2".into() },
                ],
            )
            .await;
        assert_eq!(report.subpages_processed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(site.total_visits(), 1);
    }
}
