//! Collecting primary-container records from the main session.
//!
//! Each harvest re-extracts the whole current document, appends only records
//! not seen in an earlier view, and hands their detail links to the crawler.

use crate::accumulator::{RecordId, SharedAccumulator};
use crate::diagnostics::{Diagnostics, Phase};
use crate::error::Result;
use crate::record::Record;
use crate::resolver::{FieldContext, Instance, SelectorResolver};
use crate::subpage::CrawlJob;
use sieve_browser::BrowserSession;
use sieve_core::Label;
use sieve_template::ElementSpec;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Where detail links of new records go.
#[derive(Debug)]
pub enum LinkSink {
    /// Nothing is crawled.
    Discard,
    /// Streamed to a crawler running on its own session.
    Channel(mpsc::Sender<CrawlJob>),
    /// Held until pagination ends, then crawled on the main session.
    Deferred(Vec<CrawlJob>),
}

impl LinkSink {
    async fn dispatch(&mut self, job: CrawlJob) {
        match self {
            Self::Discard => {}
            Self::Channel(sender) => {
                if let Err(e) = sender.send(job).await {
                    debug!(link = %e.0.link, "crawler stopped; link not queued");
                }
            }
            Self::Deferred(jobs) => jobs.push(job),
        }
    }
}

/// Which value of a record is its detail link.
#[derive(Debug, Clone)]
pub enum LinkSource {
    /// The container instance's own link.
    Instance,
    /// The first link held by this field.
    Field(Label),
}

/// Counts from one harvest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Harvest {
    /// Container instances in the current document.
    pub instances: usize,
    /// Records appended by this harvest.
    pub appended: usize,
}

pub struct Harvester {
    resolver: Arc<SelectorResolver>,
    primary: ElementSpec,
    links: Option<LinkSource>,
    accumulator: SharedAccumulator,
    sink: LinkSink,
}

impl Harvester {
    pub fn new(
        resolver: Arc<SelectorResolver>,
        primary: ElementSpec,
        accumulator: SharedAccumulator,
    ) -> Self {
        Self {
            resolver,
            primary,
            links: None,
            accumulator,
            sink: LinkSink::Discard,
        }
    }

    /// Forward the detail link of every new record to `sink`.
    #[must_use]
    pub fn with_links(mut self, source: LinkSource, sink: LinkSink) -> Self {
        self.links = Some(source);
        self.sink = sink;
        self
    }

    /// Re-extract the current document of `session`.
    pub async fn harvest(
        &mut self,
        session: &dyn BrowserSession,
        phase: Phase,
        diagnostics: &mut Diagnostics,
    ) -> Result<Harvest> {
        let page_url = session.current_url().await?;
        let ctx = FieldContext::new(page_url, phase);
        let instance_links = matches!(self.links, Some(LinkSource::Instance));
        let matched = self
            .resolver
            .resolve_instances(session, &self.primary, None, &ctx, instance_links)
            .await?;
        diagnostics.extend(matched.diagnostics);

        let instances = matched.instances.len();
        let (records, extras): (Vec<_>, Vec<_>) = matched
            .instances
            .into_iter()
            .map(|Instance { record, link, diagnostics: found }| (record, (link, found)))
            .unzip();
        let links_by_record: Vec<Option<String>> = records
            .iter()
            .zip(&extras)
            .map(|(record, (link, _))| self.link_of(record, link.as_deref()))
            .collect();

        let ids = self.accumulator.append_batch(records).await;
        let mut appended = 0;
        let fresh = ids.into_iter().zip(extras).zip(links_by_record);
        for ((id, (_, found)), link) in fresh {
            let Some(id) = id else { continue };
            appended += 1;
            diagnostics.extend(found);
            self.queue(id, link).await;
        }

        trace!(instances, appended, "harvested page");
        Ok(Harvest { instances, appended })
    }

    fn link_of(&self, record: &Record, instance_link: Option<&str>) -> Option<String> {
        match self.links.as_ref()? {
            LinkSource::Instance => instance_link.map(str::to_string),
            LinkSource::Field(label) => record
                .get(label.as_str())
                .and_then(|value| value.strings().next())
                .map(str::to_string),
        }
    }

    async fn queue(&mut self, record: RecordId, link: Option<String>) {
        match link {
            Some(link) => self.sink.dispatch(CrawlJob { record, link }).await,
            None if self.links.is_some() => {
                trace!(record = record.index(), "record has no detail link");
            }
            None => {}
        }
    }

    /// Give up the link sink, closing a crawler channel.
    #[must_use]
    pub fn into_sink(self) -> LinkSink {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use sieve_browser::{FixtureSite, Locator, StaticSession};
    use sieve_core::{ResolverConfig, SelectorKind};
    use sieve_template::FieldKind;

    const URL: &str = "https://example.com/team";

    fn spec(label: &str, selector: &str, kind: FieldKind) -> ElementSpec {
        ElementSpec {
            label: Label::new(label).expect("valid label"),
            locator: Locator::new(selector, SelectorKind::Css),
            kind,
            is_multiple: false,
            is_required: true,
            follow_links: false,
            subpage_elements: Vec::new(),
        }
    }

    fn primary() -> ElementSpec {
        spec(
            "people",
            ".person",
            FieldKind::Container {
                sub_elements: vec![
                    spec("name", "h3", FieldKind::Text),
                    spec("profile", "a", FieldKind::Link),
                ],
            },
        )
    }

    const PAGE: &str = r#"<html><body>
        <div class="person"><h3>Ann</h3><a href="/p/ann">Profile</a></div>
        <div class="person"><h3>Bo</h3><a href="/p/bo">Profile</a></div>
    </body></html>"#;

    #[tokio::test]
    async fn test_harvest_twice_appends_once_and_queues_links() {
        let session = StaticSession::new(Arc::new(FixtureSite::new().with_page(URL, PAGE)));
        session.navigate(URL).await.expect("navigate fixture");

        let accumulator = SharedAccumulator::new();
        let label = Label::new("profile").expect("valid label");
        let mut harvester = Harvester::new(
            Arc::new(SelectorResolver::new(&ResolverConfig::default())),
            primary(),
            accumulator.clone(),
        )
        .with_links(LinkSource::Field(label), LinkSink::Deferred(Vec::new()));

        let mut diagnostics = Diagnostics::new();
        let first = harvester
            .harvest(&session, Phase::Extracting, &mut diagnostics)
            .await
            .expect("first harvest");
        let second = harvester
            .harvest(&session, Phase::Paginating, &mut diagnostics)
            .await
            .expect("second harvest");

        assert_eq!(first, Harvest { instances: 2, appended: 2 });
        assert_eq!(second, Harvest { instances: 2, appended: 0 });
        assert!(diagnostics.is_empty());

        let records = accumulator.snapshot().await;
        assert_eq!(records[0].get("name").and_then(Value::as_scalar), Some("Ann"));

        let LinkSink::Deferred(jobs) = harvester.into_sink() else {
            panic!("expected deferred sink");
        };
        let links: Vec<_> = jobs.iter().map(|job| job.link.as_str()).collect();
        assert_eq!(links, vec!["https://example.com/p/ann", "https://example.com/p/bo"]);
    }
}
