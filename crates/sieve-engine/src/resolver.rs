//! Selector resolution and container extraction.
//!
//! [`SelectorResolver`] turns an [`ElementSpec`] into a [`Value`] against a
//! scope (the whole page or one container instance). The declared selector is
//! tried first; on a miss the fallback chain proposes alternatives. Reading the
//! page is the only thing resolution does: misses become diagnostics, never
//! errors, and resolving the same spec against an unchanged page yields the
//! same values in the same order.

use crate::diagnostics::{Diagnostic, DiagnosticKind, Phase};
use crate::error::{EngineError, Result};
use crate::record::{Record, Value};
use crate::strategy::{default_chain, FallbackStrategy, Miss};
use sieve_browser::{BrowserError, BrowserSession, ElementHandle, ElementSnapshot, Locator};
use sieve_core::ResolverConfig;
use sieve_template::{ElementSpec, FieldKind};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, trace};

/// Where a field is being resolved, for diagnostics and link resolution.
#[derive(Debug, Clone)]
pub struct FieldContext {
    pub page_url: String,
    pub phase: Phase,
    prefix: String,
}

impl FieldContext {
    pub fn new(page_url: impl Into<String>, phase: Phase) -> Self {
        Self {
            page_url: page_url.into(),
            phase,
            prefix: String::new(),
        }
    }

    /// Diagnostic subject for `label` in this context.
    #[must_use]
    pub fn subject(&self, label: &str) -> String {
        if self.prefix.is_empty() {
            label.to_string()
        } else {
            format!("{}.{label}", self.prefix)
        }
    }

    fn instance(&self, container: &str, index: usize) -> Self {
        Self {
            page_url: self.page_url.clone(),
            phase: self.phase,
            prefix: format!("{}[{index}]", self.subject(container)),
        }
    }
}

/// Result of locating a spec's elements.
#[derive(Debug, Clone)]
pub struct Located {
    pub elements: Vec<ElementSnapshot>,
    /// Locator that produced `elements`, if any did.
    pub locator: Option<Locator>,
    /// Strategy that produced `elements`; `"declared"` for the template selector.
    pub via: &'static str,
    /// Why the declared selector was not used.
    pub miss: Option<Miss>,
    /// Match count of a declared container selector rejected as over-broad.
    pub rejected: Option<usize>,
}

/// One container instance.
#[derive(Debug, Clone)]
pub struct Instance {
    pub record: Record,
    /// Link of the instance itself, when requested.
    pub link: Option<String>,
    /// Problems with this instance's fields.
    pub diagnostics: Vec<Diagnostic>,
}

/// All instances of a container plus container-level problems.
#[derive(Debug, Clone, Default)]
pub struct ContainerMatch {
    pub instances: Vec<Instance>,
    pub diagnostics: Vec<Diagnostic>,
}

/// A resolved field.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub value: Value,
    pub diagnostics: Vec<Diagnostic>,
}

type FieldFuture<'a> = Pin<Box<dyn Future<Output = Result<Resolved>> + Send + 'a>>;

enum Probe {
    Hits(Vec<ElementSnapshot>),
    Invalid(String),
}

pub struct SelectorResolver {
    chain: Vec<Box<dyn FallbackStrategy>>,
    max_container_matches: usize,
    sequence_labels: Vec<String>,
}

impl SelectorResolver {
    /// Resolver with the default fallback chain for `config`.
    #[must_use]
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            chain: default_chain(config),
            max_container_matches: config.max_container_matches,
            sequence_labels: config
                .sequence_labels
                .iter()
                .map(|label| label.to_lowercase())
                .collect(),
        }
    }

    /// Append a strategy to the end of the chain.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn FallbackStrategy>) -> Self {
        self.chain.push(strategy);
        self
    }

    /// Replace the fallback chain.
    #[must_use]
    pub fn with_chain(mut self, chain: Vec<Box<dyn FallbackStrategy>>) -> Self {
        self.chain = chain;
        self
    }

    /// Names of the strategies in chain order.
    pub fn strategies(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.chain.iter().map(|strategy| strategy.name())
    }

    async fn probe(
        session: &dyn BrowserSession,
        locator: &Locator,
        scope: Option<&ElementHandle>,
    ) -> Result<Probe> {
        let locator = if scope.is_some() {
            locator.scoped()
        } else {
            locator.clone()
        };
        match session.query_all(&locator, scope).await {
            Ok(elements) => Ok(Probe::Hits(elements)),
            Err(BrowserError::InvalidSelector { reason, .. }) => Ok(Probe::Invalid(reason)),
            Err(e) => Err(EngineError::Browser(e)),
        }
    }

    /// Find the elements for `spec` within `scope`, walking the fallback chain
    /// on a miss.
    pub async fn locate(
        &self,
        session: &dyn BrowserSession,
        spec: &ElementSpec,
        scope: Option<&ElementHandle>,
    ) -> Result<Located> {
        let capped = spec.kind.is_container();
        let over_cap = |count: usize| capped && count > self.max_container_matches;

        let (miss, rejected) = match Self::probe(session, &spec.locator, scope).await? {
            Probe::Hits(elements) if elements.is_empty() => (Miss::Empty, None),
            Probe::Hits(elements) if over_cap(elements.len()) => {
                (Miss::OverBroad, Some(elements.len()))
            }
            Probe::Hits(elements) => {
                return Ok(Located {
                    elements,
                    locator: Some(spec.locator.clone()),
                    via: "declared",
                    miss: None,
                    rejected: None,
                })
            }
            Probe::Invalid(reason) => {
                trace!(label = %spec.label, locator = %spec.locator, %reason, "declared selector invalid");
                (Miss::Invalid, None)
            }
        };

        for strategy in self.chain.iter().filter(|s| s.applies(miss)) {
            for candidate in strategy.candidates(spec) {
                if let Probe::Hits(elements) = Self::probe(session, &candidate, scope).await? {
                    if !elements.is_empty() && !over_cap(elements.len()) {
                        debug!(
                            label = %spec.label,
                            declared = %spec.locator,
                            strategy = strategy.name(),
                            locator = %candidate,
                            matches = elements.len(),
                            "resolved via fallback"
                        );
                        return Ok(Located {
                            elements,
                            locator: Some(candidate),
                            via: strategy.name(),
                            miss: Some(miss),
                            rejected,
                        });
                    }
                }
            }
        }

        Ok(Located {
            elements: Vec::new(),
            locator: None,
            via: "none",
            miss: Some(miss),
            rejected,
        })
    }

    /// Whether `spec` is always returned as a list.
    #[must_use]
    pub fn is_sequence(&self, spec: &ElementSpec) -> bool {
        spec.is_multiple
            || spec
                .label
                .normalized()
                .split(|c: char| !c.is_alphanumeric())
                .any(|token| self.sequence_labels.iter().any(|label| label == token))
    }

    /// Resolve one field within `scope`.
    pub fn resolve_field<'a>(
        &'a self,
        session: &'a dyn BrowserSession,
        spec: &'a ElementSpec,
        scope: Option<&'a ElementHandle>,
        ctx: &'a FieldContext,
    ) -> FieldFuture<'a> {
        Box::pin(async move {
            if spec.kind.is_container() {
                let matched = self.resolve_instances(session, spec, scope, ctx, false).await?;
                let mut diagnostics = matched.diagnostics;
                let records = matched
                    .instances
                    .into_iter()
                    .map(|instance| {
                        diagnostics.extend(instance.diagnostics);
                        instance.record
                    })
                    .collect::<Vec<_>>();
                if records.is_empty() && spec.is_required {
                    diagnostics.push(missing(spec, ctx, "no container instances"));
                }
                return Ok(Resolved {
                    value: Value::Records(records),
                    diagnostics,
                });
            }

            let located = self.locate(session, spec, scope).await?;
            let mut values = Vec::with_capacity(located.elements.len());
            for element in &located.elements {
                if let Some(value) = self.read(session, spec, element, &ctx.page_url).await? {
                    values.push(value);
                }
            }

            let value = if self.is_sequence(spec) {
                Value::List(values)
            } else {
                values.into_iter().next().map_or(Value::Null, Value::Scalar)
            };

            let mut diagnostics = Vec::new();
            if value.is_empty() && spec.is_required {
                let reason = match located.miss {
                    Some(Miss::Invalid) => format!("invalid selector {}, no fallback matched", spec.locator),
                    _ if located.elements.is_empty() => format!("no match for {}", spec.locator),
                    _ => format!("matched elements of {} carry no value", spec.locator),
                };
                diagnostics.push(missing(spec, ctx, &reason));
            }
            Ok(Resolved { value, diagnostics })
        })
    }

    /// Locate the instances of container `spec` and resolve every sub-element
    /// inside each instance only, in document order.
    pub async fn resolve_instances(
        &self,
        session: &dyn BrowserSession,
        spec: &ElementSpec,
        scope: Option<&ElementHandle>,
        ctx: &FieldContext,
        with_links: bool,
    ) -> Result<ContainerMatch> {
        let located = self.locate(session, spec, scope).await?;
        let mut matched = ContainerMatch::default();

        if let Some(count) = located.rejected {
            matched.diagnostics.push(Diagnostic::new(
                ctx.phase,
                DiagnosticKind::SelectorResolution,
                ctx.subject(spec.label.as_str()),
                format!(
                    "{} matched {count} elements on {}, above the cap of {}; rejected",
                    spec.locator, ctx.page_url, self.max_container_matches
                ),
            )
            .on_page(&ctx.page_url));
        }

        for (index, element) in located.elements.iter().enumerate() {
            let instance_ctx = ctx.instance(spec.label.as_str(), index);
            let mut record = Record::new();
            let mut diagnostics = Vec::new();

            for sub in spec.kind.sub_elements() {
                let resolved = self
                    .resolve_field(session, sub, Some(&element.handle), &instance_ctx)
                    .await?;
                record.insert(sub.label.as_str(), resolved.value);
                diagnostics.extend(resolved.diagnostics);
            }

            let link = if with_links {
                element_link(session, element, &ctx.page_url).await?
            } else {
                None
            };

            matched.instances.push(Instance {
                record,
                link,
                diagnostics,
            });
        }

        Ok(matched)
    }

    /// Resolve every spec against the whole page into one record.
    pub async fn resolve_record(
        &self,
        session: &dyn BrowserSession,
        specs: impl IntoIterator<Item = &ElementSpec>,
        ctx: &FieldContext,
    ) -> Result<(Record, Vec<Diagnostic>)> {
        let mut record = Record::new();
        let mut diagnostics = Vec::new();
        for spec in specs {
            let resolved = self.resolve_field(session, spec, None, ctx).await?;
            record.insert(spec.label.as_str(), resolved.value);
            diagnostics.extend(resolved.diagnostics);
        }
        Ok((record, diagnostics))
    }

    async fn read(
        &self,
        session: &dyn BrowserSession,
        spec: &ElementSpec,
        element: &ElementSnapshot,
        page_url: &str,
    ) -> Result<Option<String>> {
        let value = match &spec.kind {
            FieldKind::Text => Some(element.text.clone()),
            FieldKind::Attribute { name } => element.attr(name).map(str::to_string),
            FieldKind::Html => Some(element.html.clone()),
            FieldKind::Link => element_link(session, element, page_url).await?,
            FieldKind::Container { .. } => None,
        };
        Ok(value.filter(|v| !v.trim().is_empty()))
    }
}

fn missing(spec: &ElementSpec, ctx: &FieldContext, reason: &str) -> Diagnostic {
    let err = EngineError::SelectorResolution {
        label: spec.label.to_string(),
        reason: reason.to_string(),
    };
    Diagnostic::from_error(ctx.phase, ctx.subject(spec.label.as_str()), &err)
        .on_page(&ctx.page_url)
}

/// Absolute link of an element: its own `href`, else its first descendant link.
pub async fn element_link(
    session: &dyn BrowserSession,
    element: &ElementSnapshot,
    page_url: &str,
) -> Result<Option<String>> {
    if let Some(href) = element.attr("href") {
        return Ok(absolutize(page_url, href));
    }
    let anchor = Locator::Css("a[href]".to_string());
    let first = match session.query(&anchor, Some(&element.handle)).await {
        Ok(first) => first,
        Err(BrowserError::StaleHandle(_)) => None,
        Err(e) => return Err(EngineError::Browser(e)),
    };
    Ok(first
        .and_then(|a| a.attr("href").map(str::to_string))
        .and_then(|href| absolutize(page_url, &href)))
}

/// Resolve `href` against `base`.
#[must_use]
pub fn absolutize(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    match url::Url::parse(base) {
        Ok(base) => base.join(href).ok().map(String::from),
        Err(_) => url::Url::parse(href).ok().map(String::from),
    }
}
