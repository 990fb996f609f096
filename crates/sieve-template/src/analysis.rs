//! Template analysis.
//!
//! [`analyze`] turns an immutable [`Template`] into an [`ExtractionPlan`]:
//! selectors become locators, contradictory flags are repaired (each repair
//! is recorded so the run can report it), the template is classified as a
//! directory or single page, and the pagination and crawl phases are decided.

use crate::error::{Result, TemplateError};
use crate::model::{
    seconds, ActionSpec, ElementSpec, FieldKind, PaginationSpec, PatternType,
};
use crate::template::{ElementDefinition, ElementKind, SessionOptions, Template};
use regex::Regex;
use serde::Serialize;
use sieve_browser::{detect_kind, Locator};
use sieve_core::{Label, PaginationConfig, SelectorKind};
use tracing::{debug, info};

/// A contradiction in the template that analysis fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repair {
    /// Path of the element or section that was changed
    pub subject: String,
    /// What was changed
    pub message: String,
}

/// How records are shaped for this template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TemplateShape {
    /// One record per instance of the top-level container at `primary`.
    Directory { primary: usize },
    /// Exactly one record holding every top-level field.
    SinglePage,
}

/// What the pagination phase does.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PaginationPlan {
    Disabled,
    Declared(PaginationSpec),
    /// Probe the first page for a paging mechanism.
    AutoDetect,
}

/// Where detail links come from and what to read from them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlPlan {
    /// Field holding the link. `None` means the link of the container
    /// instance itself (the instance if it is an anchor, else its first link).
    pub link_field: Option<Label>,
    pub subpage_elements: Vec<ElementSpec>,
}

/// Derived, validated configuration for one run.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionPlan {
    pub name: String,
    pub url: String,
    pub elements: Vec<ElementSpec>,
    pub actions: Vec<ActionSpec>,
    pub shape: TemplateShape,
    pub pagination: PaginationPlan,
    pub crawl: Option<CrawlPlan>,
    #[serde(skip)]
    pub subpage_allow_pattern: Option<Regex>,
    pub max_subpages: Option<usize>,
    /// Carried for the automation layer; not interpreted here.
    pub session: SessionOptions,
    pub repairs: Vec<Repair>,
}

struct Repairs(Vec<Repair>);

impl Repairs {
    fn push(&mut self, subject: &str, message: impl Into<String>) {
        let repair = Repair {
            subject: subject.to_string(),
            message: message.into(),
        };
        debug!(subject = %repair.subject, message = %repair.message, "template repaired");
        self.0.push(repair);
    }
}

impl ExtractionPlan {
    /// The primary container of a directory template.
    #[must_use]
    pub fn primary(&self) -> Option<&ElementSpec> {
        match self.shape {
            TemplateShape::Directory { primary } => self.elements.get(primary),
            TemplateShape::SinglePage => None,
        }
    }

    /// Top-level fields that are not the primary container.
    pub fn page_fields(&self) -> impl Iterator<Item = &ElementSpec> {
        let primary = match self.shape {
            TemplateShape::Directory { primary } => Some(primary),
            TemplateShape::SinglePage => None,
        };
        self.elements
            .iter()
            .enumerate()
            .filter(move |(index, _)| Some(*index) != primary)
            .map(|(_, spec)| spec)
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self.shape, TemplateShape::Directory { .. })
    }
}

/// Analyze `template` into a run plan.
///
/// # Errors
/// Returns [`TemplateError::ValidationError`] if the template cannot be run.
pub fn analyze(template: &Template, config: &PaginationConfig) -> Result<ExtractionPlan> {
    template.validate()?;
    let mut repairs = Repairs(Vec::new());

    let mut elements = template
        .elements
        .iter()
        .map(|definition| convert(definition, &format!("elements.{}", definition.label), &mut repairs))
        .collect::<Result<Vec<_>>>()?;

    let shape = elements
        .iter()
        .position(|spec| spec.kind.is_container())
        .map_or(TemplateShape::SinglePage, |primary| TemplateShape::Directory { primary });

    let crawl = plan_crawl(&mut elements, shape, &mut repairs);
    let pagination = plan_pagination(template, shape, config, &mut repairs);
    let actions = template
        .actions
        .iter()
        .map(|action| ActionSpec {
            label: action.label.clone(),
            locator: (!action.selector.trim().is_empty())
                .then(|| Locator::parse(&action.selector, action.selector_kind)),
            action: action.action_type,
            value: action.value.clone(),
            wait_after: seconds(action.wait_after_seconds),
        })
        .collect();

    let subpage_allow_pattern = template
        .subpage_allow_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| TemplateError::ValidationError {
            template: template.display_name().to_string(),
            reason: format!("invalid subpageAllowPattern: {e}"),
        })?;

    let plan = ExtractionPlan {
        name: template.display_name().to_string(),
        url: template.url.clone(),
        elements,
        actions,
        shape,
        pagination,
        crawl,
        subpage_allow_pattern,
        max_subpages: template.max_subpages,
        session: template.session.clone(),
        repairs: repairs.0,
    };

    info!(
        template = %plan.name,
        directory = plan.is_directory(),
        crawl = plan.crawl.is_some(),
        repairs = plan.repairs.len(),
        "template analyzed"
    );
    Ok(plan)
}

fn convert(definition: &ElementDefinition, path: &str, repairs: &mut Repairs) -> Result<ElementSpec> {
    let label = Label::new(definition.label.as_str())?;
    let mut is_multiple = definition.is_multiple;

    let mut kind = definition.kind;
    if kind != ElementKind::Container
        && (definition.is_container || !definition.sub_elements.is_empty())
    {
        repairs.push(path, format!("declared {kind:?} with container flags, treated as container"));
        kind = ElementKind::Container;
    }
    if kind == ElementKind::Container && definition.sub_elements.is_empty() {
        repairs.push(path, "container without sub-elements, treated as a list of text values");
        kind = ElementKind::Text;
        is_multiple = true;
    }

    let kind = match kind {
        ElementKind::Text => FieldKind::Text,
        ElementKind::Html => FieldKind::Html,
        ElementKind::Link => FieldKind::Link,
        ElementKind::Attribute => match definition.attribute_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => FieldKind::Attribute {
                name: name.to_string(),
            },
            _ => {
                repairs.push(path, "attribute field without attributeName, treated as text");
                FieldKind::Text
            }
        },
        ElementKind::Container => FieldKind::Container {
            sub_elements: definition
                .sub_elements
                .iter()
                .map(|sub| convert(sub, &format!("{path}.subElements.{}", sub.label), repairs))
                .collect::<Result<_>>()?,
        },
    };

    let mut follow_links = definition.follow_links;
    if !follow_links && !definition.subpage_elements.is_empty() {
        repairs.push(path, "subpageElements declared without followLinks, enabling followLinks");
        follow_links = true;
    }
    if follow_links && definition.subpage_elements.is_empty() {
        repairs.push(path, "followLinks set without subpageElements, disabling followLinks");
        follow_links = false;
    }

    let subpage_elements = definition
        .subpage_elements
        .iter()
        .map(|sub| convert(sub, &format!("{path}.subpageElements.{}", sub.label), repairs))
        .collect::<Result<_>>()?;

    Ok(ElementSpec {
        label,
        locator: Locator::parse(&definition.selector, definition.selector_kind),
        kind,
        is_multiple,
        is_required: definition.is_required,
        follow_links,
        subpage_elements,
    })
}

/// Pick the single link source of the run and switch every other one off.
fn plan_crawl(
    elements: &mut [ElementSpec],
    shape: TemplateShape,
    repairs: &mut Repairs,
) -> Option<CrawlPlan> {
    let mut crawl: Option<CrawlPlan> = None;

    if let TemplateShape::Directory { primary } = shape {
        let container = &mut elements[primary];
        if container.follow_links {
            crawl = Some(CrawlPlan {
                link_field: None,
                subpage_elements: container.subpage_elements.clone(),
            });
        }
        let container_path = format!("elements.{}", container.label);
        if let FieldKind::Container { sub_elements } = &mut container.kind {
            for sub in sub_elements.iter_mut().filter(|sub| sub.follow_links) {
                let path = format!("{container_path}.subElements.{}", sub.label);
                if crawl.is_none() {
                    crawl = Some(CrawlPlan {
                        link_field: Some(sub.label.clone()),
                        subpage_elements: sub.subpage_elements.clone(),
                    });
                } else {
                    disable_follow(sub, &path, repairs);
                }
            }
        }
    }

    for (index, spec) in elements.iter_mut().enumerate() {
        if matches!(shape, TemplateShape::Directory { primary } if primary == index) {
            continue;
        }
        let path = format!("elements.{}", spec.label);
        if spec.follow_links {
            if crawl.is_none() && shape == TemplateShape::SinglePage {
                crawl = Some(CrawlPlan {
                    link_field: Some(spec.label.clone()),
                    subpage_elements: spec.subpage_elements.clone(),
                });
            } else {
                disable_follow(spec, &path, repairs);
            }
        }
        disable_nested_follows(spec, &path, repairs);
    }

    crawl
}

fn disable_follow(spec: &mut ElementSpec, path: &str, repairs: &mut Repairs) {
    repairs.push(path, "only one link source is crawled per run, disabling followLinks");
    spec.follow_links = false;
    spec.subpage_elements.clear();
}

fn disable_nested_follows(spec: &mut ElementSpec, path: &str, repairs: &mut Repairs) {
    if let FieldKind::Container { sub_elements } = &mut spec.kind {
        for sub in sub_elements {
            let sub_path = format!("{path}.subElements.{}", sub.label);
            if sub.follow_links {
                disable_follow(sub, &sub_path, repairs);
            }
            disable_nested_follows(sub, &sub_path, repairs);
        }
    }
}

fn plan_pagination(
    template: &Template,
    shape: TemplateShape,
    config: &PaginationConfig,
    repairs: &mut Repairs,
) -> PaginationPlan {
    let Some(declared) = &template.pagination else {
        return match shape {
            TemplateShape::Directory { .. } => PaginationPlan::AutoDetect,
            TemplateShape::SinglePage => PaginationPlan::Disabled,
        };
    };

    if declared.pattern_type == PatternType::None {
        return PaginationPlan::Disabled;
    }
    if shape == TemplateShape::SinglePage {
        repairs.push(
            "pagination",
            "pagination declared on a template without a container, ignoring it",
        );
        return PaginationPlan::Disabled;
    }

    let trigger = declared
        .selector
        .as_deref()
        .map(str::trim)
        .filter(|selector| !selector.is_empty())
        .map(|selector| {
            Locator::parse(selector, detect_kind(selector).unwrap_or(SelectorKind::Css))
        });
    if declared.pattern_type == PatternType::LoadMore && trigger.is_none() {
        repairs.push("pagination", "loadMore without a selector, the trigger will be auto-detected");
    }

    let max_iterations = match declared.max_pages {
        Some(0) => {
            repairs.push("pagination", "maxPages of 0 means no limit, using the configured cap");
            None
        }
        other => other,
    };

    PaginationPlan::Declared(PaginationSpec {
        pattern: declared.pattern_type,
        trigger,
        max_iterations,
        pause: declared
            .scroll_pause_seconds
            .map_or_else(|| config.default_pause(), seconds),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn analyze_json(json: &str) -> ExtractionPlan {
        let template = Template::from_json(json).expect("parse template");
        analyze(&template, &PaginationConfig::default()).expect("analyze template")
    }

    #[test]
    fn test_directory_with_link_sub_element() {
        let plan = analyze_json(
            r#"{
                "url": "https://example.com/people",
                "elements": [
                    {"label": "title", "selector": "h1"},
                    {"label": "people", "selector": ".person", "kind": "container",
                     "subElements": [
                        {"label": "name", "selector": "h3"},
                        {"label": "profile", "selector": "a", "kind": "link",
                         "followLinks": true,
                         "subpageElements": [{"label": "bio", "selector": ".bio"}]}
                     ]}
                ]
            }"#,
        );

        assert_eq!(plan.shape, TemplateShape::Directory { primary: 1 });
        assert_eq!(plan.primary().map(|p| p.label.as_str()), Some("people"));
        assert_eq!(
            plan.page_fields().map(|f| f.label.as_str()).collect::<Vec<_>>(),
            vec!["title"]
        );
        let crawl = plan.crawl.as_ref().expect("crawl plan");
        assert_eq!(crawl.link_field.as_ref().map(Label::as_str), Some("profile"));
        assert_eq!(crawl.subpage_elements.len(), 1);
        assert_eq!(plan.pagination, PaginationPlan::AutoDetect);
        assert!(plan.repairs.is_empty());
    }

    #[test]
    fn test_single_page_template() {
        let plan = analyze_json(
            r#"{
                "url": "https://example.com/article",
                "elements": [
                    {"label": "headline", "selector": "h1"},
                    {"label": "tags", "selector": ".tag", "isMultiple": true, "isRequired": false}
                ],
                "pagination": {"patternType": "infiniteScroll"}
            }"#,
        );
        assert_eq!(plan.shape, TemplateShape::SinglePage);
        assert!(plan.primary().is_none());
        assert_eq!(plan.pagination, PaginationPlan::Disabled);
        assert_eq!(plan.repairs.len(), 1);
        assert_eq!(plan.repairs[0].subject, "pagination");
    }

    #[test]
    fn test_subpage_elements_without_follow_links_is_repaired() {
        let plan = analyze_json(
            r#"{
                "url": "https://example.com/list",
                "elements": [
                    {"label": "items", "selector": ".item", "kind": "container",
                     "subElements": [{"label": "name", "selector": "h2"}],
                     "subpageElements": [{"label": "detail", "selector": ".detail"}]}
                ]
            }"#,
        );
        let primary = plan.primary().expect("primary container");
        assert!(primary.follow_links);
        let crawl = plan.crawl.as_ref().expect("crawl plan");
        assert!(crawl.link_field.is_none());
        assert!(plan
            .repairs
            .iter()
            .any(|r| r.subject == "elements.items" && r.message.contains("enabling followLinks")));
    }

    #[test]
    fn test_kind_repairs() {
        let plan = analyze_json(
            r#"{
                "url": "https://example.com/list",
                "elements": [
                    {"label": "rows", "selector": "tr", "kind": "text", "isContainer": true,
                     "subElements": [{"label": "cell", "selector": "td"},
                                     {"label": "img", "selector": "img", "kind": "attribute"}]},
                    {"label": "footnotes", "selector": ".note", "kind": "container"}
                ]
            }"#,
        );
        let rows = &plan.elements[0];
        assert!(rows.kind.is_container());
        assert_eq!(rows.sub_element("img").map(|s| &s.kind), Some(&FieldKind::Text));

        let footnotes = &plan.elements[1];
        assert_eq!(footnotes.kind, FieldKind::Text);
        assert!(footnotes.is_multiple);
        assert_eq!(plan.repairs.len(), 3);
    }

    #[test]
    fn test_second_link_source_is_disabled() {
        let plan = analyze_json(
            r#"{
                "url": "https://example.com/list",
                "elements": [
                    {"label": "items", "selector": ".item", "kind": "container", "followLinks": true,
                     "subElements": [
                        {"label": "more", "selector": "a.more", "kind": "link", "followLinks": true,
                         "subpageElements": [{"label": "x", "selector": ".x"}]}
                     ],
                     "subpageElements": [{"label": "detail", "selector": ".detail"}]}
                ]
            }"#,
        );
        let crawl = plan.crawl.as_ref().expect("crawl plan");
        assert!(crawl.link_field.is_none());
        let more = plan.primary().and_then(|p| p.sub_element("more")).expect("more");
        assert!(!more.follow_links);
        assert!(more.subpage_elements.is_empty());
    }

    #[test]
    fn test_declared_pagination() {
        let plan = analyze_json(
            r#"{
                "url": "https://example.com/list",
                "elements": [{"label": "cards", "selector": ".card", "kind": "container",
                              "subElements": [{"label": "name", "selector": "h3"}]}],
                "pagination": {"patternType": "loadMore", "selector": "//button[@class='more']",
                               "maxPages": 2, "scrollPauseSeconds": 0.25}
            }"#,
        );
        let PaginationPlan::Declared(spec) = &plan.pagination else {
            panic!("expected declared pagination, got {:?}", plan.pagination);
        };
        assert_eq!(spec.pattern, PatternType::LoadMore);
        assert_eq!(spec.trigger.as_ref().map(Locator::kind), Some(SelectorKind::Xpath));
        assert_eq!(spec.max_iterations, Some(2));
        assert_eq!(spec.pause, Duration::from_millis(250));
    }

    #[test]
    fn test_pagination_defaults_and_zero_cap() {
        let plan = analyze_json(
            r#"{
                "url": "https://example.com/list",
                "elements": [{"label": "cards", "selector": ".card", "kind": "container",
                              "subElements": [{"label": "name", "selector": "h3"}]}],
                "pagination": {"patternType": "infiniteScroll", "maxPages": 0}
            }"#,
        );
        let PaginationPlan::Declared(spec) = &plan.pagination else {
            panic!("expected declared pagination");
        };
        assert_eq!(spec.max_iterations, None);
        assert_eq!(spec.pause, PaginationConfig::default().default_pause());
        assert!(spec.trigger.is_none());

        let plan = analyze_json(
            r#"{
                "url": "https://example.com/list",
                "elements": [{"label": "cards", "selector": ".card", "kind": "container",
                              "subElements": [{"label": "name", "selector": "h3"}]}],
                "pagination": {"patternType": "none"}
            }"#,
        );
        assert_eq!(plan.pagination, PaginationPlan::Disabled);
    }

    #[test]
    fn test_actions_and_allow_pattern() {
        let plan = analyze_json(
            r##"{
                "url": "https://example.com/list",
                "elements": [{"label": "title", "selector": "h1"}],
                "actions": [
                    {"label": "consent", "selector": "#accept", "waitAfterSeconds": 0.5},
                    {"label": "settle", "actionType": "wait", "waitAfterSeconds": 1}
                ],
                "subpageAllowPattern": "/detail/\\d+"
            }"##,
        );
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].wait_after, Duration::from_millis(500));
        assert!(plan.actions[1].locator.is_none());
        let pattern = plan.subpage_allow_pattern.as_ref().expect("allow pattern");
        assert!(pattern.is_match("https://example.com/detail/42"));
    }

    #[test]
    fn test_analysis_does_not_mutate_template() {
        let template = Template::from_json(
            r#"{
                "url": "https://example.com/list",
                "elements": [{"label": "items", "selector": ".item", "kind": "container"}]
            }"#,
        )
        .expect("parse template");
        let before = template.clone();
        let plan = analyze(&template, &PaginationConfig::default()).expect("analyze");
        assert_eq!(template, before);
        assert_eq!(plan.elements[0].kind, FieldKind::Text);
    }

    #[test]
    fn test_invalid_template_is_rejected() {
        let template = Template::from_json(
            r#"{"url": "https://example.com", "elements": [{"label": " bad", "selector": "p"}]}"#,
        )
        .expect("parse template");
        assert!(matches!(
            analyze(&template, &PaginationConfig::default()),
            Err(TemplateError::ValidationError { .. })
        ));
    }
}
