//! Template document types.
//!
//! A [`Template`] is the document an external authoring tool produces, kept
//! exactly as loaded. Keys are camelCase; the snake_case names used by older
//! exports are accepted as aliases. Nothing here is repaired or normalised,
//! see [`crate::analysis`] for that.

use crate::error::{Result, TemplateError};
use serde::{Deserialize, Serialize};
use sieve_core::{Label, SelectorKind};
use std::collections::HashSet;

/// Complete extraction template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Human-readable template name
    #[serde(default)]
    pub name: Option<String>,

    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,

    /// Start page
    pub url: String,

    /// Fields to extract
    #[serde(default)]
    pub elements: Vec<ElementDefinition>,

    /// Interactions performed after the start page loads
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,

    /// Pagination declaration
    #[serde(default)]
    pub pagination: Option<PaginationDefinition>,

    /// Regex a detail link must match to be followed
    #[serde(
        default,
        alias = "subpage_allow_pattern",
        alias = "subpage_url_pattern",
        alias = "subpageUrlPattern"
    )]
    pub subpage_allow_pattern: Option<String>,

    /// Upper bound on detail pages visited
    #[serde(default, alias = "max_subpages")]
    pub max_subpages: Option<usize>,

    /// Session settings carried for the automation layer
    #[serde(flatten)]
    pub session: SessionOptions,
}

/// Session and browser settings that the engine carries but does not interpret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    /// Cookies to install before navigating
    #[serde(default)]
    pub cookies: Vec<Cookie>,

    /// Requested headless mode
    #[serde(default)]
    pub headless: Option<bool>,

    /// Requested user agent
    #[serde(default, alias = "user_agent")]
    pub user_agent: Option<String>,

    /// Requested element wait timeout in seconds
    #[serde(default, alias = "wait_timeout")]
    pub wait_timeout: Option<f64>,

    /// Requested page load timeout in seconds
    #[serde(default, alias = "page_load_timeout")]
    pub page_load_timeout: Option<f64>,
}

/// A cookie as exported by the authoring tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// Cookie domain
    #[serde(default)]
    pub domain: Option<String>,
    /// Cookie path
    #[serde(default)]
    pub path: Option<String>,
}

/// What to read from a matched element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// Visible text
    #[default]
    Text,
    /// One attribute value
    Attribute,
    /// Outer HTML
    Html,
    /// Link target
    Link,
    /// Repeating record container
    #[serde(alias = "composite")]
    Container,
}

/// One field declaration, possibly with nested sub-elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinition {
    /// Key of the extracted value
    pub label: String,

    /// CSS selector or XPath expression
    pub selector: String,

    /// Declared selector language
    #[serde(default, alias = "selector_type", alias = "selectorType", alias = "selector_kind")]
    pub selector_kind: SelectorKind,

    /// Declared element kind
    #[serde(default, alias = "element_type", alias = "elementType")]
    pub kind: ElementKind,

    /// Attribute to read for attribute fields
    #[serde(default, alias = "attribute_name", alias = "attribute")]
    pub attribute_name: Option<String>,

    /// Whether every match is collected
    #[serde(default, alias = "is_multiple")]
    pub is_multiple: bool,

    /// Whether a miss is reported
    #[serde(default = "default_required", alias = "is_required")]
    pub is_required: bool,

    /// Legacy container flag
    #[serde(default, alias = "is_container")]
    pub is_container: bool,

    /// Fields resolved inside each container instance
    #[serde(default, alias = "sub_elements")]
    pub sub_elements: Vec<ElementDefinition>,

    /// Whether detail links found here are visited
    #[serde(default, alias = "follow_links")]
    pub follow_links: bool,

    /// Fields extracted from each visited detail page
    #[serde(default, alias = "subpage_elements")]
    pub subpage_elements: Vec<ElementDefinition>,
}

fn default_required() -> bool {
    true
}

/// How the start page exposes further content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatternType {
    /// Single page
    #[default]
    None,
    /// Content appended while scrolling
    #[serde(alias = "infinite_scroll", alias = "scroll")]
    InfiniteScroll,
    /// Content appended by a trigger element
    #[serde(alias = "load_more", alias = "button")]
    LoadMore,
    /// Separate URLs per page
    #[serde(alias = "url_based", alias = "numbered")]
    UrlBased,
}

/// Pagination declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationDefinition {
    /// Paging mechanism
    #[serde(alias = "pattern_type")]
    pub pattern_type: PatternType,

    /// Load-more trigger or next-page link
    #[serde(
        default,
        alias = "triggerSelector",
        alias = "trigger_selector",
        alias = "next_selector",
        alias = "nextSelector",
        alias = "load_more_selector",
        alias = "loadMoreSelector"
    )]
    pub selector: Option<String>,

    /// Cap on additional pages or trigger activations
    #[serde(default, alias = "max_pages", alias = "maxIterations")]
    pub max_pages: Option<u32>,

    /// Wait after each scroll or click
    #[serde(default, alias = "scroll_pause_seconds", alias = "scroll_pause_time")]
    pub scroll_pause_seconds: Option<f64>,
}

/// Interaction kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Click the element
    #[default]
    Click,
    /// Scroll the page
    Scroll,
    /// Type `value` into the element
    Type,
    /// Pause, or wait for the element to appear
    Wait,
}

/// A scripted interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    /// Action name, used in diagnostics
    pub label: String,

    /// Target element
    #[serde(default)]
    pub selector: String,

    /// Declared selector language
    #[serde(default, alias = "selector_type", alias = "selectorType", alias = "selector_kind")]
    pub selector_kind: SelectorKind,

    /// Interaction kind
    #[serde(default, alias = "action_type")]
    pub action_type: ActionType,

    /// Text for `type` actions, pixels for `scroll` actions
    #[serde(default)]
    pub value: Option<String>,

    /// Wait after the action
    #[serde(default = "default_wait_after", alias = "wait_after", alias = "waitAfter")]
    pub wait_after_seconds: f64,
}

fn default_wait_after() -> f64 {
    2.0
}

impl Template {
    /// Parse a JSON document.
    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| TemplateError::JsonError {
            path: "<inline>".to_string(),
            source: e,
        })
    }

    /// Parse a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| TemplateError::ParseError {
            path: "<inline>".to_string(),
            source: e,
        })
    }

    /// Name used in logs and errors.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }

    /// Look up a top-level element by label.
    #[must_use]
    pub fn element(&self, label: &str) -> Option<&ElementDefinition> {
        self.elements.iter().find(|e| e.label == label)
    }

    /// Reject documents that cannot be run at all.
    ///
    /// Contradictory flags are not errors here; analysis repairs them.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| TemplateError::ValidationError {
            template: self.display_name().to_string(),
            reason,
        };

        let url = url::Url::parse(&self.url)
            .map_err(|e| invalid(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid(format!("url must be an absolute http(s) URL, got '{}'", self.url)));
        }

        if self.elements.is_empty() {
            return Err(invalid("template declares no elements".to_string()));
        }
        validate_elements(&self.elements, "elements").map_err(invalid)?;

        for action in &self.actions {
            if action.action_type != ActionType::Wait
                && action.action_type != ActionType::Scroll
                && action.selector.trim().is_empty()
            {
                return Err(invalid(format!("action '{}' needs a selector", action.label)));
            }
            if action.action_type == ActionType::Type && action.value.is_none() {
                return Err(invalid(format!("type action '{}' needs a value", action.label)));
            }
            if !action.wait_after_seconds.is_finite() || action.wait_after_seconds < 0.0 {
                return Err(invalid(format!(
                    "action '{}' has invalid waitAfterSeconds {}",
                    action.label, action.wait_after_seconds
                )));
            }
        }

        if let Some(pagination) = &self.pagination {
            if let Some(pause) = pagination.scroll_pause_seconds {
                if !pause.is_finite() || pause < 0.0 {
                    return Err(invalid(format!("invalid scrollPauseSeconds {pause}")));
                }
            }
        }

        if let Some(pattern) = &self.subpage_allow_pattern {
            regex::Regex::new(pattern)
                .map_err(|e| invalid(format!("invalid subpageAllowPattern: {e}")))?;
        }

        Ok(())
    }
}

fn validate_elements(elements: &[ElementDefinition], path: &str) -> std::result::Result<(), String> {
    let mut seen = HashSet::new();
    for element in elements {
        Label::new(element.label.as_str()).map_err(|e| format!("{path}: {e}"))?;
        if !seen.insert(element.label.as_str()) {
            return Err(format!("{path}: duplicate label '{}'", element.label));
        }
        if element.selector.trim().is_empty() {
            return Err(format!("{path}.{}: empty selector", element.label));
        }
        validate_elements(
            &element.sub_elements,
            &format!("{path}.{}.subElements", element.label),
        )?;
        validate_elements(
            &element.subpage_elements,
            &format!("{path}.{}.subpageElements", element.label),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIRECTORY_JSON: &str = r#"{
        "name": "Team directory",
        "url": "https://example.com/people",
        "elements": [
            {
                "label": "people",
                "selector": ".person",
                "kind": "container",
                "subElements": [
                    {"label": "name", "selector": "h3"},
                    {"label": "profile", "selector": "a", "kind": "link", "isRequired": false}
                ],
                "followLinks": true,
                "subpageElements": [
                    {"label": "bio", "selector": ".bio", "isRequired": false}
                ]
            }
        ],
        "pagination": {"patternType": "loadMore", "selector": ".more", "maxPages": 2, "scrollPauseSeconds": 0.5},
        "subpageAllowPattern": "/people/",
        "headless": false,
        "cookies": [{"name": "consent", "value": "yes"}]
    }"#;

    #[test]
    fn test_parse_camel_case_document() {
        let template = Template::from_json(DIRECTORY_JSON).expect("parse template");
        assert_eq!(template.display_name(), "Team directory");
        assert_eq!(template.elements.len(), 1);

        let people = template.element("people").expect("people element");
        assert_eq!(people.kind, ElementKind::Container);
        assert_eq!(people.sub_elements.len(), 2);
        assert!(people.sub_elements[0].is_required);
        assert!(!people.sub_elements[1].is_required);
        assert_eq!(people.sub_elements[1].kind, ElementKind::Link);

        let pagination = template.pagination.as_ref().expect("pagination");
        assert_eq!(pagination.pattern_type, PatternType::LoadMore);
        assert_eq!(pagination.selector.as_deref(), Some(".more"));
        assert_eq!(pagination.max_pages, Some(2));

        assert_eq!(template.session.headless, Some(false));
        assert_eq!(template.session.cookies.len(), 1);
        assert!(template.validate().is_ok());
    }

    #[test]
    fn test_parse_snake_case_aliases() {
        let json = r##"{
            "name": "legacy",
            "url": "https://example.com/list",
            "elements": [
                {"label": "cards", "selector": "//div[@class='card']", "selector_type": "xpath",
                 "element_type": "composite", "is_container": true,
                 "sub_elements": [{"label": "title", "selector": "h2", "is_required": false}]}
            ],
            "pagination": {"pattern_type": "infinite_scroll", "max_pages": 5, "scroll_pause_time": 1.5},
            "subpage_url_pattern": "/detail/",
            "actions": [{"label": "accept", "selector": "#accept", "action_type": "click", "wait_after": 0.5}]
        }"##;
        let template = Template::from_json(json).expect("parse legacy template");
        let cards = &template.elements[0];
        assert_eq!(cards.selector_kind, SelectorKind::Xpath);
        assert_eq!(cards.kind, ElementKind::Container);
        assert!(cards.is_container);

        let pagination = template.pagination.as_ref().expect("pagination");
        assert_eq!(pagination.pattern_type, PatternType::InfiniteScroll);
        assert_eq!(pagination.scroll_pause_seconds, Some(1.5));
        assert_eq!(template.subpage_allow_pattern.as_deref(), Some("/detail/"));
        assert!((template.actions[0].wait_after_seconds - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_toml_document() {
        let toml_str = r#"
name = "Catalog"
url = "https://shop.example.com/catalog"

[[elements]]
label = "products"
selector = ".card"
kind = "container"

[[elements.subElements]]
label = "name"
selector = "h3"

[[elements.subElements]]
label = "price"
selector = ".price"

[pagination]
patternType = "urlBased"
maxPages = 3
"#;
        let template = Template::from_toml(toml_str).expect("parse toml template");
        assert_eq!(template.elements[0].sub_elements.len(), 2);
        assert_eq!(
            template.pagination.as_ref().map(|p| p.pattern_type),
            Some(PatternType::UrlBased)
        );
        assert!(template.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut template = Template::from_json(DIRECTORY_JSON).expect("parse template");
        template.url = "not a url".to_string();
        assert!(matches!(
            template.validate(),
            Err(TemplateError::ValidationError { .. })
        ));

        template.url = "ftp://example.com/".to_string();
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_labels() {
        let mut template = Template::from_json(DIRECTORY_JSON).expect("parse template");
        let duplicate = template.elements[0].sub_elements[0].clone();
        template.elements[0].sub_elements.push(duplicate);

        let err = template.validate().expect_err("duplicate label");
        assert!(err.to_string().contains("duplicate label 'name'"));
    }

    #[test]
    fn test_validate_rejects_empty_selector_and_bad_pattern() {
        let mut template = Template::from_json(DIRECTORY_JSON).expect("parse template");
        template.elements[0].sub_elements[0].selector = "  ".to_string();
        assert!(template.validate().is_err());

        let mut template = Template::from_json(DIRECTORY_JSON).expect("parse template");
        template.subpage_allow_pattern = Some("(unclosed".to_string());
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_type_action_without_value() {
        let mut template = Template::from_json(DIRECTORY_JSON).expect("parse template");
        template.actions.push(ActionDefinition {
            label: "search".to_string(),
            selector: "#q".to_string(),
            selector_kind: SelectorKind::Css,
            action_type: ActionType::Type,
            value: None,
            wait_after_seconds: 0.0,
        });
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_missing_url_is_parse_error() {
        let err = Template::from_json(r#"{"elements": []}"#).expect_err("missing url");
        assert!(matches!(err, TemplateError::JsonError { .. }));
    }
}
