//! Typed, repaired field and interaction specifications.
//!
//! These are produced once per run by [`crate::analysis::analyze`] and never
//! mutated afterwards. Every selector has been turned into a [`Locator`] and
//! every element kind into an exhaustive [`FieldKind`].

use serde::{Deserialize, Serialize};
use sieve_browser::Locator;
use sieve_core::Label;
use std::time::Duration;

pub use crate::template::{ActionType, PatternType};

/// What a field reads from its matched element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Attribute { name: String },
    Html,
    /// Absolute URL of the element's `href` (or its first descendant link).
    Link,
    /// One record per matched instance, with fields resolved inside it.
    Container { sub_elements: Vec<ElementSpec> },
}

impl FieldKind {
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Container { .. })
    }

    /// Sub-elements of a container, empty for scalar kinds.
    #[must_use]
    pub fn sub_elements(&self) -> &[ElementSpec] {
        match self {
            Self::Container { sub_elements } => sub_elements,
            _ => &[],
        }
    }
}

/// One validated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSpec {
    pub label: Label,
    pub locator: Locator,
    pub kind: FieldKind,
    pub is_multiple: bool,
    pub is_required: bool,
    pub follow_links: bool,
    /// Fields read from detail pages; empty unless `follow_links` is set.
    pub subpage_elements: Vec<ElementSpec>,
}

impl ElementSpec {
    /// Look up a sub-element by label.
    #[must_use]
    pub fn sub_element(&self, label: &str) -> Option<&ElementSpec> {
        self.kind
            .sub_elements()
            .iter()
            .find(|spec| spec.label.as_str() == label)
    }
}

/// Validated pagination declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationSpec {
    pub pattern: PatternType,
    /// Load-more trigger or next-page link.
    pub trigger: Option<Locator>,
    /// `None` means the configured default cap applies.
    pub max_iterations: Option<u32>,
    pub pause: Duration,
}

/// Validated scripted interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub label: String,
    /// Absent for `wait` and page-level `scroll` actions without a target.
    pub locator: Option<Locator>,
    pub action: ActionType,
    pub value: Option<String>,
    pub wait_after: Duration,
}

/// Convert a non-negative, finite number of seconds to a [`Duration`].
pub(crate) fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
