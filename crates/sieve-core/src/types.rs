//! Shared types used across the Sieve crates.
//!
//! This module defines common newtypes that provide type safety
//! and clear domain modeling.

use crate::error::SieveError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Newtype for field labels.
///
/// Labels key every extracted value. They must be non-empty, carry no
/// leading/trailing whitespace or control characters, and be at most
/// 128 characters long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    /// Create a new `Label` from a string.
    ///
    /// # Errors
    /// Returns error if the label doesn't match the required format.
    pub fn new(label: impl Into<String>) -> Result<Self, SieveError> {
        let label = label.into();
        Self::validate(&label)?;
        Ok(Self(label))
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased form used by label-guided heuristics.
    #[must_use]
    pub fn normalized(&self) -> String {
        self.0.to_lowercase()
    }

    fn validate(label: &str) -> Result<(), SieveError> {
        static LABEL_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = LABEL_REGEX
            .get_or_init(|| Regex::new(r"^\S(?:[^\x00-\x1f]*\S)?$").expect("valid regex"));

        if label.is_empty() || label.chars().count() > 128 {
            return Err(SieveError::Validation(format!(
                "invalid label: must be 1-128 characters, got {}",
                label.chars().count()
            )));
        }

        if regex.is_match(label) {
            Ok(())
        } else {
            Err(SieveError::Validation(format!(
                "invalid label: no surrounding whitespace or control characters allowed, got '{label}'"
            )))
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Label {
    type Error = SieveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.0
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Query language a selector is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    /// CSS selector
    #[default]
    Css,
    /// XPath expression
    #[serde(alias = "XPath", alias = "XPATH")]
    Xpath,
}

impl SelectorKind {
    /// The other selector language.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Css => Self::Xpath,
            Self::Xpath => Self::Css,
        }
    }
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css => write!(f, "css"),
            Self::Xpath => write!(f, "xpath"),
        }
    }
}

/// Identifier of one extraction run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    /// Create a new random `RunId` using UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wrapper around `chrono::DateTime<Utc>` for consistent timestamp handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create a timestamp representing the current moment.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Get the inner `DateTime<Utc>`.
    #[must_use]
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Format as RFC3339 string.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Milliseconds elapsed between `self` and a later timestamp.
    #[must_use]
    pub fn millis_until(&self, later: &Self) -> i64 {
        (later.0 - self.0).num_milliseconds()
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_valid() {
        let valid = vec!["name", "price", "Practice Area", "item_1", "détail"];
        for label in valid {
            assert!(Label::new(label).is_ok(), "Failed for: {label}");
        }
    }

    #[test]
    fn test_label_invalid() {
        let too_long = "a".repeat(129);
        let invalid = vec!["", " name", "name ", "na\tme", too_long.as_str()];
        for label in invalid {
            assert!(Label::new(label).is_err(), "Should fail for: {label:?}");
        }
    }

    #[test]
    fn test_label_serde_validates() {
        let label: Label = serde_json::from_str("\"price\"").expect("deserialize label");
        assert_eq!(label.as_str(), "price");
        assert!(serde_json::from_str::<Label>("\"\"").is_err());
    }

    #[test]
    fn test_label_normalized() {
        let label = Label::new("Job Title").expect("valid label");
        assert_eq!(label.normalized(), "job title");
    }

    #[test]
    fn test_selector_kind_serde() {
        let kind: SelectorKind = serde_json::from_str("\"xpath\"").expect("deserialize kind");
        assert_eq!(kind, SelectorKind::Xpath);
        assert_eq!(kind.other(), SelectorKind::Css);
        assert_eq!(SelectorKind::default().to_string(), "css");
    }

    #[test]
    fn test_run_id_generate() {
        let id1 = RunId::generate();
        let id2 = RunId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 36);
    }

    #[test]
    fn test_timestamp_ordering() {
        let ts1 = Timestamp::now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let ts2 = Timestamp::now();
        assert!(ts2 > ts1);
        assert!(ts1.millis_until(&ts2) >= 10);
    }
}
