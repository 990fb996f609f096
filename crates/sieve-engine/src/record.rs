//! Extracted values and records.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Value of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Scalar(String),
    List(Vec<String>),
    /// One record per container instance, in document order.
    Records(Vec<Record>),
}

impl Value {
    /// Whether the value carries no data. Merges only fill empty values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Scalar(value) => value.trim().is_empty(),
            Self::List(values) => values.is_empty(),
            Self::Records(records) => records.is_empty(),
        }
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_records(&self) -> Option<&[Record]> {
        match self {
            Self::Records(records) => Some(records),
            _ => None,
        }
    }

    /// Scalar strings held by the value, in order.
    pub fn strings(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            Self::Scalar(value) => std::slice::from_ref(value),
            Self::List(values) => values,
            Self::Null | Self::Records(_) => &[],
        };
        values.iter().map(String::as_str)
    }
}

/// Ordered mapping from field label to value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(IndexMap<String, Value>);

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>, value: Value) {
        self.0.insert(label.into(), value);
    }

    #[must_use]
    pub fn get(&self, label: &str) -> Option<&Value> {
        self.0.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(label, value)| (label.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every field is empty.
    #[must_use]
    pub fn has_no_data(&self) -> bool {
        self.0.values().all(Value::is_empty)
    }

    /// Copy non-empty values from `other` into fields that are missing or
    /// empty here. Populated fields are never overwritten.
    ///
    /// Returns the number of fields filled.
    pub fn fill_from(&mut self, other: &Record) -> usize {
        let mut filled = 0;
        for (label, value) in &other.0 {
            if value.is_empty() {
                continue;
            }
            match self.0.get_mut(label) {
                Some(existing) if !existing.is_empty() => {}
                Some(existing) => {
                    *existing = value.clone();
                    filled += 1;
                }
                None => {
                    self.0.insert(label.clone(), value.clone());
                    filled += 1;
                }
            }
        }
        filled
    }

    /// Stable identity of the record's content, used to recognise a record
    /// that was already collected from an earlier view of the same page.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| format!("{:?}", self.0))
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
