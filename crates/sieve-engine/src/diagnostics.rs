//! Run diagnostics.
//!
//! Every degraded field, phase or link is reported as a [`Diagnostic`] so a
//! caller can judge how complete a [`crate::RunResult`] is.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Run phase a diagnostic was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Analyzing,
    Actions,
    Extracting,
    Paginating,
    Crawling,
    Merging,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Analyzing => "analyzing",
            Self::Actions => "actions",
            Self::Extracting => "extracting",
            Self::Paginating => "paginating",
            Self::Crawling => "crawling",
            Self::Merging => "merging",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticKind {
    SelectorResolution,
    ContainerNotFound,
    Navigation,
    PaginationStall,
    SubpageMerge,
    TemplateInconsistency,
    Action,
    Cancelled,
}

/// One degraded unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub phase: Phase,
    pub kind: DiagnosticKind,
    /// Field path or link involved.
    pub subject: String,
    pub message: String,
    /// Document the problem was seen on, when it is tied to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
}

impl Diagnostic {
    pub fn new(
        phase: Phase,
        kind: DiagnosticKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            kind,
            subject: subject.into(),
            message: message.into(),
            page: None,
        }
    }

    /// Tie the diagnostic to the document at `url`.
    #[must_use]
    pub fn on_page(mut self, url: impl Into<String>) -> Self {
        self.page = Some(url.into());
        self
    }

    /// Report a non-fatal error caught at a component boundary.
    pub fn from_error(phase: Phase, subject: impl Into<String>, error: &EngineError) -> Self {
        Self::new(phase, error.kind(), subject, error.to_string())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:?} {}: {}",
            self.phase, self.kind, self.subject, self.message
        )?;
        if let Some(page) = &self.page {
            write!(f, " ({page})")?;
        }
        Ok(())
    }
}

/// Ordered diagnostic list that drops exact repeats.
///
/// Pagination re-resolves the same DOM many times; an identical problem on
/// the same page is reported once. The same field failing on another page is
/// a separate diagnostic.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        if !self.entries.contains(&diagnostic) {
            tracing::warn!(
                phase = %diagnostic.phase,
                kind = ?diagnostic.kind,
                subject = %diagnostic.subject,
                page = diagnostic.page.as_deref().unwrap_or("-"),
                "{}",
                diagnostic.message
            );
            self.entries.push(diagnostic);
        }
    }

    pub fn report(&mut self, phase: Phase, subject: impl Into<String>, error: &EngineError) {
        self.push(Diagnostic::from_error(phase, subject, error));
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for diagnostic in diagnostics {
            self.push(diagnostic);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries
    }
}
