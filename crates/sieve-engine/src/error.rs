use crate::diagnostics::DiagnosticKind;
use sieve_browser::BrowserError;
use sieve_template::TemplateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("required field '{label}' could not be resolved: {reason}")]
    SelectorResolution { label: String, reason: String },

    #[error("required container '{label}' has no instances on {url}")]
    ContainerNotFound { label: String, url: String },

    #[error("navigation to {url} failed: {source}")]
    Navigation {
        url: String,
        #[source]
        source: BrowserError,
    },

    #[error("pagination stalled after {iterations} iterations: {reason}")]
    PaginationStall { iterations: u32, reason: String },

    #[error("subpage {link} could not be merged: {reason}")]
    SubpageMerge { link: String, reason: String },

    #[error("inconsistent template at {subject}: {message}")]
    TemplateInconsistency { subject: String, message: String },

    #[error("action '{label}' failed: {reason}")]
    Action { label: String, reason: String },

    #[error("session failed before any record was collected: {0}")]
    Session(#[source] BrowserError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),
}

impl EngineError {
    /// Diagnostic kind this error is reported as when it is not fatal.
    #[must_use]
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            Self::SelectorResolution { .. } => DiagnosticKind::SelectorResolution,
            Self::ContainerNotFound { .. } => DiagnosticKind::ContainerNotFound,
            Self::Navigation { .. } | Self::Session(_) | Self::Browser(_) => {
                DiagnosticKind::Navigation
            }
            Self::PaginationStall { .. } => DiagnosticKind::PaginationStall,
            Self::SubpageMerge { .. } => DiagnosticKind::SubpageMerge,
            Self::TemplateInconsistency { .. } | Self::Template(_) => {
                DiagnosticKind::TemplateInconsistency
            }
            Self::Action { .. } => DiagnosticKind::Action,
        }
    }

    /// Whether this error ends the run instead of degrading it.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ContainerNotFound { .. } | Self::Session(_) | Self::Template(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
