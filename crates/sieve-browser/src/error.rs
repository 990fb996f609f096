use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium error: {0}")]
    ChromiumError(String),

    #[error("navigation failed: {0}")]
    NavigationError(String),

    #[error("selector not found: {0}")]
    SelectorNotFound(String),

    #[error("invalid selector {selector}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("stale element handle: {0}")]
    StaleHandle(String),

    #[error("no page loaded")]
    NoPage,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("script evaluation failed: {0}")]
    Script(String),
}

impl BrowserError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NavigationError(_) | Self::Timeout(_) | Self::ChromiumError(_)
        )
    }
}
