//! Error types for the template subsystem.

use thiserror::Error;

/// Errors that can occur while loading or validating templates.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Template not found
    #[error("template not found: {name}")]
    NotFound {
        /// The template name that was not found
        name: String,
    },

    /// Failed to read a template file
    #[error("failed to load template from {path}: {source}")]
    LoadError {
        /// Path to the template file
        path: String,
        /// Underlying error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Failed to parse a JSON template
    #[error("failed to parse template JSON in {path}: {source}")]
    JsonError {
        /// Path or origin of the document
        path: String,
        /// JSON parse error
        #[source]
        source: serde_json::Error,
    },

    /// Failed to parse a TOML template
    #[error("failed to parse template TOML in {path}: {source}")]
    ParseError {
        /// Path or origin of the document
        path: String,
        /// TOML parse error
        #[source]
        source: toml::de::Error,
    },

    /// Unsupported template file extension
    #[error("unsupported template format for {path} (expected .json or .toml)")]
    UnsupportedFormat {
        /// Path to the template file
        path: String,
    },

    /// Invalid template (validation failed)
    #[error("invalid template {template}: {reason}")]
    ValidationError {
        /// Template name or URL being validated
        template: String,
        /// Reason for validation failure
        reason: String,
    },

    /// Template directory not found
    #[error("templates directory not found at {path}")]
    DirectoryNotFound {
        /// Expected directory path
        path: String,
    },

    /// I/O error while accessing templates
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid field label
    #[error("invalid label: {0}")]
    InvalidLabel(#[from] sieve_core::SieveError),
}

/// Result type for template operations.
pub type Result<T> = std::result::Result<T, TemplateError>;
