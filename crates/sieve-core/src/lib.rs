//! Sieve Core - Foundation crate for the Sieve extraction engine.
//!
//! This crate provides shared types, error handling, configuration management
//! and tracing setup that all other Sieve crates depend on.
//!
//! # Modules
//!
//! - [`error`] - Central error types using thiserror
//! - [`config`] - TOML-based configuration with XDG paths
//! - [`types`] - Shared newtypes (`Label`, `RunId`, `Timestamp`)
//! - [`logging`] - tracing-subscriber initialisation
//!
//! # Example
//!
//! ```rust
//! use sieve_core::{Label, SieveConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SieveConfig::default();
//! config.validate()?;
//!
//! let label = Label::new("price")?;
//! assert_eq!(label.as_str(), "price");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use config::{
    BrowserConfig, PageParam, PaginationConfig, ResolverConfig, SieveConfig, SubpageConfig,
    VocabularyEntry,
};
pub use error::{ConfigError, ConfigResult, Result, SieveError};
pub use logging::init_tracing;
pub use types::{Label, RunId, SelectorKind, Timestamp};
