//! Sieve Engine - Template-driven extraction runs.
//!
//! This crate turns an extraction template into records. It resolves
//! selectors with a pluggable fallback chain, extracts container instances,
//! drives pagination on the main browser session, crawls detail pages on a
//! secondary session and merges them back into their parent records.
//!
//! # Features
//!
//! - Declared selector first, then reinterpretation, similarity, label and
//!   vocabulary fallbacks
//! - Infinite scroll, load-more and URL-indexed pagination with stall detection
//! - Concurrent subpage crawling with fill-only merges
//! - Partial results with diagnostics instead of aborted runs
//!
//! # Example
//!
//! ```rust,ignore
//! use sieve_core::SieveConfig;
//! use sieve_engine::{ExtractionOrchestrator, Sessions};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = SieveConfig::load()?;
//! let sessions = Sessions::chromium(config.browser.clone()).await?;
//! let orchestrator = ExtractionOrchestrator::new(config);
//!
//! let result = orchestrator
//!     .run(&template, sessions, CancellationToken::new())
//!     .await?;
//! println!("{} records, incomplete: {}", result.records.len(), result.incomplete);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[allow(missing_docs)]
pub mod accumulator;
#[allow(missing_docs)]
pub mod diagnostics;
#[allow(missing_docs)]
pub mod error;
#[allow(missing_docs)]
pub mod harvest;
#[allow(missing_docs)]
pub mod link_filter;
#[allow(missing_docs)]
pub mod orchestrator;
#[allow(missing_docs)]
pub mod pagination;
#[allow(missing_docs)]
pub mod paging;
#[allow(missing_docs)]
pub mod record;
#[allow(missing_docs)]
pub mod resolver;
#[allow(missing_docs)]
pub mod retry;
#[allow(missing_docs)]
pub mod strategy;
#[allow(missing_docs)]
pub mod subpage;

// Re-export commonly used types
pub use accumulator::{Accumulator, RecordId, SharedAccumulator};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, Phase};
pub use error::{EngineError, Result};
pub use link_filter::{LinkFilter, SkipReason};
pub use orchestrator::{ExtractionOrchestrator, RunResult, RunState, Sessions};
pub use pagination::{PaginationController, PaginationOutcome, PaginationState};
pub use record::{Record, Value};
pub use resolver::{FieldContext, SelectorResolver};
pub use strategy::{
    default_chain, FallbackStrategy, LabelGuided, Miss, Reinterpret, Similarity, Vocabulary,
};
pub use subpage::{CrawlJob, CrawlReport, SubpageCrawler};
