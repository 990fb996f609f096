//! Sieve Template - extraction template model, loading and analysis.
//!
//! A template is the declarative document an external authoring tool
//! produces: which fields to read, how the listing paginates and which
//! detail links to follow. This crate keeps that document immutable and
//! derives a typed run plan from it.
//!
//! # Architecture
//!
//! - **Template** ([`template`]): the raw document, JSON or TOML, with validation
//! - **Model** ([`model`]): typed field, pagination and action specifications
//! - **Analysis** ([`analysis`]): repairs contradictory flags and classifies the template
//! - **Loader** ([`loader`]): template files from a directory tree
//! - **Errors** ([`error`]): template-specific error types
//!
//! # Example
//!
//! ```rust
//! use sieve_template::{analyze, Template, TemplateShape};
//! use sieve_core::PaginationConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let template = Template::from_json(r#"{
//!     "url": "https://shop.example.com/products",
//!     "elements": [{
//!         "label": "cards", "selector": ".card", "kind": "container",
//!         "subElements": [{"label": "name", "selector": "h3"}]
//!     }]
//! }"#)?;
//!
//! let plan = analyze(&template, &PaginationConfig::default())?;
//! assert_eq!(plan.shape, TemplateShape::Directory { primary: 0 });
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod analysis;
pub mod error;
pub mod loader;
pub mod model;
pub mod template;

// Re-export commonly used types
pub use analysis::{analyze, CrawlPlan, ExtractionPlan, PaginationPlan, Repair, TemplateShape};
pub use error::{Result, TemplateError};
pub use loader::TemplateLoader;
pub use model::{ActionSpec, ActionType, ElementSpec, FieldKind, PaginationSpec, PatternType};
pub use template::{
    ActionDefinition, Cookie, ElementDefinition, ElementKind, PaginationDefinition,
    SessionOptions, Template,
};
