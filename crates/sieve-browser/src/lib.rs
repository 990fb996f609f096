//! Browser capability interface for the Sieve extraction engine.
//!
//! [`BrowserSession`] is the seam between extraction logic and whatever
//! drives the page. Two backends ship here: [`ChromiumSession`] for
//! JavaScript-heavy sites and [`StaticSession`] for server-rendered HTML,
//! which also powers offline fixtures via [`FixtureSite`].

pub mod chromium;
pub mod error;
pub mod fixture;
pub mod locator;
pub mod politeness;
pub mod session;
pub mod static_session;
pub mod xpath;

pub use chromium::ChromiumSession;
pub use error::{BrowserError, Result};
pub use fixture::{Advance, FixtureSite, PageStats};
pub use locator::{detect_kind, looks_like_css, looks_like_xpath, Locator};
pub use politeness::PolitenessGate;
pub use session::{
    extract_domain, normalize_whitespace, BrowserSession, ContentMetric, ElementHandle,
    ElementSnapshot, ScrollTarget, WaitCondition,
};
pub use static_session::{HttpSource, Interaction, PageSource, StaticSession};
pub use xpath::XPath;
