//! Page-index query parameters for URL-based pagination.

use sieve_core::PageParam;
use url::Url;

/// Position in a sequence of URL-indexed pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    url: Url,
    name: String,
    step: u64,
    value: u64,
}

impl PageCursor {
    /// Find a configured page parameter in `url`.
    ///
    /// Parameters are tried in configuration order; the first one present
    /// with a numeric value wins.
    #[must_use]
    pub fn detect(url: &str, params: &[PageParam]) -> Option<Self> {
        let url = Url::parse(url).ok()?;
        params.iter().find_map(|param| {
            url.query_pairs()
                .find(|(name, _)| name == param.name.as_str())
                .and_then(|(_, value)| value.trim().parse::<u64>().ok())
                .map(|value| Self {
                    url: url.clone(),
                    name: param.name.clone(),
                    step: param.step.max(1),
                    value,
                })
        })
    }

    /// Cursor on the first page of `param` for a URL that does not carry it yet.
    #[must_use]
    pub fn starting(url: &str, param: &PageParam) -> Option<Self> {
        Some(Self {
            url: Url::parse(url).ok()?,
            name: param.name.clone(),
            step: param.step.max(1),
            value: param.start,
        })
    }

    #[must_use]
    pub fn param(&self) -> &str {
        &self.name
    }

    /// Current page index value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Advance one page and return its URL.
    pub fn advance(&mut self) -> String {
        self.value = self.value.saturating_add(self.step);
        self.url_for(self.value)
    }

    fn url_for(&self, value: u64) -> String {
        let mut replaced = false;
        let pairs: Vec<(String, String)> = self
            .url
            .query_pairs()
            .map(|(name, current)| {
                if name == self.name.as_str() && !replaced {
                    replaced = true;
                    (name.into_owned(), value.to_string())
                } else {
                    (name.into_owned(), current.into_owned())
                }
            })
            .collect();

        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (name, current) in &pairs {
                query.append_pair(name, current);
            }
            if !replaced {
                query.append_pair(&self.name, &value.to_string());
            }
        }
        url.into()
    }
}
