//! Configuration management for Sieve.
//!
//! Provides TOML-based configuration with XDG-compliant paths and
//! environment variable overrides. Every empirically chosen threshold used
//! by the extraction engine (stall detection, retry counts, match caps)
//! lives here rather than in code.

use crate::error::{ConfigError, ConfigResult};
use directories::ProjectDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Main engine configuration.
///
/// This is loaded from `~/.config/sieve/config.toml` (or platform equivalent).
/// If the file doesn't exist, default values are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SieveConfig {
    /// Browser session settings
    pub browser: BrowserConfig,
    /// Selector resolution settings
    pub resolver: ResolverConfig,
    /// Pagination controller settings
    pub pagination: PaginationConfig,
    /// Subpage crawler settings
    pub subpage: SubpageConfig,
}

impl SieveConfig {
    /// Load configuration from disk, falling back to defaults if not found.
    ///
    /// # Errors
    /// Returns error if:
    /// - Config directory cannot be determined
    /// - File exists but cannot be read
    /// - File contents are not valid TOML
    pub fn load() -> ConfigResult<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            tracing::debug!("Loading config from {}", config_path.display());
            let contents = fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::debug!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Supports the following environment variables:
    /// - `SIEVE_HEADLESS`: Override browser headless mode (true/false)
    /// - `SIEVE_NAV_TIMEOUT_MS`: Override the navigation timeout
    /// - `SIEVE_STALL_THRESHOLD`: Override the pagination stall threshold
    /// - `SIEVE_MAX_SUBPAGES`: Cap the number of subpages visited per run
    pub fn load_with_env() -> ConfigResult<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SIEVE_HEADLESS") {
            if let Ok(headless) = val.parse() {
                self.browser.headless = headless;
                tracing::debug!("Override browser.headless from env: {}", headless);
            }
        }

        if let Ok(val) = std::env::var("SIEVE_NAV_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                self.browser.navigation_timeout_ms = timeout;
                tracing::debug!("Override browser.navigation_timeout_ms from env: {}", timeout);
            }
        }

        if let Ok(val) = std::env::var("SIEVE_STALL_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                self.pagination.stall_threshold = threshold;
                tracing::debug!("Override pagination.stall_threshold from env: {}", threshold);
            }
        }

        if let Ok(val) = std::env::var("SIEVE_MAX_SUBPAGES") {
            if let Ok(max) = val.parse() {
                self.subpage.max_subpages = Some(max);
                tracing::debug!("Override subpage.max_subpages from env: {}", max);
            }
        }
    }

    /// Save configuration to disk.
    ///
    /// Creates the config directory if it doesn't exist.
    pub fn save(&self) -> ConfigResult<()> {
        let config_path = Self::config_path()?;
        let config_dir = config_path
            .parent()
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "config_path".to_string(),
                reason: "no parent directory".to_string(),
            })?;

        fs::create_dir_all(config_dir)?;
        tracing::debug!("Saving config to {}", config_path.display());

        let contents = toml::to_string_pretty(self)?;
        fs::write(config_path, contents)?;
        Ok(())
    }

    /// Check that thresholds and limits are usable.
    pub fn validate(&self) -> ConfigResult<()> {
        fn invalid(field: &str, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.browser.navigation_timeout_ms == 0 {
            return Err(invalid("browser.navigation_timeout_ms", "must be greater than 0"));
        }
        if self.resolver.max_container_matches == 0 {
            return Err(invalid("resolver.max_container_matches", "must be at least 1"));
        }
        if self.pagination.stall_threshold == 0 {
            return Err(invalid("pagination.stall_threshold", "must be at least 1"));
        }
        if self.pagination.default_max_iterations == 0 {
            return Err(invalid("pagination.default_max_iterations", "must be at least 1"));
        }
        if self.pagination.scroll_growth_ratio < 1.0 {
            return Err(invalid("pagination.scroll_growth_ratio", "must be at least 1.0"));
        }
        if let Err(e) = Regex::new(&self.pagination.load_more_text_pattern) {
            return Err(ConfigError::InvalidValue {
                field: "pagination.load_more_text_pattern".to_string(),
                reason: e.to_string(),
            });
        }
        if self.pagination.page_params.iter().any(|p| p.step == 0) {
            return Err(invalid("pagination.page_params", "step must be greater than 0"));
        }
        if self.subpage.max_consecutive_failures == 0 {
            return Err(invalid("subpage.max_consecutive_failures", "must be at least 1"));
        }
        if self.subpage.channel_capacity == 0 {
            return Err(invalid("subpage.channel_capacity", "must be at least 1"));
        }
        Ok(())
    }

    /// Get the path to the configuration file.
    ///
    /// Uses XDG base directories: `~/.config/sieve/config.toml`
    pub fn config_path() -> ConfigResult<PathBuf> {
        let dirs = ProjectDirs::from("org", "sieve", "sieve").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the directory where templates are looked up by default.
    ///
    /// Uses XDG base directories: `~/.local/share/sieve/templates`
    pub fn templates_dir() -> ConfigResult<PathBuf> {
        let dirs = ProjectDirs::from("org", "sieve", "sieve").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.data_dir().join("templates"))
    }
}

/// Browser session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Run browser in headless mode
    pub headless: bool,
    /// Browser window width
    pub window_width: u32,
    /// Browser window height
    pub window_height: u32,
    /// Timeout for a single navigation
    pub navigation_timeout_ms: u64,
    /// Timeout for a single wait condition
    pub wait_timeout_ms: u64,
    /// Minimum delay between two navigations to the same domain
    pub politeness_delay_ms: u64,
    /// Custom user agent string
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window_width: 1920,
            window_height: 1080,
            navigation_timeout_ms: 30_000,
            wait_timeout_ms: 10_000,
            politeness_delay_ms: 1_000,
            user_agent: None,
        }
    }
}

impl BrowserConfig {
    /// Navigation timeout as a [`Duration`].
    #[must_use]
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    /// Wait timeout as a [`Duration`].
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// A label-keyword to selector mapping used by the vocabulary fallback.
///
/// When a field's label contains any of `keywords`, the `selectors` are
/// tried in order. Sites with domain-specific markup supply these from
/// configuration; none are built in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    /// Lower-case label fragments that activate this entry
    pub keywords: Vec<String>,
    /// Candidate CSS selectors, tried in order
    pub selectors: Vec<String>,
}

/// Selector resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Container match count above which a selector is considered over-broad
    pub max_container_matches: usize,
    /// Enable relaxed-selector similarity search
    pub similarity_search: bool,
    /// Enable label-guided attribute search
    pub label_guided_search: bool,
    /// Label fragments whose fields are always returned as sequences
    pub sequence_labels: Vec<String>,
    /// Optional vocabulary matchers
    pub vocabulary: Vec<VocabularyEntry>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_container_matches: 500,
            similarity_search: true,
            label_guided_search: true,
            sequence_labels: ["tags", "categories", "keywords", "labels", "topics"]
                .into_iter()
                .map(String::from)
                .collect(),
            vocabulary: Vec::new(),
        }
    }
}

/// A query parameter that carries a page index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageParam {
    /// Query parameter name
    pub name: String,
    /// Increment between successive pages
    pub step: u64,
    /// Value of the first page
    pub start: u64,
}

impl PageParam {
    fn new(name: &str, step: u64, start: u64) -> Self {
        Self {
            name: name.to_string(),
            step,
            start,
        }
    }
}

/// Pagination controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    /// Consecutive no-progress iterations before a loop is considered stalled
    pub stall_threshold: u32,
    /// Retries for a single failed scroll/click step
    pub action_retries: u32,
    /// Base backoff between action retries
    pub retry_backoff_ms: u64,
    /// Iteration cap when the template declares none
    pub default_max_iterations: u32,
    /// Wait after each scroll/click when the template declares none
    pub default_pause_ms: u64,
    /// Height/viewport ratio above which infinite scroll is probed
    pub scroll_growth_ratio: f64,
    /// Candidate selectors for auto-detected load-more triggers
    pub load_more_selectors: Vec<String>,
    /// Pattern matched against button/link text during auto-detection
    pub load_more_text_pattern: String,
    /// Query parameters recognised as page indexes
    pub page_params: Vec<PageParam>,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            stall_threshold: 3,
            action_retries: 2,
            retry_backoff_ms: 500,
            default_max_iterations: 50,
            default_pause_ms: 1_000,
            scroll_growth_ratio: 1.5,
            load_more_selectors: [
                ".load-more",
                ".show-more",
                ".view-more",
                "[class*='load-more']",
                "[class*='show-more']",
                "button[class*='more']",
                "a[class*='more']",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            load_more_text_pattern: r"(?i)\b(load|show|view|see)\s+more\b".to_string(),
            page_params: vec![
                PageParam::new("page", 1, 1),
                PageParam::new("p", 1, 1),
                PageParam::new("pg", 1, 1),
                PageParam::new("offset", 20, 0),
                PageParam::new("start", 20, 0),
                PageParam::new("skip", 20, 0),
            ],
        }
    }
}

impl PaginationConfig {
    /// Default post-action wait as a [`Duration`].
    #[must_use]
    pub fn default_pause(&self) -> Duration {
        Duration::from_millis(self.default_pause_ms)
    }

    /// Backoff before retry `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Subpage crawler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubpageConfig {
    /// Fixed delay between two detail-page navigations
    pub inter_navigation_delay_ms: u64,
    /// Consecutive failed links after which the queue is abandoned
    pub max_consecutive_failures: u32,
    /// Retries for one detail-page navigation
    pub navigation_retries: u32,
    /// Base backoff between navigation retries
    pub retry_backoff_ms: u64,
    /// Upper bound on detail pages visited per run
    pub max_subpages: Option<usize>,
    /// Capacity of the link hand-off channel
    pub channel_capacity: usize,
}

impl Default for SubpageConfig {
    fn default() -> Self {
        Self {
            inter_navigation_delay_ms: 1_000,
            max_consecutive_failures: 5,
            navigation_retries: 2,
            retry_backoff_ms: 1_000,
            max_subpages: None,
            channel_capacity: 64,
        }
    }
}

impl SubpageConfig {
    /// Inter-navigation delay as a [`Duration`].
    #[must_use]
    pub fn inter_navigation_delay(&self) -> Duration {
        Duration::from_millis(self.inter_navigation_delay_ms)
    }

    /// Backoff before retry `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SieveConfig::default();
        assert!(config.browser.headless);
        assert_eq!(config.pagination.stall_threshold, 3);
        assert_eq!(config.resolver.max_container_matches, 500);
        assert!(config.resolver.vocabulary.is_empty());
        assert!(config.subpage.max_subpages.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = SieveConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("[browser]"));
        assert!(toml_str.contains("[pagination]"));
        assert!(toml_str.contains("[subpage]"));

        let parsed: SieveConfig = toml::from_str(&toml_str).expect("parse serialized config");
        assert_eq!(
            parsed.pagination.page_params,
            config.pagination.page_params
        );
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().expect("create temp dir");
        let config_path = tmp.path().join("config.toml");

        let mut config = SieveConfig::default();
        config.pagination.stall_threshold = 5;
        config.subpage.max_subpages = Some(40);

        let contents = toml::to_string_pretty(&config).expect("serialize config");
        fs::write(&config_path, contents).expect("write config file");

        let loaded_contents = fs::read_to_string(&config_path).expect("read config file");
        let loaded: SieveConfig = toml::from_str(&loaded_contents).expect("parse loaded config");

        assert_eq!(loaded.pagination.stall_threshold, 5);
        assert_eq!(loaded.subpage.max_subpages, Some(40));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SIEVE_STALL_THRESHOLD", "7");
        std::env::set_var("SIEVE_MAX_SUBPAGES", "12");

        let mut config = SieveConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.pagination.stall_threshold, 7);
        assert_eq!(config.subpage.max_subpages, Some(12));

        std::env::remove_var("SIEVE_STALL_THRESHOLD");
        std::env::remove_var("SIEVE_MAX_SUBPAGES");
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[pagination]
stall_threshold = 4

[[resolver.vocabulary]]
keywords = ["email", "mail"]
selectors = ["a[href^='mailto:']", ".email"]
"#;

        let config: SieveConfig = toml::from_str(toml_str).expect("parse partial config");
        assert_eq!(config.pagination.stall_threshold, 4);
        assert_eq!(config.resolver.vocabulary.len(), 1);
        assert_eq!(config.resolver.vocabulary[0].selectors[0], "a[href^='mailto:']");
        // These should be defaults
        assert_eq!(config.pagination.action_retries, 2);
        assert!(config.browser.headless);
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let mut config = SieveConfig::default();
        config.pagination.stall_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = SieveConfig::default();
        config.pagination.load_more_text_pattern = "(unclosed".to_string();
        assert!(config.validate().is_err());

        let mut config = SieveConfig::default();
        config.subpage.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_linear() {
        let config = PaginationConfig {
            retry_backoff_ms: 200,
            ..PaginationConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(600));
    }
}
