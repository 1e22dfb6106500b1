use serde::Deserialize;
use std::time::Duration;

use crate::error::CrawlError;

/// Link-extraction category toggles. Defaults to static anchors on,
/// everything else off.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct LinkToggles {
    #[serde(rename = "static")]
    pub static_anchor: bool,
    pub dynamic: bool,
    pub resource: bool,
    pub external: bool,
}

impl Default for LinkToggles {
    fn default() -> Self {
        Self {
            static_anchor: true,
            dynamic: false,
            resource: false,
            external: false,
        }
    }
}

/// Run configuration. `validate()` enforces the ranges and the
/// cross-field invariant tying `max_links_to_validate` to `max_pages_to_crawl`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlConfig {
    pub max_crawl_depth: u32,
    pub max_pages_to_crawl: usize,
    pub max_links_to_validate: usize,
    pub link_toggles: LinkToggles,
    pub request_timeout_secs: u64,
    pub max_concurrent_requests: usize,
    pub retry_attempts: u32,
    pub user_agent: String,
    pub validator_concurrency: usize,
    pub wall_clock_ceiling_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_crawl_depth: 3,
            max_pages_to_crawl: 100,
            max_links_to_validate: 500,
            link_toggles: LinkToggles::default(),
            request_timeout_secs: 15,
            max_concurrent_requests: 10,
            retry_attempts: 3,
            user_agent: "crawlsite/0.1 (+https://example.invalid/bot)".to_string(),
            validator_concurrency: 50,
            wall_clock_ceiling_secs: 900,
        }
    }
}

impl CrawlConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn wall_clock_ceiling(&self) -> Duration {
        Duration::from_secs(self.wall_clock_ceiling_secs)
    }

    /// Enforce the configured ranges and the `max_links_to_validate >= 2 *
    /// max_pages_to_crawl` cross-field rule. Called before a run starts;
    /// a config that fails this never reaches the frontier.
    pub fn validate(&self) -> Result<(), CrawlError> {
        if !(1..=5).contains(&self.max_crawl_depth) {
            return Err(CrawlError::Config(format!(
                "max_crawl_depth must be in [1,5], got {}",
                self.max_crawl_depth
            )));
        }
        if !(10..=1000).contains(&self.max_pages_to_crawl) {
            return Err(CrawlError::Config(format!(
                "max_pages_to_crawl must be in [10,1000], got {}",
                self.max_pages_to_crawl
            )));
        }
        if !(10..=2000).contains(&self.max_links_to_validate) {
            return Err(CrawlError::Config(format!(
                "max_links_to_validate must be in [10,2000], got {}",
                self.max_links_to_validate
            )));
        }
        if self.max_links_to_validate < 2 * self.max_pages_to_crawl {
            return Err(CrawlError::Config(format!(
                "max_links_to_validate ({}) must be >= 2 * max_pages_to_crawl ({})",
                self.max_links_to_validate,
                2 * self.max_pages_to_crawl
            )));
        }
        if self.max_concurrent_requests == 0 {
            return Err(CrawlError::Config(
                "max_concurrent_requests must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level application config loaded from `config/default.toml`, mirroring
/// the shape of a deployment manifest even though only `database` and
/// `default_crawl` are consumed by this crate's own binary.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub default_crawl: CrawlConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub postgres_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CrawlConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_undersized_validate_budget() {
        let mut cfg = CrawlConfig::default();
        cfg.max_pages_to_crawl = 100;
        cfg.max_links_to_validate = 50;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_depth_out_of_range() {
        let mut cfg = CrawlConfig::default();
        cfg.max_crawl_depth = 0;
        assert!(cfg.validate().is_err());
        cfg.max_crawl_depth = 6;
        assert!(cfg.validate().is_err());
    }
}
