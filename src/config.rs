//! Configuration for the Bloom data layer

use crate::error::{Error, Result};
use std::env;
use std::time::Duration;
use url::Url;

/// Connection settings for the hosted record store
#[derive(Debug, Clone)]
pub struct BloomConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: Url,
    /// Anonymous API key
    pub anon_key: String,
}

impl BloomConfig {
    /// Create a new config, validating the URL and key
    pub fn new(url: &str, anon_key: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        if anon_key.trim().is_empty() {
            return Err(Error::config("anon key must not be empty"));
        }
        Ok(Self {
            url,
            anon_key: anon_key.to_string(),
        })
    }

    /// Load from `SUPABASE_URL` / `SUPABASE_ANON_KEY`, reading a `.env` file if present
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let url = env::var("SUPABASE_URL")
            .map_err(|_| Error::config("SUPABASE_URL environment variable not found"))?;
        let anon_key = env::var("SUPABASE_ANON_KEY")
            .map_err(|_| Error::config("SUPABASE_ANON_KEY environment variable not found"))?;

        Self::new(&url, &anon_key)
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> String {
        self.url.as_str().trim_end_matches('/').to_string()
    }
}

/// Tunables for the data layer
#[derive(Debug, Clone)]
pub struct BloomOptions {
    /// The database schema
    pub db_schema: String,

    /// The request timeout
    pub request_timeout: Option<Duration>,

    /// Product name used in export filenames
    pub product_name: String,

    /// Quiet period before a coalesced refetch runs
    pub refetch_debounce: Option<Duration>,

    /// Realtime heartbeat period
    pub realtime_heartbeat: Duration,
}

impl Default for BloomOptions {
    fn default() -> Self {
        Self {
            db_schema: "public".to_string(),
            request_timeout: Some(Duration::from_secs(30)),
            product_name: "bloom".to_string(),
            refetch_debounce: None,
            realtime_heartbeat: Duration::from_secs(30),
        }
    }
}

impl BloomOptions {
    /// Set the database schema
    pub fn with_db_schema(mut self, value: &str) -> Self {
        self.db_schema = value.to_string();
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    /// Set the product name used in export filenames
    pub fn with_product_name(mut self, value: &str) -> Self {
        self.product_name = value.to_string();
        self
    }

    /// Set the refetch quiet period
    pub fn with_refetch_debounce(mut self, value: Option<Duration>) -> Self {
        self.refetch_debounce = value;
        self
    }

    /// Set the realtime heartbeat period
    pub fn with_realtime_heartbeat(mut self, value: Duration) -> Self {
        self.realtime_heartbeat = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new() {
        let config = BloomConfig::new("https://example.supabase.co", "test-key").unwrap();
        assert_eq!(config.url.as_str(), "https://example.supabase.co/");
        assert_eq!(config.base_url(), "https://example.supabase.co");
        assert_eq!(config.anon_key, "test-key");
    }

    #[test]
    fn test_config_invalid_url() {
        let result = BloomConfig::new("invalid-url", "test-key");
        assert!(matches!(result, Err(Error::Url(_))));
    }

    #[test]
    fn test_config_empty_key() {
        let result = BloomConfig::new("https://example.supabase.co", "  ");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_options_builder() {
        let options = BloomOptions::default()
            .with_product_name("acme")
            .with_refetch_debounce(Some(Duration::from_millis(50)));
        assert_eq!(options.product_name, "acme");
        assert_eq!(options.db_schema, "public");
        assert_eq!(options.refetch_debounce, Some(Duration::from_millis(50)));
        assert_eq!(options.request_timeout, Some(Duration::from_secs(30)));
    }
}
