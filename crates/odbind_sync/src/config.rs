//! Configuration for the sync engine.

use std::collections::BTreeMap;
use std::time::Duration;

/// Default prefix of the atomicity group id shared by one save.
pub const DEFAULT_ATOMICITY_GROUP: &str = "entitySave";

/// Configuration for remote operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Service root URL.
    pub service_url: String,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
    /// Prefix of the atomicity group id; a random suffix is appended per
    /// save.
    pub atomicity_group: String,
    /// Whether configured date fields are coerced on load.
    pub coerce_dates: bool,
    /// Request timeout.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Creates a new configuration.
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            headers: BTreeMap::new(),
            atomicity_group: DEFAULT_ATOMICITY_GROUP.to_string(),
            coerce_dates: true,
            timeout: Duration::from_secs(30),
        }
    }

    /// Adds a default header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the atomicity group prefix.
    pub fn with_atomicity_group(mut self, prefix: impl Into<String>) -> Self {
        self.atomicity_group = prefix.into();
        self
    }

    /// Enables or disables date coercion.
    pub fn with_coerce_dates(mut self, coerce: bool) -> Self {
        self.coerce_dates = coerce;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("https://odata.example.com/service")
            .with_header("Authorization", "Bearer token")
            .with_atomicity_group("orderSave")
            .with_coerce_dates(false)
            .with_timeout(Duration::from_secs(5));

        assert_eq!(config.service_url, "https://odata.example.com/service");
        assert_eq!(
            config.headers.get("Authorization").map(String::as_str),
            Some("Bearer token")
        );
        assert_eq!(config.atomicity_group, "orderSave");
        assert!(!config.coerce_dates);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.atomicity_group, DEFAULT_ATOMICITY_GROUP);
        assert!(config.coerce_dates);
        assert!(config.headers.is_empty());
    }
}
