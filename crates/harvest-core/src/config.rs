//! Capture configuration.

use serde::{Deserialize, Serialize};

/// Identifier of the page entries fall into when no page is current.
pub const DEFAULT_PAGE_REF: &str = "Default";

/// Title of the default page.
pub const DEFAULT_PAGE_TITLE: &str = "Default";

/// Archive format version written into every snapshot.
pub const ARCHIVE_VERSION: &str = "1.1";

/// Number of finalized exchanges remembered for stray-callback detection.
pub const DEFAULT_FINALIZED_CAPACITY: usize = 4096;

/// Settings for the capture engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Name written to `log.creator.name`.
    pub creator_name: String,
    /// Version written to `log.creator.version`.
    pub creator_version: String,
    /// Comment written to `log.creator.comment`.
    pub creator_comment: String,
    /// Value of `log.version`.
    pub archive_version: String,
    /// Id of the lazily created default page.
    pub default_page_ref: String,
    /// Title of the lazily created default page.
    pub default_page_title: String,
    /// Persist a snapshot after every recorded exchange.
    pub persist_on_entry: bool,
    /// Create an entry for failed exchanges that never produced a request.
    pub fallback_entry_without_request: bool,
    /// How many finalized exchange ids are remembered.
    pub finalized_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            creator_name: "Harvest".to_string(),
            creator_version: env!("CARGO_PKG_VERSION").to_string(),
            creator_comment: String::new(),
            archive_version: ARCHIVE_VERSION.to_string(),
            default_page_ref: DEFAULT_PAGE_REF.to_string(),
            default_page_title: DEFAULT_PAGE_TITLE.to_string(),
            persist_on_entry: true,
            fallback_entry_without_request: false,
            finalized_capacity: DEFAULT_FINALIZED_CAPACITY,
        }
    }
}

impl CaptureConfig {
    /// Sets the creator name.
    pub fn with_creator(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.creator_name = name.into();
        self.creator_version = version.into();
        self
    }

    /// Enables or disables per-entry snapshots.
    pub fn with_persist_on_entry(mut self, enabled: bool) -> Self {
        self.persist_on_entry = enabled;
        self
    }

    /// Enables or disables fallback entries for request-less failures.
    pub fn with_fallback_entry_without_request(mut self, enabled: bool) -> Self {
        self.fallback_entry_without_request = enabled;
        self
    }

    /// Sets the finalized-exchange memory size.
    pub fn with_finalized_capacity(mut self, capacity: usize) -> Self {
        self.finalized_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.default_page_ref, "Default");
        assert_eq!(config.archive_version, "1.1");
        assert!(config.persist_on_entry);
        assert!(!config.fallback_entry_without_request);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: CaptureConfig =
            serde_json::from_str(r#"{"creator_name": "harvest-ci", "persist_on_entry": false}"#).unwrap();
        assert_eq!(config.creator_name, "harvest-ci");
        assert!(!config.persist_on_entry);
        assert_eq!(config.finalized_capacity, DEFAULT_FINALIZED_CAPACITY);
    }

    #[test]
    fn finalized_capacity_is_never_zero() {
        let config = CaptureConfig::default().with_finalized_capacity(0);
        assert_eq!(config.finalized_capacity, 1);
    }
}
