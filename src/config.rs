use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 500 * 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_FIRST_CHAPTERS_THRESHOLD: usize = 10;
pub const DEFAULT_ASSUMED_TOTAL_CHAPTERS: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct ImportConfig {
    pub request_timeout: Duration,
    pub max_content_length: u64,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Persisted chapter count that unblocks the reader.
    pub first_chapters_threshold: usize,
    /// Denominator for streaming percentages when metadata has no chapter count.
    pub assumed_total_chapters: usize,
    /// Enables the shared-drive media endpoint; without it the anonymous download link is used.
    #[serde(skip_serializing)]
    pub drive_api_key: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            first_chapters_threshold: DEFAULT_FIRST_CHAPTERS_THRESHOLD,
            assumed_total_chapters: DEFAULT_ASSUMED_TOTAL_CHAPTERS,
            drive_api_key: None,
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        config.drive_api_key = ["LEXICONFORGE_DRIVE_API_KEY", "GOOGLE_DRIVE_API_KEY"]
            .iter()
            .filter_map(|key| lookup(key))
            .map(|value| value.trim().to_owned())
            .find(|value| !value.is_empty());

        if let Some(raw) = lookup("LEXICONFORGE_IMPORT_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().with_context(|| {
                format!("invalid LEXICONFORGE_IMPORT_TIMEOUT_SECS={raw:?}. expected seconds")
            })?;
            if secs == 0 {
                anyhow::bail!("LEXICONFORGE_IMPORT_TIMEOUT_SECS must be > 0");
            }
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup("LEXICONFORGE_IMPORT_MAX_RETRIES") {
            config.max_retries = raw.trim().parse().with_context(|| {
                format!("invalid LEXICONFORGE_IMPORT_MAX_RETRIES={raw:?}. expected a count")
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_design_values() {
        let config = ImportConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.max_content_length, 500 * 1024 * 1024);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(2000));
        assert_eq!(config.first_chapters_threshold, 10);
        assert!(config.drive_api_key.is_none());
    }

    #[test]
    fn reads_overrides_and_drive_key() {
        let config = ImportConfig::from_lookup(lookup(&[
            ("GOOGLE_DRIVE_API_KEY", " key-123 "),
            ("LEXICONFORGE_IMPORT_TIMEOUT_SECS", "5"),
            ("LEXICONFORGE_IMPORT_MAX_RETRIES", "0"),
        ]))
        .unwrap();
        assert_eq!(config.drive_api_key.as_deref(), Some("key-123"));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn blank_drive_key_is_ignored() {
        let config =
            ImportConfig::from_lookup(lookup(&[("LEXICONFORGE_DRIVE_API_KEY", "  ")])).unwrap();
        assert!(config.drive_api_key.is_none());
    }

    #[test]
    fn rejects_unparsable_numbers() {
        let err = ImportConfig::from_lookup(lookup(&[("LEXICONFORGE_IMPORT_MAX_RETRIES", "many")]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("LEXICONFORGE_IMPORT_MAX_RETRIES"));
    }
}
