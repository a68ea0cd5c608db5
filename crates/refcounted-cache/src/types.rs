//! Cache configuration and diagnostic snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Cleanup delay used when neither the config nor the caller supplies one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(60 * 1000);

/// Configuration for a cache instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Delay between the last release of an entry and its cleanup.
    /// Zero means entries are cleaned synchronously on last release.
    pub default_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl CacheConfig {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Parse configuration from environment variables
    ///
    /// `REFCACHE_DEFAULT_TIMEOUT_MS` is read as a signed integer; negative
    /// values clamp to zero and unparsable values fall back to the default.
    pub fn from_env() -> Self {
        let default_timeout = env::var("REFCACHE_DEFAULT_TIMEOUT_MS")
            .ok()
            .and_then(|s| parse_timeout_ms(&s))
            .unwrap_or(DEFAULT_TIMEOUT);

        Self { default_timeout }
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_timeout_ms(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .map(|ms| Duration::from_millis(ms.max(0) as u64))
}

/// Point-in-time view of one cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub ref_count: usize,
    pub cleanup_pending: bool,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently in the table
    pub entries: usize,
    /// Outstanding references across all entries
    pub live_references: usize,
    /// Entries with a scheduled cleanup
    pub pending_cleanups: usize,
    /// Acquires served by an existing entry
    pub hits: u64,
    /// Acquires that constructed a new value
    pub misses: u64,
    /// Scheduled cleanups cancelled by a re-acquire
    pub cancelled_cleanups: u64,
    /// Cleanups that ran (including failed ones)
    pub cleanups: u64,
    /// Cleanups whose destructor errored or panicked
    pub clean_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_timeout_ms() {
        assert_eq!(parse_timeout_ms("200"), Some(Duration::from_millis(200)));
        assert_eq!(parse_timeout_ms(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_timeout_ms("-5"), Some(Duration::ZERO));
        assert_eq!(parse_timeout_ms("soon"), None);
    }

    #[test]
    fn test_duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.live_references, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.clean_failures, 0);
    }

    #[test]
    fn test_entry_info_serialization() {
        let info = EntryInfo {
            ref_count: 2,
            cleanup_pending: false,
            timeout_ms: 12345,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"ref_count\":2"));
        assert!(json.contains("12345"));

        let deserialized: EntryInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.ref_count, info.ref_count);
        assert_eq!(deserialized.timeout_ms, info.timeout_ms);
    }
}
