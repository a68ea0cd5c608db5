//! Scripted acquire/release walkthrough

use crate::connection::{Connection, Connector};
use crate::error::Result;
use refcounted_cache::{duration_ms, CacheConfig, CacheStats, Handle, RefCountedCache};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type ConnectionCache = RefCountedCache<String, Connection, String>;

/// What the cache looked like after one step
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub action: String,
    pub connection_id: Option<u64>,
    pub ref_count: usize,
    pub cleanup_pending: bool,
    pub opened: u64,
    pub closed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub key: String,
    pub timeout_ms: u64,
    pub steps: Vec<Step>,
    pub stats: CacheStats,
}

/// Build a connection cache backed by `connector`
pub fn build_cache(connector: Arc<Connector>, config: CacheConfig) -> Result<ConnectionCache> {
    let opener = connector.clone();
    let cache = RefCountedCache::new(
        move |key: &String, path: String| opener.open(key, &path),
        move |conn: &Connection| connector.close(conn),
        config,
    )?;
    Ok(cache)
}

struct Recorder<'a> {
    cache: &'a ConnectionCache,
    connector: &'a Connector,
    key: String,
    steps: Vec<Step>,
}

impl Recorder<'_> {
    fn record(&mut self, action: &str) {
        let step = Step {
            action: action.to_string(),
            connection_id: self.cache.inspect(&self.key).map(|c| c.id),
            ref_count: self.cache.ref_count(&self.key),
            cleanup_pending: self.cache.is_cleanup_pending(&self.key),
            opened: self.connector.opened(),
            closed: self.connector.closed(),
        };
        info!(
            action,
            connection_id = ?step.connection_id,
            ref_count = step.ref_count,
            cleanup_pending = step.cleanup_pending,
            "Scenario step"
        );
        self.steps.push(step);
    }

    fn acquire(&mut self, action: &str) -> Result<Handle<String, Connection>> {
        let handle = self.cache.acquire(self.key.clone(), "?pool=1".to_string(), None)?;
        self.record(action);
        Ok(handle)
    }
}

/// Walk one key through its whole lifecycle: shared acquire, partial and
/// full release, cancellation by re-acquire, cleanup, and reconstruction.
pub async fn run(cache: &ConnectionCache, connector: &Connector, key: &str) -> Result<ScenarioReport> {
    let timeout = cache.default_timeout();
    let mut rec = Recorder {
        cache,
        connector,
        key: key.to_string(),
        steps: Vec::new(),
    };

    let first = rec.acquire("acquire")?;
    let second = rec.acquire("acquire again")?;

    first.release();
    rec.record("release one");

    second.release();
    rec.record("release last");

    tokio::time::sleep(timeout / 2).await;
    let third = rec.acquire("re-acquire before timeout")?;

    third.release();
    rec.record("release again");

    tokio::time::sleep(timeout + Duration::from_millis(100)).await;
    rec.record("after timeout");

    let fourth = rec.acquire("acquire after cleanup")?;
    drop(fourth);
    rec.record("drop handle");

    let steps = rec.steps;
    Ok(ScenarioReport {
        key: key.to_string(),
        timeout_ms: duration_ms(timeout),
        steps,
        stats: cache.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scenario_walkthrough() {
        let connector = Arc::new(Connector::new("tcp://db.internal"));
        let cache =
            build_cache(connector.clone(), CacheConfig::new(Duration::from_millis(200))).unwrap();

        let report = run(&cache, &connector, "orders").await.unwrap();
        let steps = &report.steps;

        assert_eq!(report.timeout_ms, 200);
        assert_eq!(steps.len(), 9);

        // Two acquires share one connection
        assert_eq!(steps[1].ref_count, 2);
        assert_eq!(steps[1].opened, 1);

        // Partial release keeps it, full release schedules cleanup
        assert!(!steps[2].cleanup_pending);
        assert!(steps[3].cleanup_pending);

        // Re-acquire cancels the cleanup and reuses the connection
        assert_eq!(steps[4].connection_id, Some(1));
        assert!(!steps[4].cleanup_pending);
        assert_eq!(steps[4].closed, 0);

        // After the timeout the connection is closed and gone
        assert_eq!(steps[6].connection_id, None);
        assert_eq!(steps[6].closed, 1);

        // A later acquire opens a fresh connection
        assert_eq!(steps[7].connection_id, Some(2));
        assert_eq!(steps[7].opened, 2);
        assert!(steps[8].cleanup_pending);

        assert_eq!(report.stats.cancelled_cleanups, 1);
        assert_eq!(report.stats.misses, 2);
    }

    #[tokio::test]
    async fn test_build_cache_surfaces_open_errors() {
        let connector = Arc::new(Connector::new("tcp://db.internal"));
        let cache = build_cache(connector, CacheConfig::default()).unwrap();

        let err = cache.acquire(String::new(), String::new(), None).unwrap_err();
        assert!(err.to_string().contains("empty connection key"));
        assert!(cache.is_empty());
    }
}
