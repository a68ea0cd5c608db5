//! Simulated expensive resource managed by the cache

use chrono::{DateTime, Utc};
use refcounted_cache::BoxError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// A pretend upstream connection
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: u64,
    pub target: String,
    pub opened_at: DateTime<Utc>,
}

/// Opens and closes connections, counting both
#[derive(Debug, Default)]
pub struct Connector {
    endpoint: String,
    next_id: AtomicU64,
    closed: AtomicU64,
}

impl Connector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Open a connection for `key`; `path` is appended to the endpoint
    pub fn open(&self, key: &str, path: &str) -> Result<Connection, BoxError> {
        if key.is_empty() {
            return Err("empty connection key".into());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let target = format!("{}/{}{}", self.endpoint.trim_end_matches('/'), key, path);
        info!(id, target = %target, "Opened connection");

        Ok(Connection {
            id,
            target,
            opened_at: Utc::now(),
        })
    }

    pub fn close(&self, conn: &Connection) -> Result<(), BoxError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        info!(id = conn.id, target = %conn.target, "Closed connection");
        Ok(())
    }

    pub fn opened(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }
}
