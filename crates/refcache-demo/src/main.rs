//! Reference-counted cache demo
//!
//! Runs one key through the cache lifecycle against a simulated connection
//! pool and prints the step-by-step report as JSON.

mod connection;
mod error;
mod scenario;

use crate::connection::Connector;
use crate::error::Result;
use refcounted_cache::CacheConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Demo default; the library default of 60 s is too long to watch
const DEMO_TIMEOUT: Duration = Duration::from_millis(200);

/// Configuration for the demo run
#[derive(Debug, Clone)]
struct DemoConfig {
    endpoint: String,
    key: String,
    cache: CacheConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("refcache_demo=info".parse()?)
        .add_directive("refcounted_cache=debug".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting reference-counted cache demo...");

    let config = load_config();
    info!("Endpoint: {}", config.endpoint);
    info!("Key: {}", config.key);
    info!(
        "Cleanup timeout: {} ms",
        config.cache.default_timeout.as_millis()
    );

    let connector = Arc::new(Connector::new(config.endpoint));
    let cache = scenario::build_cache(connector.clone(), config.cache)?;
    cache.on_fault(|err| tracing::error!(error = %err, "Connection close failed"));

    let report = scenario::run(&cache, &connector, &config.key).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    drop(cache);
    info!(
        opened = connector.opened(),
        closed = connector.closed(),
        "Demo finished"
    );

    Ok(())
}

fn load_config() -> DemoConfig {
    let endpoint =
        std::env::var("DEMO_ENDPOINT").unwrap_or_else(|_| "tcp://localhost:5432".to_string());

    let key = std::env::var("DEMO_KEY").unwrap_or_else(|_| "orders".to_string());

    let cache = if std::env::var("REFCACHE_DEFAULT_TIMEOUT_MS").is_ok() {
        CacheConfig::from_env()
    } else {
        CacheConfig::new(DEMO_TIMEOUT)
    };

    DemoConfig {
        endpoint,
        key,
        cache,
    }
}
