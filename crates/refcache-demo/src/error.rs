//! Error types for the cache demo

use std::fmt;

#[derive(Debug)]
pub enum DemoError {
    Cache(refcounted_cache::CacheError),
    Json(String),
    Config(String),
}

impl fmt::Display for DemoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DemoError::Cache(err) => write!(f, "Cache error: {}", err),
            DemoError::Json(msg) => write!(f, "JSON error: {}", msg),
            DemoError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for DemoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DemoError::Cache(err) => Some(err),
            _ => None,
        }
    }
}

impl From<refcounted_cache::CacheError> for DemoError {
    fn from(err: refcounted_cache::CacheError) -> Self {
        DemoError::Cache(err)
    }
}

impl From<serde_json::Error> for DemoError {
    fn from(err: serde_json::Error) -> Self {
        DemoError::Json(err.to_string())
    }
}

impl From<tracing_subscriber::filter::ParseError> for DemoError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        DemoError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DemoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_display() {
        let err = DemoError::Cache(refcounted_cache::CacheError::NoRuntime);
        assert_eq!(format!("{}", err), "Cache error: No tokio runtime available");
    }

    #[test]
    fn test_config_error_display() {
        let err = DemoError::Config("bad filter".to_string());
        assert_eq!(format!("{}", err), "Configuration error: bad filter");
    }

    #[test]
    fn test_error_is_debug() {
        let err = DemoError::Json("trailing comma".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Json"));
    }
}
