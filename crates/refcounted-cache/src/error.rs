//! Error types for the reference-counted cache

use std::fmt;

/// Boxed error returned by user-supplied factory and destructor callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug)]
pub enum CacheError {
    /// The factory failed; no entry was installed
    Create(BoxError),
    /// A factory tried to acquire the key it is constructing
    CyclicConstruction,
    /// The destructor returned an error during cleanup
    Clean(BoxError),
    /// The destructor panicked during cleanup
    CleanPanicked(String),
    /// No tokio runtime was available to drive delayed cleanups
    NoRuntime,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Create(err) => write!(f, "Create error: {}", err),
            CacheError::CyclicConstruction => {
                write!(f, "Key acquired from inside its own construction")
            }
            CacheError::Clean(err) => write!(f, "Clean error: {}", err),
            CacheError::CleanPanicked(msg) => write!(f, "Clean panicked: {}", msg),
            CacheError::NoRuntime => write!(f, "No tokio runtime available"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Create(err) | CacheError::Clean(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<tokio::runtime::TryCurrentError> for CacheError {
    fn from(_: tokio::runtime::TryCurrentError) -> Self {
        CacheError::NoRuntime
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_create_error_display() {
        let err = CacheError::Create("connection refused".into());
        assert_eq!(format!("{}", err), "Create error: connection refused");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_clean_panicked_display() {
        let err = CacheError::CleanPanicked("boom".to_string());
        assert_eq!(format!("{}", err), "Clean panicked: boom");
        assert!(err.source().is_none());
    }

    #[test]
    fn test_cyclic_construction_display() {
        let err = CacheError::CyclicConstruction;
        assert_eq!(
            format!("{}", err),
            "Key acquired from inside its own construction"
        );
    }

    #[test]
    fn test_no_runtime_display() {
        let err = CacheError::NoRuntime;
        assert_eq!(format!("{}", err), "No tokio runtime available");
    }

    #[test]
    fn test_error_is_debug() {
        let err = CacheError::Clean("disk busy".into());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Clean"));
    }
}
