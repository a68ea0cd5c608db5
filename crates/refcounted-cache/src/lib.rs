//! Reference-counted in-memory cache with deferred, cancellable cleanup
//!
//! Values are constructed lazily on the first `acquire` for a key, shared by
//! every handle acquired while the entry is live, and destroyed only after the
//! last handle is released and the entry's cleanup delay passes without a new
//! `acquire` for the same key.

mod cache;
mod entry;
pub mod error;
pub mod executor;
mod handle;
mod types;

pub use cache::{CacheKey, CacheValue, RefCountedCache};
pub use error::{BoxError, CacheError, Result};
pub use executor::{DelayedExecutor, ScheduledTask, TokioExecutor};
pub use handle::{Handle, RefToken};
pub use types::{duration_ms, CacheConfig, CacheStats, EntryInfo, DEFAULT_TIMEOUT};
