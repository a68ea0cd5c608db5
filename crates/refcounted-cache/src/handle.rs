//! Handles returned by `acquire`

use crate::cache::{CacheKey, CacheValue};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifies one outstanding reference to an entry.
///
/// Tokens come from a per-cache monotonic counter and are never reused by
/// that cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefToken(pub(crate) u64);

impl RefToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Returns a token to the cache that minted it
pub(crate) trait ReleaseRef<K>: Send + Sync {
    fn release(&self, key: &K, token: RefToken);
}

/// One claim on a cached value.
///
/// The claim ends on the first call to [`release`](Self::release) or when the
/// handle is dropped, whichever comes first. The value stays readable through
/// the handle after release, but the cache may clean it up at any time.
pub struct Handle<K: CacheKey, V: CacheValue> {
    key: K,
    value: Arc<V>,
    token: RefToken,
    cache: Arc<dyn ReleaseRef<K>>,
    released: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> Handle<K, V> {
    pub(crate) fn new(
        key: K,
        value: Arc<V>,
        token: RefToken,
        cache: Arc<dyn ReleaseRef<K>>,
    ) -> Self {
        Self {
            key,
            value,
            token,
            cache,
            released: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Shared pointer to the value; equal across handles for the same entry
    pub fn value_arc(&self) -> &Arc<V> {
        &self.value
    }

    pub fn token(&self) -> RefToken {
        self.token
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Drop this handle's reference. Safe to call any number of times.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.cache.release(&self.key, self.token);
        }
    }
}

impl<K: CacheKey, V: CacheValue> Deref for Handle<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K: CacheKey, V: CacheValue> Drop for Handle<K, V> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for Handle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("released", &self.is_released())
            .finish()
    }
}
