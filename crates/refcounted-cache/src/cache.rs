//! Reference-counted cache with deferred cleanup

use crate::entry::{Construction, Entry};
use crate::error::{BoxError, CacheError, Result};
use crate::executor::{DelayedExecutor, TokioExecutor};
use crate::handle::{Handle, RefToken, ReleaseRef};
use crate::types::{duration_ms, CacheConfig, CacheStats, EntryInfo};
use std::any::Any;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Bounds required of cache keys
pub trait CacheKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Bounds required of cached values
pub trait CacheValue: Send + Sync + 'static {}

impl<T> CacheValue for T where T: Send + Sync + 'static {}

type CreateFn<K, A, V> = Box<dyn Fn(&K, A) -> std::result::Result<V, BoxError> + Send + Sync>;
type CleanFn<V> = Box<dyn Fn(&V) -> std::result::Result<(), BoxError> + Send + Sync>;
type FaultFn = Box<dyn Fn(&CacheError) + Send + Sync>;

/// Live entries plus keys whose value is still being built
struct Table<K, V> {
    entries: HashMap<K, Entry<V>>,
    constructing: HashMap<K, Arc<Construction>>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            constructing: HashMap::new(),
        }
    }
}

/// Shared state behind a cache and all of its handles
pub(crate) struct Inner<K: CacheKey, V: CacheValue, A: 'static> {
    me: Weak<Inner<K, V, A>>,
    table: Mutex<Table<K, V>>,
    create: CreateFn<K, A, V>,
    clean: CleanFn<V>,
    on_fault: RwLock<Option<FaultFn>>,
    executor: Box<dyn DelayedExecutor>,
    default_timeout: Duration,
    next_token: AtomicU64,
    next_cleanup: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    cancelled_cleanups: AtomicU64,
    cleanups: AtomicU64,
    clean_failures: AtomicU64,
}

impl<K: CacheKey, V: CacheValue, A: 'static> Inner<K, V, A> {
    fn lock(&self) -> MutexGuard<'_, Table<K, V>> {
        // Callbacks never run under this lock, and the table is only mutated
        // after they return, so a poisoned lock still guards a consistent table.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel any pending cleanup and add a fresh reference to `entry`
    fn claim(&self, key: &K, entry: &mut Entry<V>) -> RefToken {
        if let Some(pending) = entry.take_pending() {
            pending.task.cancel();
            self.cancelled_cleanups.fetch_add(1, Ordering::Relaxed);
            debug!(key = ?key, cleanup_id = pending.id, "Cancelled pending cleanup");
        }

        let token = RefToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        entry.add_ref(token);
        token
    }

    /// Run the factory for `key` with the table unlocked, then install the
    /// value. The construction slot is removed and its waiters woken on every
    /// path, including a panicking factory.
    fn construct(
        &self,
        key: &K,
        args: A,
        timeout: Duration,
        construction: &Construction,
    ) -> Result<(Arc<V>, RefToken)> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.create)(key, args)));

        let installed = {
            let mut table = self.lock();
            table.constructing.remove(key);

            match outcome {
                Ok(Ok(value)) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        key = ?key,
                        timeout_ms = duration_ms(timeout),
                        "Created cache entry"
                    );
                    let mut entry = Entry::new(value, timeout);
                    let token = self.claim(key, &mut entry);
                    let value = entry.value().clone();
                    table.entries.insert(key.clone(), entry);
                    Ok(Ok((value, token)))
                }
                Ok(Err(err)) => {
                    warn!(key = ?key, error = %err, "Cache entry construction failed");
                    Ok(Err(CacheError::Create(err)))
                }
                Err(payload) => Err(payload),
            }
        };

        construction.finish();

        match installed {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Body of a delayed cleanup. Only proceeds if this cleanup is still the
    /// one the entry is waiting on and nobody re-acquired in the meantime.
    pub(crate) fn run_cleanup(&self, key: &K, cleanup_id: u64) {
        let removed = {
            let mut table = self.lock();

            let current = match table.entries.get_mut(key) {
                Some(entry) if entry.pending_id() == Some(cleanup_id) && entry.is_idle() => {
                    if let Some(pending) = entry.take_pending() {
                        pending.task.fired();
                    }
                    true
                }
                _ => false,
            };

            if current {
                table.entries.remove(key)
            } else {
                debug!(key = ?key, cleanup_id, "Skipping stale cleanup");
                None
            }
        };

        if let Some(entry) = removed {
            self.destroy(key, entry.into_value());
        }
    }

    /// Run the destructor for a value already removed from the table
    fn destroy(&self, key: &K, value: Arc<V>) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);

        let fault = match panic::catch_unwind(AssertUnwindSafe(|| (self.clean)(&value))) {
            Ok(Ok(())) => {
                debug!(key = ?key, "Cleaned cache entry");
                return;
            }
            Ok(Err(err)) => CacheError::Clean(err),
            Err(payload) => CacheError::CleanPanicked(panic_message(payload.as_ref())),
        };

        self.report_fault(key, fault);
    }

    fn report_fault(&self, key: &K, fault: CacheError) {
        self.clean_failures.fetch_add(1, Ordering::Relaxed);
        error!(key = ?key, error = %fault, "Cache entry cleanup failed");

        let reporter = self.on_fault.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(report) = reporter.as_ref() {
            report(&fault);
        }
    }
}

impl<K: CacheKey, V: CacheValue, A: 'static> ReleaseRef<K> for Inner<K, V, A> {
    /// Remove `token` from the entry for `key`; schedule or run cleanup if it
    /// was the last reference.
    fn release(&self, key: &K, token: RefToken) {
        let mut table = self.lock();

        let Some(entry) = table.entries.get_mut(key) else {
            return;
        };
        if !entry.remove_ref(token) {
            return;
        }
        if !entry.is_idle() || entry.has_pending() {
            return;
        }

        let timeout = entry.timeout();
        if timeout.is_zero() {
            let removed = table.entries.remove(key);
            drop(table);
            if let Some(entry) = removed {
                self.destroy(key, entry.into_value());
            }
            return;
        }

        let cleanup_id = self.next_cleanup.fetch_add(1, Ordering::Relaxed);
        let cache = self.me.clone();
        let task_key = key.clone();
        let task = self.executor.schedule(
            timeout,
            Box::new(move || {
                if let Some(cache) = cache.upgrade() {
                    cache.run_cleanup(&task_key, cleanup_id);
                }
            }),
        );
        entry.set_pending(cleanup_id, task);

        debug!(
            key = ?key,
            cleanup_id,
            timeout_ms = duration_ms(timeout),
            "Scheduled cache entry cleanup"
        );
    }
}

impl<K: CacheKey, V: CacheValue, A: 'static> Drop for Inner<K, V, A> {
    fn drop(&mut self) {
        let table = std::mem::take(self.table.get_mut().unwrap_or_else(PoisonError::into_inner));

        for (key, mut entry) in table.entries {
            if let Some(pending) = entry.take_pending() {
                pending.task.cancel();
            }
            self.destroy(&key, entry.into_value());
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A lazily-populated cache of shared values keyed by `K`.
///
/// `acquire` constructs a value with the factory on a miss and returns a
/// [`Handle`] to it. When the last handle for a key is released the entry's
/// cleanup is scheduled after its timeout; an `acquire` before then cancels
/// the cleanup and reuses the value. Cloning the cache shares its state.
///
/// The factory runs without the table locked, so it may acquire other keys
/// from the same cache. Acquirers of a key under construction wait for it.
pub struct RefCountedCache<K: CacheKey, V: CacheValue, A: 'static = ()> {
    inner: Arc<Inner<K, V, A>>,
}

impl<K: CacheKey, V: CacheValue, A: 'static> Clone for RefCountedCache<K, V, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: CacheKey, V: CacheValue, A: 'static> RefCountedCache<K, V, A> {
    /// Create a cache whose delayed cleanups run on the current tokio runtime
    pub fn new<C, D>(create: C, clean: D, config: CacheConfig) -> Result<Self>
    where
        C: Fn(&K, A) -> std::result::Result<V, BoxError> + Send + Sync + 'static,
        D: Fn(&V) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        Ok(Self::with_executor(
            create,
            clean,
            config,
            TokioExecutor::current()?,
        ))
    }

    /// Create a cache with an explicit delayed executor
    pub fn with_executor<C, D, E>(create: C, clean: D, config: CacheConfig, executor: E) -> Self
    where
        C: Fn(&K, A) -> std::result::Result<V, BoxError> + Send + Sync + 'static,
        D: Fn(&V) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
        E: DelayedExecutor,
    {
        Self {
            inner: Arc::new_cyclic(|me| Inner {
                me: me.clone(),
                table: Mutex::new(Table::default()),
                create: Box::new(create),
                clean: Box::new(clean),
                on_fault: RwLock::new(None),
                executor: Box::new(executor),
                default_timeout: config.default_timeout,
                next_token: AtomicU64::new(0),
                next_cleanup: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                cancelled_cleanups: AtomicU64::new(0),
                cleanups: AtomicU64::new(0),
                clean_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Register a callback that receives destructor failures.
    /// Failures are logged whether or not a callback is set.
    pub fn on_fault<F>(&self, report: F)
    where
        F: Fn(&CacheError) + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .on_fault
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Box::new(report));
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Acquire a reference to the value for `key`, constructing it on a miss.
    ///
    /// `args` is passed to the factory only when a value is constructed.
    /// `timeout` overrides the default cleanup delay for a newly created
    /// entry; it is ignored when the entry already exists. A factory that
    /// acquires the key it is building gets [`CacheError::CyclicConstruction`].
    pub fn acquire(&self, key: K, args: A, timeout: Option<Duration>) -> Result<Handle<K, V>> {
        let inner = &self.inner;

        let construction = loop {
            let mut table = inner.lock();

            if let Some(entry) = table.entries.get_mut(&key) {
                inner.hits.fetch_add(1, Ordering::Relaxed);
                if timeout.is_some() {
                    debug!(key = ?key, "Timeout override ignored for existing entry");
                }
                let token = inner.claim(&key, entry);
                let value = entry.value().clone();
                drop(table);
                return Ok(self.handle(key, value, token));
            }

            match table.constructing.get(&key) {
                Some(pending) if pending.is_owned_by_current_thread() => {
                    warn!(key = ?key, "Key acquired from inside its own construction");
                    return Err(CacheError::CyclicConstruction);
                }
                Some(pending) => {
                    let pending = pending.clone();
                    drop(table);
                    pending.wait();
                }
                None => {
                    let construction = Arc::new(Construction::new());
                    table.constructing.insert(key.clone(), construction.clone());
                    break construction;
                }
            }
        };

        let timeout = timeout.unwrap_or(inner.default_timeout);
        let (value, token) = inner.construct(&key, args, timeout, &construction)?;
        Ok(self.handle(key, value, token))
    }

    fn handle(&self, key: K, value: Arc<V>, token: RefToken) -> Handle<K, V> {
        let cache: Arc<dyn ReleaseRef<K>> = self.inner.clone();
        Handle::new(key, value, token, cache)
    }

    /// Current value for `key`, if any. Does not touch reference counts.
    pub fn inspect<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.value().clone())
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().entries.contains_key(key)
    }

    /// Outstanding references for `key`; zero if absent
    pub fn ref_count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.ref_count())
            .unwrap_or(0)
    }

    pub fn is_cleanup_pending<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.has_pending())
            .unwrap_or(false)
    }

    pub fn entry_info<Q>(&self, key: &Q) -> Option<EntryInfo>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().entries.get(key).map(|entry| entry.info())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        let table = inner.lock();
        CacheStats {
            entries: table.entries.len(),
            live_references: table.entries.values().map(|e| e.ref_count()).sum(),
            pending_cleanups: table.entries.values().filter(|e| e.has_pending()).count(),
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            cancelled_cleanups: inner.cancelled_cleanups.load(Ordering::Relaxed),
            cleanups: inner.cleanups.load(Ordering::Relaxed),
            clean_failures: inner.clean_failures.load(Ordering::Relaxed),
        }
    }
}

impl<K: CacheKey, V: CacheValue, A: Default + 'static> RefCountedCache<K, V, A> {
    /// `acquire` with default construction args and the default timeout
    pub fn get(&self, key: K) -> Result<Handle<K, V>> {
        self.acquire(key, A::default(), None)
    }
}

impl<K: CacheKey, V: CacheValue, A: 'static> fmt::Debug for RefCountedCache<K, V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountedCache")
            .field("default_timeout", &self.inner.default_timeout)
            .field("stats", &self.stats())
            .finish()
    }
}
