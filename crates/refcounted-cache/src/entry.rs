//! Per-key cache record

use crate::executor::ScheduledTask;
use crate::handle::RefToken;
use crate::types::{duration_ms, EntryInfo};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Marks a key whose value is being built outside the table lock.
///
/// Other acquirers of the same key block in [`wait`](Self::wait) until the
/// building thread calls [`finish`](Self::finish), then look the key up again.
#[derive(Debug)]
pub(crate) struct Construction {
    owner: ThreadId,
    done: Mutex<bool>,
    ready: Condvar,
}

impl Construction {
    pub(crate) fn new() -> Self {
        Self {
            owner: thread::current().id(),
            done: Mutex::new(false),
            ready: Condvar::new(),
        }
    }

    /// True when called from inside the factory that is building this key
    pub(crate) fn is_owned_by_current_thread(&self) -> bool {
        self.owner == thread::current().id()
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .ready
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn finish(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.ready.notify_all();
    }
}

/// A cleanup scheduled on the executor, tagged so a late-firing task can tell
/// whether it is still the one the entry is waiting on.
#[derive(Debug)]
pub(crate) struct PendingCleanup {
    pub(crate) id: u64,
    pub(crate) task: ScheduledTask,
}

#[derive(Debug)]
pub(crate) struct Entry<V> {
    value: Arc<V>,
    refs: HashSet<RefToken>,
    pending: Option<PendingCleanup>,
    timeout: Duration,
    created_at: DateTime<Utc>,
}

impl<V> Entry<V> {
    pub(crate) fn new(value: V, timeout: Duration) -> Self {
        Self {
            value: Arc::new(value),
            refs: HashSet::new(),
            pending: None,
            timeout,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn value(&self) -> &Arc<V> {
        &self.value
    }

    pub(crate) fn into_value(self) -> Arc<V> {
        self.value
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.refs.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.refs.is_empty()
    }

    pub(crate) fn add_ref(&mut self, token: RefToken) {
        debug_assert!(self.pending.is_none(), "reference added while cleanup pending");
        self.refs.insert(token);
    }

    /// Returns false if the token was not held (already released).
    pub(crate) fn remove_ref(&mut self, token: RefToken) -> bool {
        self.refs.remove(&token)
    }

    pub(crate) fn pending_id(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.id)
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn set_pending(&mut self, id: u64, task: ScheduledTask) {
        debug_assert!(self.is_idle(), "cleanup scheduled with live references");
        if let Some(previous) = self.pending.replace(PendingCleanup { id, task }) {
            previous.task.cancel();
        }
    }

    pub(crate) fn take_pending(&mut self) -> Option<PendingCleanup> {
        self.pending.take()
    }

    pub(crate) fn info(&self) -> EntryInfo {
        EntryInfo {
            ref_count: self.refs.len(),
            cleanup_pending: self.pending.is_some(),
            timeout_ms: duration_ms(self.timeout),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_ref_set_tracks_tokens() {
        let mut entry = Entry::new("conn", Duration::from_millis(200));
        assert!(entry.is_idle());

        entry.add_ref(RefToken(1));
        entry.add_ref(RefToken(2));
        assert_eq!(entry.ref_count(), 2);

        assert!(entry.remove_ref(RefToken(1)));
        // Second removal of the same token is a no-op
        assert!(!entry.remove_ref(RefToken(1)));
        assert_eq!(entry.ref_count(), 1);

        assert!(entry.remove_ref(RefToken(2)));
        assert!(entry.is_idle());
        assert!(!entry.remove_ref(RefToken(99)));
        assert_eq!(entry.ref_count(), 0);
    }

    #[test]
    fn test_replacing_pending_cancels_previous() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let mut entry = Entry::new(7u32, Duration::from_secs(1));
        entry.set_pending(1, ScheduledTask::new(move || flag.store(true, Ordering::SeqCst)));
        assert_eq!(entry.pending_id(), Some(1));

        entry.set_pending(2, ScheduledTask::new(|| {}));
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(entry.pending_id(), Some(2));

        entry.take_pending().unwrap().task.fired();
        assert!(!entry.has_pending());
    }

    #[test]
    fn test_info_snapshot() {
        let mut entry = Entry::new((), Duration::from_millis(1500));
        entry.add_ref(RefToken(5));

        let info = entry.info();
        assert_eq!(info.ref_count, 1);
        assert!(!info.cleanup_pending);
        assert_eq!(info.timeout_ms, 1500);
    }

    #[test]
    fn test_info_saturates_huge_timeout() {
        let entry = Entry::new((), Duration::MAX);
        assert_eq!(entry.info().timeout_ms, u64::MAX);
    }

    #[test]
    fn test_construction_wakes_waiters() {
        let construction = Arc::new(Construction::new());
        assert!(construction.is_owned_by_current_thread());

        let waiter = {
            let construction = construction.clone();
            thread::spawn(move || {
                assert!(!construction.is_owned_by_current_thread());
                construction.wait();
            })
        };

        construction.finish();
        waiter.join().unwrap();

        // Waiting after finish returns immediately
        construction.wait();
    }
}
