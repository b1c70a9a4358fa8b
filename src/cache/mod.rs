//! Time-bounded keyed stores.
//!
//! One storage shape serves two roles: the client-side ticket cache in
//! [`ticket_cache`] and the server-side replay validator in [`replay`]. Both
//! need the same things from it, an atomic check-then-insert and reads that
//! never return an expired entry. [`ccache`] persists ticket entries in the
//! MIT credential-cache file format.

pub mod ccache;
pub mod replay;
pub mod ticket_cache;

pub use replay::{ReplayCache, ReplayKey};
pub use ticket_cache::{CachedTicket, RefreshFn, TicketCache};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Behavior of `add` when a live entry already holds the key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddMode {
    /// Last writer wins.
    #[default]
    Upsert,
    /// First writer wins until its entry expires.
    KeepExisting,
}

/// Cancellation handle for a background sweep task.
///
/// Dropping the handle does not stop the task; the owner calls
/// [`SweeperHandle::shutdown`] and awaits completion.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub(crate) fn new(stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { stop, task }
    }

    /// Signals the task to stop and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// A stored value with its validity window.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: OffsetDateTime,
    pub renew_until: Option<OffsetDateTime>,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// The shared store. Every operation takes the lock once; nothing is held
/// across user callbacks.
#[derive(Debug, Default)]
pub(crate) struct TimedStore<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TimedStore<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Check-then-insert as one step. Returns `false` only in
    /// [`AddMode::KeepExisting`] when a live entry already holds the key.
    pub(crate) fn add(&self, key: K, entry: CacheEntry<V>, mode: AddMode) -> bool {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.lock();

        match entries.entry(key) {
            Entry::Occupied(mut slot) => {
                if mode == AddMode::KeepExisting && !slot.get().is_expired(now) {
                    return false;
                }

                slot.insert(entry);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// A live entry for the key; expired entries are never returned.
    pub(crate) fn get(&self, key: &K) -> Option<CacheEntry<V>> {
        let now = OffsetDateTime::now_utc();
        let entries = self.lock();

        entries.get(key).filter(|entry| !entry.is_expired(now)).cloned()
    }

    pub(crate) fn remove(&self, key: &K) -> Option<CacheEntry<V>> {
        self.lock().remove(key)
    }

    /// Drops every expired entry and reports how many went.
    pub(crate) fn sweep(&self, now: OffsetDateTime) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));

        before - entries.len()
    }

    /// Clones the live entries; used by the sweeper to work on a snapshot
    /// instead of under the lock.
    pub(crate) fn snapshot(&self) -> Vec<(K, CacheEntry<V>)> {
        let now = OffsetDateTime::now_utc();

        self.lock()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn entry(value: &str, lifetime: Duration) -> CacheEntry<String> {
        CacheEntry {
            value: value.to_owned(),
            expires_at: OffsetDateTime::now_utc() + lifetime,
            renew_until: None,
        }
    }

    #[test]
    fn expired_entries_are_invisible() {
        let store = TimedStore::new();

        store.add("stale", entry("old", Duration::seconds(-1)), AddMode::Upsert);
        store.add("live", entry("new", Duration::minutes(5)), AddMode::Upsert);

        assert!(store.get(&"stale").is_none());
        assert_eq!(store.get(&"live").map(|e| e.value), Some("new".to_owned()));

        assert_eq!(store.sweep(OffsetDateTime::now_utc()), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn keep_existing_refuses_live_duplicates() {
        let store = TimedStore::new();

        assert!(store.add("key", entry("first", Duration::minutes(5)), AddMode::KeepExisting));
        assert!(!store.add("key", entry("second", Duration::minutes(5)), AddMode::KeepExisting));
        assert_eq!(store.get(&"key").map(|e| e.value), Some("first".to_owned()));

        assert!(store.add("key", entry("third", Duration::minutes(5)), AddMode::Upsert));
        assert_eq!(store.get(&"key").map(|e| e.value), Some("third".to_owned()));
    }

    #[test]
    fn expiry_frees_the_key_for_reinsertion() {
        let store = TimedStore::new();

        assert!(store.add("key", entry("first", Duration::seconds(-1)), AddMode::KeepExisting));
        assert!(store.add("key", entry("second", Duration::minutes(5)), AddMode::KeepExisting));
        assert_eq!(store.get(&"key").map(|e| e.value), Some("second".to_owned()));
    }
}
