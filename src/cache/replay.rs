//! Authenticator replay detection.
//!
//! An acceptor records the identity of every authenticator it validates and
//! rejects a second appearance within the clock-skew window. Entries are
//! retained for twice the permitted skew so a delayed duplicate cannot slip
//! in after its original ages out of the window.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use time::{Duration, OffsetDateTime};
use tokio::sync::watch;

use super::{AddMode, CacheEntry, SweeperHandle, TimedStore};

/// The replay-detection unit: which client sent which authenticator at which
/// microsecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplayKey {
    pub crealm: String,
    pub cname: String,
    pub ctime: OffsetDateTime,
    pub cusec: u32,
}

#[derive(Debug)]
pub struct ReplayCache {
    store: TimedStore<ReplayKey, ()>,
    retention: Duration,
}

impl ReplayCache {
    /// `max_time_skew` is the acceptor's clock-skew tolerance; entries live
    /// for twice that.
    pub fn new(max_time_skew: Duration) -> Self {
        Self {
            store: TimedStore::new(),
            retention: max_time_skew * 2,
        }
    }

    /// Records the authenticator identity. `false` means the identity was
    /// already seen within the retention window, a replay.
    pub fn add(&self, key: ReplayKey) -> bool {
        let entry = CacheEntry {
            value: (),
            expires_at: OffsetDateTime::now_utc() + self.retention,
            renew_until: None,
        };

        self.store.add(key, entry, AddMode::KeepExisting)
    }

    pub fn sweep_now(&self) -> usize {
        self.store.sweep(OffsetDateTime::now_utc())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts aged-out identities every `every` until the handle is shut
    /// down.
    pub fn spawn_sweeper(self: &Arc<Self>, every: StdDuration) -> SweeperHandle {
        let cache = Arc::clone(self);
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep_now();
                        if removed > 0 {
                            trace!(removed, "replay cache sweep");
                        }
                    }
                }
            }
        });

        SweeperHandle::new(stop, task)
    }
}
