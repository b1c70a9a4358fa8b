//! Client-side ticket cache.
//!
//! Keyed by the service principal string. A background sweeper evicts expired
//! entries and, when a refresh callback is supplied, renews renewable entries
//! that are close to their end time. The refresh call runs outside the cache
//! lock.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures::future::BoxFuture;
use picky_krb::data_types::Ticket;
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;

use super::{AddMode, CacheEntry, SweeperHandle, TimedStore};
use crate::crypto::Key;
use crate::principal::PrincipalName;
use crate::Result;

/// Renews one cached ticket; returns the replacement entry.
pub type RefreshFn = Arc<dyn Fn(CachedTicket) -> BoxFuture<'static, Result<CachedTicket>> + Send + Sync>;

/// A ticket, its session key, and the validity window the KDC granted.
///
/// The ticket itself stays opaque ciphertext; the window fields are the
/// client's copy from the reply enc-part.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedTicket {
    pub client: PrincipalName,
    pub service: PrincipalName,
    pub ticket: Ticket,
    pub session_key: Key,
    /// Ticket flags in wire bit order.
    pub flags: u32,
    pub auth_time: OffsetDateTime,
    pub start_time: Option<OffsetDateTime>,
    pub end_time: OffsetDateTime,
    pub renew_till: Option<OffsetDateTime>,
}

impl CachedTicket {
    pub fn is_renewable(&self, now: OffsetDateTime) -> bool {
        self.renew_till.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct TicketCache {
    store: TimedStore<String, CachedTicket>,
    add_mode: AddMode,
    renewal_margin: Duration,
}

impl Default for TicketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketCache {
    pub fn new() -> Self {
        Self {
            store: TimedStore::new(),
            add_mode: AddMode::default(),
            renewal_margin: Duration::minutes(5),
        }
    }

    /// Controls whether `add` may replace a live entry. [`AddMode::Upsert`]
    /// keeps the newest acquisition; [`AddMode::KeepExisting`] protects a
    /// concurrently fetched ticket from being clobbered.
    pub fn with_add_mode(mut self, mode: AddMode) -> Self {
        self.add_mode = mode;
        self
    }

    /// How long before expiry an entry becomes a renewal candidate.
    pub fn with_renewal_margin(mut self, margin: Duration) -> Self {
        self.renewal_margin = margin;
        self
    }

    /// Stores a ticket under its service principal. Returns `false` when
    /// [`AddMode::KeepExisting`] kept a live entry instead.
    pub fn add(&self, ticket: CachedTicket) -> bool {
        self.insert(ticket, self.add_mode)
    }

    fn insert(&self, ticket: CachedTicket, mode: AddMode) -> bool {
        let entry = CacheEntry {
            expires_at: ticket.end_time,
            renew_until: ticket.renew_till,
            value: ticket,
        };

        self.store.add(entry.value.service.to_string(), entry, mode)
    }

    /// A live cached ticket for the service; a miss only means the caller
    /// must acquire one.
    pub fn get(&self, service: &PrincipalName) -> Option<CachedTicket> {
        self.store.get(&service.to_string()).map(|entry| entry.value)
    }

    pub fn remove(&self, service: &PrincipalName) -> Option<CachedTicket> {
        self.store.remove(&service.to_string()).map(|entry| entry.value)
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

    fn renewal_candidates(&self, now: OffsetDateTime) -> Vec<CachedTicket> {
        self.store
            .snapshot()
            .into_iter()
            .map(|(_, entry)| entry.value)
            .filter(|ticket| ticket.end_time - now <= self.renewal_margin && ticket.is_renewable(now))
            .collect()
    }

    async fn sweep_and_renew(&self, refresh: Option<&RefreshFn>) {
        let now = OffsetDateTime::now_utc();

        let removed = self.store.sweep(now);
        if removed > 0 {
            trace!(removed, "ticket cache sweep");
        }

        let Some(refresh) = refresh else {
            return;
        };

        for ticket in self.renewal_candidates(now) {
            let service = ticket.service.clone();

            match refresh(ticket).await {
                Ok(renewed) => {
                    debug!(%service, "renewed cached ticket");
                    self.insert(renewed, AddMode::Upsert);
                }
                Err(err) => warn!(%service, %err, "ticket renewal failed"),
            }
        }
    }

    /// Sweeps every `every`; with a refresh callback, also renews candidate
    /// entries each pass.
    pub fn spawn_sweeper(self: &Arc<Self>, every: StdDuration, refresh: Option<RefreshFn>) -> SweeperHandle {
        let cache = Arc::clone(self);
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => cache.sweep_and_renew(refresh.as_ref()).await,
                }
            }
        });

        SweeperHandle::new(stop, task)
    }
}
