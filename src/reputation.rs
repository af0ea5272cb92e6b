// Cached country lookups keyed by client IP
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{DirtyNotifier, RecencyCache};

/// Country code stored when the lookup service could not place an address.
pub const UNKNOWN_COUNTRY_CODE: &str = "AA";

/// Age after which callers force a fresh lookup (30 days).
pub const FORCED_REFRESH_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// A resolved country and when it was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpEntry {
    pub country: String,
    pub resolved_at: DateTime<Utc>,
}

impl IpEntry {
    pub fn new(country: impl Into<String>) -> Self {
        Self::resolved_at(country, Utc::now())
    }

    pub fn resolved_at(country: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            country: country.into(),
            resolved_at: at,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.country == UNKNOWN_COUNTRY_CODE
    }

    /// Time since resolution; zero if the clock went backwards.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.resolved_at).to_std().unwrap_or_default()
    }

    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) >= max_age
    }
}

pub type IpCache = RecencyCache<IpAddr, IpEntry>;

/// The cache as the request path sees it: reads and writes that keep the
/// persistence task informed.
#[derive(Debug, Clone)]
pub struct ReputationStore {
    cache: Arc<IpCache>,
    notifier: Option<DirtyNotifier>,
}

impl ReputationStore {
    pub fn new(cache: Arc<IpCache>, notifier: Option<DirtyNotifier>) -> Self {
        Self { cache, notifier }
    }

    pub fn cache(&self) -> &Arc<IpCache> {
        &self.cache
    }

    fn mark_dirty(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.mark_dirty();
        }
    }

    /// Cached entry for `ip`. A hit changes recency, which is worth
    /// persisting too.
    pub fn lookup(&self, ip: &IpAddr) -> Option<IpEntry> {
        let entry = self.cache.get(ip)?;
        self.mark_dirty();
        Some(entry)
    }

    /// Like [`ReputationStore::lookup`] but entries at least `max_age` old
    /// count as misses. They stay cached until the caller records a fresh
    /// result.
    pub fn lookup_fresh(&self, ip: &IpAddr, max_age: Duration) -> Option<IpEntry> {
        self.lookup(ip)
            .filter(|entry| !entry.is_stale(max_age, Utc::now()))
    }

    /// Store a freshly resolved country for `ip`.
    pub fn record(&self, ip: IpAddr, country: impl Into<String>) -> IpEntry {
        let entry = IpEntry::new(country);
        self.cache.add(ip, entry.clone());
        self.mark_dirty();
        entry
    }

    pub fn forget(&self, ip: &IpAddr) -> bool {
        let removed = self.cache.remove(ip);
        if removed {
            self.mark_dirty();
        }
        removed
    }
}
