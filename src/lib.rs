//! Request-time IP reputation cache.
//!
//! A bounded LRU cache mapping client addresses to a resolved country,
//! optionally mirrored to a snapshot file so a restart starts warm. The
//! file is rewritten by a debounced background task, always through a
//! temp file and an atomic rename.
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn, Instrument};

pub mod config;
pub mod error;
pub mod logging;
pub mod reputation;
pub mod storage;

pub use error::{CacheError, DecodeError, PathError, PersistError, ValidationError};
pub use reputation::{IpCache, IpEntry, ReputationStore, FORCED_REFRESH_AGE, UNKNOWN_COUNTRY_CODE};
pub use storage::persist::{DEFAULT_PERSIST_INTERVAL, MAX_INTERVAL_MULTIPLIER};
pub use storage::{
    validate_persistence_path, CachePersist, DirtyNotifier, Pair, PersistStats, RecencyCache,
    SnapshotRecord, SnapshotSource,
};

/// What [`initialize_cache`] needs to build a cache.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Instance name, attached to every log line.
    pub name: String,
    pub capacity: usize,
    /// Snapshot file; `None`, blank or unusable means memory only.
    pub cache_path: Option<String>,
    /// Debounce interval; zero means [`DEFAULT_PERSIST_INTERVAL`].
    pub persist_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        config::CacheConfig::default().to_options()
    }
}

/// Build a cache and, when a usable path is configured, its persistence
/// controller.
///
/// An existing snapshot is imported before returning; a missing one is
/// fine. A bad path or unreadable snapshot is logged and only costs the
/// warm start or the persistence, never the cache. Must run inside a tokio
/// runtime.
pub async fn initialize_cache<K, V>(
    options: CacheOptions,
) -> Result<(Arc<RecencyCache<K, V>>, Option<CachePersist>), CacheError>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let cache = Arc::new(RecencyCache::new(options.capacity)?);
    let span = logging::instance_span(&options.name);

    let raw = options.cache_path.as_deref().unwrap_or("");
    let path = match validate_persistence_path(raw) {
        Ok(Some(path)) => path,
        Ok(None) => {
            span.in_scope(|| info!("IP cache persistence disabled (no path configured)"));
            return Ok((cache, None));
        }
        Err(e) => {
            span.in_scope(|| warn!(error = %e, "IP cache persistence disabled (path invalid)"));
            return Ok((cache, None));
        }
    };

    let warm = async {
        match tokio::fs::read(&path).await {
            Ok(bytes) => match cache.import_bytes(&bytes) {
                Ok(()) => info!(path = %path.display(), entries = cache.len(), "IP cache warm-loaded"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to warm-load IP cache"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to warm-load IP cache"),
        }
    };
    warm.instrument(span.clone()).await;

    let persist = CachePersist::spawn(path, cache.clone(), options.persist_interval, span.clone());
    span.in_scope(|| info!(path = %persist.path().display(), "IP cache persistence enabled"));

    Ok((cache, Some(persist)))
}
