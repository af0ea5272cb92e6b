// Debounced background persistence of cache snapshots
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, Instrument, Span};

use super::snapshot::SnapshotSource;
use super::write_atomic;
use crate::error::PersistError;

/// Debounce interval used when none (or zero) is configured.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(10);

/// The longest a dirty cache may wait for a flush, in debounce intervals.
pub const MAX_INTERVAL_MULTIPLIER: u32 = 3;

/// Counters describing what the persistence task has done so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistStats {
    /// Snapshots that reached the target path.
    pub flushes: u64,
    /// Flush attempts that failed and left the cache dirty.
    pub failures: u64,
    /// Wall-clock time of the last successful flush.
    pub last_flush: Option<SystemTime>,
    pub dirty: bool,
}

struct FlushClock {
    at: Instant,
    wall: Option<SystemTime>,
}

struct Shared {
    path: PathBuf,
    min_interval: Duration,
    max_interval: Duration,
    // Bumped by every mark_dirty; the cache is clean while both match.
    generation: AtomicU64,
    persisted: AtomicU64,
    clock: Mutex<FlushClock>,
    flushes: AtomicU64,
    failures: AtomicU64,
}

impl Shared {
    fn is_dirty(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.persisted.load(Ordering::Acquire)
    }

    fn since_last_flush(&self) -> Duration {
        let clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        Instant::now().saturating_duration_since(clock.at)
    }

    /// Write a snapshot if anything changed since the last good one.
    /// Returns whether a snapshot was written.
    fn flush_if_dirty<S: SnapshotSource + ?Sized>(&self, source: &S) -> Result<bool, PersistError> {
        // Read the generation before snapshotting: every mutation it covers
        // happened before the snapshot, so the snapshot includes it.
        let target = self.generation.load(Ordering::Acquire);
        if target == self.persisted.load(Ordering::Acquire) {
            return Ok(false);
        }

        let result = source
            .encode_snapshot()
            .map_err(PersistError::Snapshot)
            .and_then(|bytes| write_atomic(&self.path, &bytes));

        match result {
            Ok(()) => {
                self.persisted.fetch_max(target, Ordering::AcqRel);
                let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
                clock.at = Instant::now();
                clock.wall = Some(SystemTime::now());
                self.flushes.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// Cheap, cloneable handle for marking the cache dirty from request paths.
#[derive(Clone)]
pub struct DirtyNotifier {
    shared: Arc<Shared>,
    nudge: mpsc::Sender<()>,
}

impl DirtyNotifier {
    /// Record that the cache changed and wake the persistence task.
    ///
    /// Never blocks. Calls made while a wake-up is already pending collapse
    /// into that one wake-up.
    pub fn mark_dirty(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        // Full means a wake-up is already queued; closed means the task is gone.
        let _ = self.nudge.try_send(());
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.is_dirty()
    }
}

impl std::fmt::Debug for DirtyNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyNotifier")
            .field("path", &self.shared.path)
            .finish()
    }
}

/// Owner of the background task that keeps a snapshot file in step with
/// a cache.
///
/// Under steady mutation the file is rewritten at most once per debounce
/// interval and never later than [`MAX_INTERVAL_MULTIPLIER`] intervals
/// after the last good flush. [`CachePersist::shutdown`] performs a final
/// flush and waits for it. Dropping the controller also triggers the final
/// flush, but nothing waits for it.
pub struct CachePersist {
    notifier: DirtyNotifier,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CachePersist {
    /// Start persisting `source` to `path` on the current tokio runtime.
    ///
    /// `path` is expected to be validated already. A zero interval falls
    /// back to [`DEFAULT_PERSIST_INTERVAL`]. Every log line of the task is
    /// emitted inside `span`.
    pub fn spawn<S: SnapshotSource>(
        path: PathBuf,
        source: Arc<S>,
        persist_interval: Duration,
        span: Span,
    ) -> Self {
        let min_interval = if persist_interval.is_zero() {
            DEFAULT_PERSIST_INTERVAL
        } else {
            persist_interval
        };

        let shared = Arc::new(Shared {
            path,
            min_interval,
            max_interval: min_interval * MAX_INTERVAL_MULTIPLIER,
            generation: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            clock: Mutex::new(FlushClock {
                at: Instant::now(),
                wall: None,
            }),
            flushes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        // One slot: the pending wake-up itself, not a queue of them.
        let (nudge_tx, nudge_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(
            run(source, shared.clone(), nudge_rx, stop_rx).instrument(span),
        );

        Self {
            notifier: DirtyNotifier {
                shared,
                nudge: nudge_tx,
            },
            stop: stop_tx,
            task,
        }
    }

    pub fn mark_dirty(&self) {
        self.notifier.mark_dirty();
    }

    /// Handle for request threads that only need to mark the cache dirty.
    pub fn notifier(&self) -> DirtyNotifier {
        self.notifier.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.notifier.shared.is_dirty()
    }

    pub fn path(&self) -> &Path {
        &self.notifier.shared.path
    }

    pub fn min_interval(&self) -> Duration {
        self.notifier.shared.min_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.notifier.shared.max_interval
    }

    pub fn stats(&self) -> PersistStats {
        let shared = &self.notifier.shared;
        let clock = shared.clock.lock().unwrap_or_else(PoisonError::into_inner);
        PersistStats {
            flushes: shared.flushes.load(Ordering::Relaxed),
            failures: shared.failures.load(Ordering::Relaxed),
            last_flush: clock.wall,
            dirty: shared.is_dirty(),
        }
    }

    /// Ask the task to do its final flush and exit. Does not wait.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit; call [`CachePersist::stop`] first.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "cache persistence task ended abnormally");
        }
    }

    /// Stop the task and wait until its final flush is done.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

impl std::fmt::Debug for CachePersist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePersist")
            .field("path", &self.notifier.shared.path)
            .field("min_interval", &self.notifier.shared.min_interval)
            .field("max_interval", &self.notifier.shared.max_interval)
            .finish()
    }
}

// Resolves once a stop is requested or the controller is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn run<S: SnapshotSource>(
    source: Arc<S>,
    shared: Arc<Shared>,
    mut nudges: mpsc::Receiver<()>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(Instant::now() + shared.max_interval, shared.max_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        path = %shared.path.display(),
        min_interval_ms = shared.min_interval.as_millis() as u64,
        max_interval_ms = shared.max_interval.as_millis() as u64,
        "cache persistence task started"
    );

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            nudge = nudges.recv() => {
                if nudge.is_none() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !shared.is_dirty() {
                    continue;
                }
            }
        }

        // Coalesce whatever else arrived in the same burst.
        while nudges.try_recv().is_ok() {}

        let since = shared.since_last_flush();
        if since < shared.max_interval {
            let remaining = shared.min_interval.saturating_sub(since);
            if !remaining.is_zero() {
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break,
                    _ = time::sleep(remaining) => {}
                }
            }
        }

        flush(&source, &shared).await;
    }

    flush(&source, &shared).await;
    debug!(path = %shared.path.display(), "cache persistence task stopped");
}

async fn flush<S: SnapshotSource>(source: &Arc<S>, shared: &Arc<Shared>) {
    let task_source = source.clone();
    let task_shared = shared.clone();
    let outcome =
        tokio::task::spawn_blocking(move || task_shared.flush_if_dirty(&*task_source)).await;

    match outcome {
        Ok(Ok(true)) => debug!(path = %shared.path.display(), "cache snapshot written"),
        Ok(Ok(false)) => {}
        Ok(Err(e)) => error!(
            path = %shared.path.display(),
            error = %e,
            "cache snapshot flush failed, will retry"
        ),
        Err(e) => error!(error = %e, "cache snapshot flush task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use std::sync::atomic::AtomicBool;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeSource {
        encodes: AtomicU64,
        failing: AtomicBool,
        // When set, the first encode marks the cache dirty again, as a
        // request landing mid-flush would.
        remark: OnceLock<DirtyNotifier>,
        remarked: AtomicBool,
    }

    impl SnapshotSource for FakeSource {
        fn encode_snapshot(&self) -> Result<Vec<u8>, CacheError> {
            let n = self.encodes.fetch_add(1, Ordering::SeqCst);
            if let Some(notifier) = self.remark.get() {
                if !self.remarked.swap(true, Ordering::SeqCst) {
                    notifier.mark_dirty();
                }
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, "encoder offline")));
            }
            Ok(format!("snapshot-{n}").into_bytes())
        }
    }

    fn start(dir: &TempDir, source: Arc<FakeSource>, interval_ms: u64) -> CachePersist {
        CachePersist::spawn(
            dir.path().join("cache.bin"),
            source,
            Duration::from_millis(interval_ms),
            Span::none(),
        )
    }

    #[tokio::test]
    async fn test_zero_interval_uses_default() {
        let dir = TempDir::new().unwrap();
        let persist = start(&dir, Arc::new(FakeSource::default()), 0);

        assert_eq!(persist.min_interval(), DEFAULT_PERSIST_INTERVAL);
        assert_eq!(persist.max_interval(), DEFAULT_PERSIST_INTERVAL * 3);
        persist.shutdown().await;
    }

    #[tokio::test]
    async fn test_burst_of_marks_flushes_once() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        let persist = start(&dir, source.clone(), 100);

        for _ in 0..50 {
            persist.mark_dirty();
        }
        assert!(persist.is_dirty());

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(persist.stats().flushes, 0, "flushed inside the debounce window");

        time::sleep(Duration::from_millis(350)).await;
        let stats = persist.stats();
        assert_eq!(stats.flushes, 1);
        assert!(!stats.dirty);
        assert!(stats.last_flush.is_some());
        assert_eq!(source.encodes.load(Ordering::SeqCst), 1);

        persist.shutdown().await;
        assert_eq!(source.encodes.load(Ordering::SeqCst), 1, "clean cache must not be rewritten");
        assert_eq!(std::fs::read(dir.path().join("cache.bin")).unwrap(), b"snapshot-0");
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_change() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        // Long interval: only the shutdown path can write in time.
        let persist = start(&dir, source.clone(), 10_000);

        persist.mark_dirty();
        persist.shutdown().await;

        assert_eq!(source.encodes.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("cache.bin").exists());
    }

    #[tokio::test]
    async fn test_drop_triggers_final_flush() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        let persist = start(&dir, source.clone(), 10_000);

        persist.mark_dirty();
        drop(persist);

        for _ in 0..100 {
            if dir.path().join("cache.bin").exists() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dir.path().join("cache.bin").exists());
    }

    #[tokio::test]
    async fn test_failed_flush_stays_dirty_and_retries() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        source.failing.store(true, Ordering::SeqCst);
        let persist = start(&dir, source.clone(), 100);

        persist.mark_dirty();
        time::sleep(Duration::from_millis(200)).await;

        let stats = persist.stats();
        assert_eq!(stats.flushes, 0);
        assert!(stats.failures >= 1);
        assert!(stats.dirty);
        assert!(!dir.path().join("cache.bin").exists());

        // No new mark: the periodic check has to pick the retry up.
        source.failing.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_millis(300)).await;

        let stats = persist.stats();
        assert_eq!(stats.flushes, 1);
        assert!(!stats.dirty);
        persist.shutdown().await;
    }

    #[tokio::test]
    async fn test_mark_during_flush_keeps_dirty() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        let persist = start(&dir, source.clone(), 100);
        source.remark.set(persist.notifier()).unwrap();

        persist.mark_dirty();
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(persist.stats().flushes, 1);
        assert!(persist.is_dirty(), "change made mid-flush was dropped");

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(persist.stats().flushes, 2);
        assert!(!persist.is_dirty());
        persist.shutdown().await;
    }

    #[tokio::test]
    async fn test_notifier_outlives_controller() {
        let dir = TempDir::new().unwrap();
        let persist = start(&dir, Arc::new(FakeSource::default()), 10_000);
        let notifier = persist.notifier();

        persist.shutdown().await;
        notifier.mark_dirty();
        assert!(notifier.is_dirty());
    }
}
