//! Integration tests for the projection engine.
//!
//! These exercise the engine end-to-end without external encoders: a
//! stub driver stands in for the flac/lame/oggenc pipelines so the
//! tests cover the properties that matter regardless of codec —
//! at-most-one build under concurrency, atomic publication, byte
//! determinism, pin-aware eviction, and size realization.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use audiofs::cache::{BuildCoordinator, CacheStore, ReadHandle, SizeMaintainer, SweepPolicy};
use audiofs::catalog::projection::{HideRules, TranscodeProjection};
use audiofs::catalog::{Catalog, ROOT_INO};
use audiofs::drivers::{BuildRequest, Driver};
use audiofs::error::{EngineError, EngineResult};
use audiofs::fingerprint::SourceId;
use audiofs::signal::ShutdownSignal;
use tempfile::TempDir;

/// Stand-in for an encoder pipeline: deterministic payload, optional
/// forced failure, optional delay to widen race windows.
struct StubDriver {
    payload: Vec<u8>,
    estimate: u64,
    invocations: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
}

impl StubDriver {
    fn new(payload: &[u8]) -> Arc<Self> {
        Arc::new(StubDriver {
            payload: payload.to_vec(),
            estimate: payload.len() as u64 * 100,
            invocations: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::ZERO,
        })
    }

    fn slow(payload: &[u8], delay: Duration) -> Arc<Self> {
        Arc::new(StubDriver {
            payload: payload.to_vec(),
            estimate: payload.len() as u64 * 100,
            invocations: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay,
        })
    }
}

impl Driver for StubDriver {
    fn id(&self) -> &'static str {
        "stub"
    }
    fn version_tag(&self) -> &'static str {
        "1"
    }
    fn params(&self, _req: &BuildRequest) -> String {
        "p".to_string()
    }
    fn estimate_size(&self, _req: &BuildRequest) -> EngineResult<u64> {
        Ok(self.estimate)
    }
    fn produce(
        &self,
        _req: &BuildRequest,
        sink: &mut dyn Write,
        _cancel: &ShutdownSignal,
    ) -> EngineResult<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::DriverFailure {
                driver: "stub",
                detail: "corrupt source".to_string(),
            });
        }
        sink.write_all(&self.payload)
            .map_err(|e| EngineError::DriverFailure {
                driver: "stub",
                detail: e.to_string(),
            })
    }
}

fn request(ino: u64) -> BuildRequest {
    BuildRequest {
        source: PathBuf::from("/music/source.flac"),
        source_id: SourceId {
            dev: 11,
            ino,
            mtime: 1_700_000_000,
            size: 40_000_000,
        },
        track: None,
    }
}

fn read_all(handle: &ReadHandle) -> Vec<u8> {
    let mut out = vec![0u8; handle.len() as usize];
    let n = handle.read_at(0, &mut out).unwrap();
    out.truncate(n);
    out
}

fn engine(
    dir: &TempDir,
    driver: Arc<StubDriver>,
) -> (Arc<CacheStore>, Arc<BuildCoordinator>) {
    let store = CacheStore::open(dir.path()).unwrap();
    let coordinator =
        BuildCoordinator::new(store.clone(), driver, Arc::new(ShutdownSignal::new()));
    (store, coordinator)
}

#[test]
fn concurrent_cold_opens_spawn_exactly_one_build() {
    let dir = TempDir::new().unwrap();
    let driver = StubDriver::slow(b"identical derived bytes", Duration::from_millis(50));
    let (store, coordinator) = engine(&dir, driver.clone());

    let barrier = Arc::new(Barrier::new(10));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let handle = coordinator.get_or_build(&request(1)).unwrap();
                read_all(&handle)
            })
        })
        .collect();

    let outputs: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Exactly one encoder invocation; every reader saw the same bytes.
    assert_eq!(driver.invocations.load(Ordering::SeqCst), 1);
    for out in &outputs {
        assert_eq!(out, b"identical derived bytes");
    }
    assert_eq!(store.ready_count(), 1);
}

#[test]
fn failed_build_is_propagated_and_publishes_nothing() {
    let dir = TempDir::new().unwrap();
    let driver = StubDriver::slow(b"never seen", Duration::from_millis(50));
    driver.fail.store(true, Ordering::SeqCst);
    let (store, coordinator) = engine(&dir, driver.clone());

    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                coordinator.get_or_build(&request(1))
            })
        })
        .collect();

    for h in handles {
        let result = h.join().unwrap();
        assert!(matches!(
            result.unwrap_err(),
            EngineError::DriverFailure { .. }
        ));
    }

    // No entry, no leftover partial file.
    assert_eq!(store.ready_count(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    // Replacing the "corrupt source" lets the next open succeed.
    driver.fail.store(false, Ordering::SeqCst);
    let handle = coordinator.get_or_build(&request(1)).unwrap();
    assert_eq!(read_all(&handle), b"never seen");
}

#[test]
fn rebuilds_after_eviction_are_byte_identical() {
    let dir = TempDir::new().unwrap();
    let driver = StubDriver::new(b"deterministic stream");
    let (store, coordinator) = engine(&dir, driver.clone());

    let first = {
        let handle = coordinator.get_or_build(&request(1)).unwrap();
        read_all(&handle)
    };

    // Evict and rebuild.
    let fp = request(1).fingerprint(driver.as_ref() as &dyn Driver);
    assert!(store.evict(fp.hex()).unwrap().is_some());
    let second = {
        let handle = coordinator.get_or_build(&request(1)).unwrap();
        read_all(&handle)
    };

    assert_eq!(first, second);
    assert_eq!(driver.invocations.load(Ordering::SeqCst), 2);
}

#[test]
fn eviction_respects_open_handles() {
    let dir = TempDir::new().unwrap();
    let cache = dir.path().join("cache");
    let driver = StubDriver::new(&[0u8; 100]);
    let store = CacheStore::open(&cache).unwrap();
    let shutdown = Arc::new(ShutdownSignal::new());
    let coordinator = BuildCoordinator::new(store.clone(), driver, shutdown.clone());

    // Budget fits a single 100-byte entry.
    let maintainer = SizeMaintainer::new(
        store.clone(),
        SweepPolicy {
            budget: 100,
            min_evictable_size: 0,
            exclude: Vec::new(),
        },
        Duration::from_secs(3600),
        None,
        shutdown,
    )
    .unwrap();
    coordinator.set_maintainer(maintainer.clone());

    let fp = |ino: u64| {
        request(ino).fingerprint(coordinator.driver().as_ref())
    };

    // Hold alpha open while beta is accessed: alpha must survive the
    // over-budget sweep.
    let alpha = coordinator.get_or_build(&request(1)).unwrap();
    let beta = coordinator.get_or_build(&request(2)).unwrap();
    drop(beta);
    maintainer.enforce();
    assert!(store.ready_len(&fp(1)).is_some(), "pinned entry was evicted");

    // Close alpha, touch gamma: now the LRU (alpha) goes.
    drop(alpha);
    thread::sleep(Duration::from_millis(5));
    let gamma = coordinator.get_or_build(&request(3)).unwrap();
    drop(gamma);
    maintainer.enforce();

    assert!(store.ready_len(&fp(1)).is_none(), "LRU entry survived");
    assert!(store.ready_len(&fp(3)).is_some());
    assert!(store.ready_total() <= 100);
}

#[test]
fn stat_settles_to_true_size_after_first_read() {
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("alpha.flac"), b"pretend flac").unwrap();
    let cache = TempDir::new().unwrap();

    let store = CacheStore::open(cache.path()).unwrap();
    let driver = StubDriver::new(b"tiny");
    let projection = Arc::new(TranscodeProjection::new(
        source.path(),
        "mp3",
        HideRules::default(),
    ));
    let catalog = Catalog::new(projection, driver.clone(), store.clone()).unwrap();
    let coordinator =
        BuildCoordinator::new(store, driver.clone(), Arc::new(ShutdownSignal::new()));

    // Before the first open, stat reports the (upper-bound) estimate.
    let (before, _) = catalog.lookup(ROOT_INO, "alpha.mp3").unwrap();
    assert_eq!(before.size, driver.estimate);
    assert!(before.size >= 4);

    // The open path: build, then record the realized size.
    let node = catalog.node(before.ino).unwrap();
    let req = catalog.build_request(&node).unwrap();
    let handle = coordinator.get_or_build(&req).unwrap();
    catalog.record_realized(before.ino, handle.len());

    let (after, _) = catalog.getattr(before.ino).unwrap();
    assert_eq!(after.size, 4);
    assert!(after.size <= before.size);
    assert_eq!(read_all(&handle).len() as u64, after.size);
}

#[test]
fn cache_survives_restart() {
    let dir = TempDir::new().unwrap();
    let driver = StubDriver::new(b"persisted");

    {
        let (_store, coordinator) = engine(&dir, driver.clone());
        let handle = coordinator.get_or_build(&request(1)).unwrap();
        assert_eq!(read_all(&handle), b"persisted");
    }

    // A fresh store over the same directory serves the entry without
    // a rebuild.
    let (_store, coordinator) = engine(&dir, driver.clone());
    let handle = coordinator.get_or_build(&request(1)).unwrap();
    assert_eq!(read_all(&handle), b"persisted");
    assert_eq!(driver.invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn waiters_are_cancelled_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let driver = StubDriver::slow(b"slow", Duration::from_millis(400));
    let store = CacheStore::open(dir.path()).unwrap();
    let shutdown = Arc::new(ShutdownSignal::new());
    let coordinator = BuildCoordinator::new(store, driver, shutdown.clone());

    let builder = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.get_or_build(&request(1)))
    };
    thread::sleep(Duration::from_millis(50));

    let waiter = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.get_or_build(&request(1)))
    };
    thread::sleep(Duration::from_millis(50));
    shutdown.trigger(0);

    // The waiter observes the shutdown promptly.
    assert!(matches!(
        waiter.join().unwrap().unwrap_err(),
        EngineError::Cancelled
    ));
    // The builder ran to completion or was cancelled; either way the
    // engine did not wedge.
    let _ = builder.join().unwrap();
}
