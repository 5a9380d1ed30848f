//! Build coordination: get-or-build with at-most-one build per
//! fingerprint.
//!
//! Concurrent openers of the same cold fingerprint rendezvous on a
//! build ticket. Exactly one becomes the builder (the reserve winner);
//! the rest wait on the ticket's condition variable and re-enter the
//! state machine when it resolves. Driver failures resolve the ticket
//! with the failure, which is propagated to every co-waiter; the next
//! open starts the machine afresh. No lock is held while an encoder
//! runs.

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::store::{BuildSlot, CacheStore, Probe, ReadHandle, Reserve};
use super::sweeper::SizeMaintainer;
use crate::drivers::{BuildRequest, Driver};
use crate::error::{EngineError, EngineResult};
use crate::fingerprint::Fingerprint;
use crate::signal::ShutdownSignal;

/// How a resolved ticket instructs its waiters to proceed.
#[derive(Clone, Debug)]
enum Resolution {
    /// The entry was published; retry the acquire.
    Completed,
    /// The build went away without a verdict (cancellation or a
    /// transient race); re-enter the state machine.
    Retry,
    /// The build failed; the failure applies to every co-waiter.
    Failed(Arc<EngineError>),
}

enum TicketState {
    Running,
    Done(Resolution),
}

/// Rendezvous object for concurrent openers of one fingerprint.
struct Ticket {
    state: Mutex<TicketState>,
    cond: Condvar,
}

impl Ticket {
    fn new() -> Self {
        Ticket {
            state: Mutex::new(TicketState::Running),
            cond: Condvar::new(),
        }
    }
}

enum Role {
    Builder(Arc<Ticket>),
    Waiter(Arc<Ticket>),
}

/// Serializes builds per fingerprint on top of a [`CacheStore`].
pub struct BuildCoordinator {
    store: Arc<CacheStore>,
    driver: Arc<dyn Driver>,
    tickets: Mutex<FxHashMap<String, Arc<Ticket>>>,
    cancel: Arc<ShutdownSignal>,
    maintainer: Mutex<Option<Arc<SizeMaintainer>>>,
}

impl BuildCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        driver: Arc<dyn Driver>,
        cancel: Arc<ShutdownSignal>,
    ) -> Arc<Self> {
        Arc::new(BuildCoordinator {
            store,
            driver,
            tickets: Mutex::new(FxHashMap::default()),
            cancel,
            maintainer: Mutex::new(None),
        })
    }

    /// Registers the size maintainer to nudge after each promotion.
    pub fn set_maintainer(&self, maintainer: Arc<SizeMaintainer>) {
        *self.lock_maintainer() = Some(maintainer);
    }

    /// The store this coordinator publishes into.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// The driver this coordinator builds with.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    fn tickets(&self) -> MutexGuard<'_, FxHashMap<String, Arc<Ticket>>> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_maintainer(&self) -> MutexGuard<'_, Option<Arc<SizeMaintainer>>> {
        self.maintainer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a pinned read handle for the request's derived stream,
    /// building it first if no ready cache entry exists.
    pub fn get_or_build(&self, req: &BuildRequest) -> EngineResult<ReadHandle> {
        let fp = req.fingerprint(self.driver.as_ref());
        loop {
            if self.cancel.is_signaled() {
                return Err(EngineError::Cancelled);
            }

            if let Probe::Ready { .. } = self.store.probe(&fp) {
                match self.store.acquire(&fp) {
                    Ok(handle) => return Ok(handle),
                    // Evicted between probe and acquire; start over.
                    Err(EngineError::NotFound) => continue,
                    Err(e) => return Err(e),
                }
            }

            let role = {
                let mut tickets = self.tickets();
                match tickets.get(fp.hex()) {
                    Some(ticket) => Role::Waiter(ticket.clone()),
                    None => {
                        let ticket = Arc::new(Ticket::new());
                        tickets.insert(fp.hex().to_string(), ticket.clone());
                        Role::Builder(ticket)
                    }
                }
            };

            match role {
                Role::Waiter(ticket) => match self.wait(&ticket)? {
                    Resolution::Completed | Resolution::Retry => continue,
                    Resolution::Failed(err) => return Err(replicate(&err)),
                },
                Role::Builder(ticket) => match self.build(&fp, req, &ticket) {
                    Some(result) => return result,
                    None => {
                        std::thread::yield_now();
                        continue;
                    }
                },
            }
        }
    }

    /// Blocks on the ticket until it resolves. A cancelled waiter
    /// leaves the ticket untouched.
    fn wait(&self, ticket: &Ticket) -> EngineResult<Resolution> {
        let mut state = ticket.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match &*state {
                TicketState::Done(resolution) => return Ok(resolution.clone()),
                TicketState::Running => {
                    if self.cancel.is_signaled() {
                        return Err(EngineError::Cancelled);
                    }
                    let (next, _timeout) = ticket
                        .cond
                        .wait_timeout(state, Duration::from_millis(200))
                        .unwrap_or_else(|e| e.into_inner());
                    state = next;
                }
            }
        }
    }

    /// Runs the builder side of the state machine. Returns `None` when
    /// the attempt was contended and the caller should re-enter.
    fn build(
        &self,
        fp: &Fingerprint,
        req: &BuildRequest,
        ticket: &Arc<Ticket>,
    ) -> Option<EngineResult<ReadHandle>> {
        let attempt = self.attempt(fp, req);

        let (resolution, outcome) = match attempt {
            Ok(handle) => (Resolution::Completed, Some(Ok(handle))),
            // Losing the reserve race or having the fresh entry
            // snatched away is transient for us and for waiters.
            Err(EngineError::NotFound) => (Resolution::Retry, None),
            Err(EngineError::Cancelled) => {
                (Resolution::Retry, Some(Err(EngineError::Cancelled)))
            }
            Err(err) => {
                warn!(fingerprint = fp.hex(), error = %err, "build failed");
                let shared = Arc::new(err);
                (
                    Resolution::Failed(shared.clone()),
                    Some(Err(replicate(&shared))),
                )
            }
        };

        self.resolve(fp, ticket, resolution);

        // Nudge the size maintainer after a promotion, while the fresh
        // entry is still pinned by the returned handle.
        if matches!(&outcome, Some(Ok(_))) {
            if let Some(maintainer) = self.lock_maintainer().clone() {
                maintainer.enforce();
            }
        }
        outcome
    }

    /// One reserve/build/promote/acquire attempt.
    fn attempt(&self, fp: &Fingerprint, req: &BuildRequest) -> EngineResult<ReadHandle> {
        match self.store.reserve(fp)? {
            Reserve::Ready => self.store.acquire(fp),
            // Tie-break: losing a reserve race demotes us to observer.
            Reserve::Busy => Err(EngineError::NotFound),
            Reserve::Slot(slot) => {
                debug!(fingerprint = fp.hex(), driver = self.driver.id(), "building");
                match self.run_driver(req, &slot) {
                    Ok(()) => {
                        self.store.promote(slot)?;
                        // Acquire before anyone can evict, so the fresh
                        // entry is pinned by the time the sweeper runs.
                        self.store.acquire(fp)
                    }
                    Err(err) => {
                        self.store.abandon(slot);
                        Err(err)
                    }
                }
            }
        }
    }

    fn run_driver(&self, req: &BuildRequest, slot: &BuildSlot) -> EngineResult<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(slot.temp_path())
            .map_err(|e| EngineError::cache(slot.temp_path(), e))?;
        let mut sink = PartialSink {
            inner: BufWriter::new(file),
            error: None,
        };

        let produced = self.driver.produce(req, &mut sink, &self.cancel);

        // A sink-side failure (ENOSPC above all) outranks the driver's
        // view of it.
        if let Some(io_err) = sink.error.take() {
            return Err(EngineError::cache(slot.temp_path(), io_err));
        }
        produced?;

        sink.inner
            .flush()
            .map_err(|e| EngineError::cache(slot.temp_path(), e))
    }

    fn resolve(&self, fp: &Fingerprint, ticket: &Arc<Ticket>, resolution: Resolution) {
        // Remove from the registry first so late arrivals open a fresh
        // ticket instead of joining a resolved one.
        self.tickets().remove(fp.hex());
        let mut state = ticket.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = TicketState::Done(resolution);
        drop(state);
        ticket.cond.notify_all();
    }
}

/// Buffered sink over the partial file that remembers the first write
/// error so it can be classified against the cache path.
struct PartialSink {
    inner: BufWriter<std::fs::File>,
    error: Option<io::Error>,
}

impl Write for PartialSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).inspect_err(|e| {
            if self.error.is_none() {
                self.error = Some(io::Error::new(e.kind(), e.to_string()));
            }
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// An owned copy of a shared failure for handing to each waiter.
fn replicate(err: &EngineError) -> EngineError {
    match err {
        EngineError::SourceUnavailable { path, detail } => EngineError::SourceUnavailable {
            path: path.clone(),
            detail: detail.clone(),
        },
        EngineError::DriverFailure { driver, detail } => EngineError::DriverFailure {
            driver,
            detail: detail.clone(),
        },
        EngineError::CacheIo { path, source } => EngineError::CacheIo {
            path: path.clone(),
            source: io::Error::new(source.kind(), source.to_string()),
        },
        EngineError::Budget { path } => EngineError::Budget { path: path.clone() },
        EngineError::Cancelled => EngineError::Cancelled,
        EngineError::NotFound => EngineError::NotFound,
        EngineError::NotPermitted => EngineError::NotPermitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::SourceId;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubDriver {
        payload: Vec<u8>,
        invocations: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl StubDriver {
        fn new(payload: &[u8]) -> Arc<Self> {
            Arc::new(StubDriver {
                payload: payload.to_vec(),
                invocations: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay: Duration::ZERO,
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
            Ok(self.payload.len() as u64 * 2)
        }
        fn produce(
            &self,
            _req: &BuildRequest,
            sink: &mut dyn Write,
            _cancel: &ShutdownSignal,
        ) -> EngineResult<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::DriverFailure {
                    driver: "stub",
                    detail: "forced failure".to_string(),
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
            source: PathBuf::from("/src/file.flac"),
            source_id: SourceId {
                dev: 7,
                ino,
                mtime: 1,
                size: 9,
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

    #[test]
    fn cold_miss_builds_then_hits() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let driver = StubDriver::new(b"derived bytes");
        let coord = BuildCoordinator::new(
            store.clone(),
            driver.clone(),
            Arc::new(ShutdownSignal::new()),
        );

        let h1 = coord.get_or_build(&request(1)).unwrap();
        assert_eq!(read_all(&h1), b"derived bytes");
        drop(h1);

        let h2 = coord.get_or_build(&request(1)).unwrap();
        assert_eq!(read_all(&h2), b"derived bytes");
        assert_eq!(driver.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(store.ready_count(), 1);
    }

    #[test]
    fn distinct_sources_build_distinct_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let driver = StubDriver::new(b"x");
        let coord =
            BuildCoordinator::new(store.clone(), driver.clone(), Arc::new(ShutdownSignal::new()));

        let _a = coord.get_or_build(&request(1)).unwrap();
        let _b = coord.get_or_build(&request(2)).unwrap();
        assert_eq!(driver.invocations.load(Ordering::SeqCst), 2);
        assert_eq!(store.ready_count(), 2);
    }

    #[test]
    fn failure_reaches_caller_and_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let driver = StubDriver::new(b"never");
        driver.fail.store(true, Ordering::SeqCst);
        let coord =
            BuildCoordinator::new(store.clone(), driver.clone(), Arc::new(ShutdownSignal::new()));

        let err = coord.get_or_build(&request(1)).unwrap_err();
        assert!(matches!(err, EngineError::DriverFailure { .. }));
        assert_eq!(store.ready_count(), 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

        // The next open re-enters the machine and can succeed.
        driver.fail.store(false, Ordering::SeqCst);
        let handle = coord.get_or_build(&request(1)).unwrap();
        assert_eq!(read_all(&handle), b"never");
    }

    #[test]
    fn cancelled_engine_rejects_opens() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let cancel = Arc::new(ShutdownSignal::new());
        cancel.trigger(0);
        let coord = BuildCoordinator::new(store, StubDriver::new(b"x"), cancel);
        assert!(matches!(
            coord.get_or_build(&request(1)).unwrap_err(),
            EngineError::Cancelled
        ));
    }

    #[test]
    fn replicate_preserves_the_errno() {
        let original = EngineError::Budget {
            path: PathBuf::from("/cache/part"),
        };
        assert_eq!(replicate(&original).errno(), original.errno());
    }
}
