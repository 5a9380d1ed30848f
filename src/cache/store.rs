//! On-disk cache store.
//!
//! A flat directory of regular files named by the hexadecimal
//! fingerprint of the stream they hold. Metadata (length, last access,
//! pin count, state) lives in an in-memory index seeded from a
//! directory scan at startup. Publication is a single same-directory
//! rename of a `.partial-<nonce>` temp file, so readers can never
//! observe a half-written entry: they only ever open entries the index
//! reports ready.
//!
//! The index lock protects in-memory state only. File creation, reads,
//! and unlinks happen outside it; only the publishing rename and the
//! matching state transition are adjacent.

use std::fs::{self, File, FileTimes};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{EngineError, EngineResult};
use crate::fingerprint::Fingerprint;

/// Marker in the middle of in-progress temp filenames.
const PARTIAL_MARKER: &str = ".partial-";

#[derive(Debug)]
enum EntryState {
    Building,
    Ready {
        len: u64,
        atime: SystemTime,
        pins: u32,
    },
    Evicting,
}

/// Result of probing a fingerprint.
#[derive(Debug)]
pub enum Probe {
    /// No entry and no build in progress.
    Absent,
    /// A finished entry exists.
    Ready {
        /// Byte length of the finished stream.
        len: u64,
    },
    /// A build currently owns this fingerprint.
    Building,
}

/// Result of trying to reserve a fingerprint for building.
pub enum Reserve {
    /// The caller owns the build and must `promote` or `abandon`.
    Slot(BuildSlot),
    /// Someone finished the entry first.
    Ready,
    /// Another build (or an eviction) owns the entry.
    Busy,
}

/// Exclusive ownership of an in-progress cache file.
///
/// Returned by [`CacheStore::reserve`]; must be passed back to
/// [`CacheStore::promote`] or [`CacheStore::abandon`].
pub struct BuildSlot {
    name: String,
    temp: PathBuf,
}

impl BuildSlot {
    /// Path of the temporary file the build writes into.
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }
}

/// A pinned, readable view of a ready cache entry.
///
/// Holds one pin on the entry; the pin is released on drop, which is
/// what allows the size maintainer to evict the entry again.
pub struct ReadHandle {
    store: Arc<CacheStore>,
    name: String,
    file: File,
    len: u64,
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

impl ReadHandle {
    /// Byte length of the underlying entry.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads up to `buf.len()` bytes at `offset`, clamping at end of
    /// file. Returns the bytes actually read.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let want = buf.len().min((self.len - offset) as usize);
        let mut done = 0;
        while done < want {
            match self.file.read_at(&mut buf[done..want], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.store.release(&self.name);
    }
}

/// A point-in-time view of one entry, used by the size maintainer.
#[derive(Clone, Debug)]
pub struct EntrySnapshot {
    /// Cache filename (hex fingerprint for engine-produced entries).
    pub name: String,
    /// Byte length.
    pub len: u64,
    /// Last access time.
    pub atime: SystemTime,
    /// Whether any open handle pins the entry.
    pub pinned: bool,
}

/// The on-disk store of materialized derived files.
pub struct CacheStore {
    dir: PathBuf,
    index: Mutex<FxHashMap<String, EntryState>>,
    reserve_seq: AtomicU64,
}

impl CacheStore {
    /// Opens (creating if needed) the store at `dir` and seeds the
    /// index from its contents. Leftover partial files from a previous
    /// process are discarded.
    pub fn open(dir: impl Into<PathBuf>) -> EngineResult<Arc<Self>> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| EngineError::cache(&dir, e))?;

        let mut index = FxHashMap::default();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable cache entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(PARTIAL_MARKER) {
                debug!(name = %name, "discarding stale partial file");
                let _ = fs::remove_file(entry.path());
                continue;
            }
            let Ok(md) = entry.metadata() else { continue };
            let atime = md
                .accessed()
                .or_else(|_| md.modified())
                .unwrap_or_else(|_| SystemTime::now());
            index.insert(
                name,
                EntryState::Ready {
                    len: md.len(),
                    atime,
                    pins: 0,
                },
            );
        }
        debug!(entries = index.len(), dir = %dir.display(), "cache store opened");

        Ok(Arc::new(CacheStore {
            dir,
            index: Mutex::new(index),
            reserve_seq: AtomicU64::new(0),
        }))
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index(&self) -> MutexGuard<'_, FxHashMap<String, EntryState>> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Probes the state of a fingerprint.
    pub fn probe(&self, fp: &Fingerprint) -> Probe {
        match self.index().get(fp.hex()) {
            None => Probe::Absent,
            Some(EntryState::Ready { len, .. }) => Probe::Ready { len: *len },
            Some(EntryState::Building) | Some(EntryState::Evicting) => Probe::Building,
        }
    }

    /// The byte length of the ready entry for `fp`, if one exists.
    pub fn ready_len(&self, fp: &Fingerprint) -> Option<u64> {
        match self.index().get(fp.hex()) {
            Some(EntryState::Ready { len, .. }) => Some(*len),
            _ => None,
        }
    }

    /// The last-access time of the ready entry for `fp`, if one exists.
    pub fn ready_atime(&self, fp: &Fingerprint) -> Option<SystemTime> {
        match self.index().get(fp.hex()) {
            Some(EntryState::Ready { atime, .. }) => Some(*atime),
            _ => None,
        }
    }

    /// Atomically claims `fp` for building.
    ///
    /// On success the entry transitions absent → building and the
    /// returned slot names the temp file to write. Losing a race
    /// reports `Busy`; an already-finished entry reports `Ready`.
    pub fn reserve(&self, fp: &Fingerprint) -> EngineResult<Reserve> {
        let name = fp.hex().to_string();
        {
            let mut index = self.index();
            match index.get(&name) {
                Some(EntryState::Ready { .. }) => return Ok(Reserve::Ready),
                Some(_) => return Ok(Reserve::Busy),
                None => {
                    index.insert(name.clone(), EntryState::Building);
                }
            }
        }

        let nonce = self.reserve_seq.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .dir
            .join(format!("{name}{PARTIAL_MARKER}{}-{nonce}", process::id()));

        // Create the partial file outside the lock; exclusive-create so
        // a colliding leftover is an error rather than silent reuse.
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
        {
            Ok(_) => Ok(Reserve::Slot(BuildSlot { name, temp })),
            Err(e) => {
                self.index().remove(&name);
                Err(EngineError::cache(&temp, e))
            }
        }
    }

    /// Publishes a finished build: renames the temp file to its final
    /// name and marks the entry ready. Returns the entry's length.
    pub fn promote(&self, slot: BuildSlot) -> EngineResult<u64> {
        let md = fs::metadata(&slot.temp).map_err(|e| {
            let _ = fs::remove_file(&slot.temp);
            self.index().remove(&slot.name);
            EngineError::cache(&slot.temp, e)
        })?;
        let len = md.len();

        let final_path = self.entry_path(&slot.name);
        if let Err(e) = fs::rename(&slot.temp, &final_path) {
            let _ = fs::remove_file(&slot.temp);
            self.index().remove(&slot.name);
            return Err(EngineError::cache(&final_path, e));
        }

        self.index().insert(
            slot.name.clone(),
            EntryState::Ready {
                len,
                atime: SystemTime::now(),
                pins: 0,
            },
        );
        debug!(name = %slot.name, len, "cache entry promoted");
        Ok(len)
    }

    /// Discards a failed or cancelled build; the entry returns to
    /// absent.
    pub fn abandon(&self, slot: BuildSlot) {
        let _ = fs::remove_file(&slot.temp);
        let mut index = self.index();
        if matches!(index.get(&slot.name), Some(EntryState::Building)) {
            index.remove(&slot.name);
        }
        debug!(name = %slot.name, "build abandoned");
    }

    /// Pins the ready entry for `fp` and opens it for reading.
    ///
    /// Fails with `NotFound` if the entry is not ready. Access time is
    /// updated here (not per read) to bound the update rate.
    pub fn acquire(self: &Arc<Self>, fp: &Fingerprint) -> EngineResult<ReadHandle> {
        let name = fp.hex().to_string();
        let len = {
            let mut index = self.index();
            match index.get_mut(&name) {
                Some(EntryState::Ready { len, atime, pins }) => {
                    *pins += 1;
                    *atime = SystemTime::now();
                    *len
                }
                _ => return Err(EngineError::NotFound),
            }
        };

        let path = self.entry_path(&name);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                // The file vanished under us; drop the stale entry.
                self.release(&name);
                if e.kind() == io::ErrorKind::NotFound {
                    self.index().remove(&name);
                    return Err(EngineError::NotFound);
                }
                return Err(EngineError::cache(&path, e));
            }
        };

        // Mirror the access time on disk so eviction ordering survives
        // a restart even on noatime mounts.
        let _ = file.set_times(FileTimes::new().set_accessed(SystemTime::now()));

        Ok(ReadHandle {
            store: self.clone(),
            name,
            file,
            len,
        })
    }

    /// Drops one pin from the named entry.
    pub(crate) fn release(&self, name: &str) {
        let mut index = self.index();
        if let Some(EntryState::Ready { pins, .. }) = index.get_mut(name) {
            *pins = pins.saturating_sub(1);
        }
    }

    /// Evicts the named entry if it is ready and unpinned.
    ///
    /// Returns the freed byte count, or `None` if the entry was
    /// skipped (absent, building, or pinned).
    pub fn evict(&self, name: &str) -> EngineResult<Option<u64>> {
        let len = {
            let mut index = self.index();
            match index.get_mut(name) {
                Some(EntryState::Ready { len, pins: 0, .. }) => {
                    let len = *len;
                    index.insert(name.to_string(), EntryState::Evicting);
                    len
                }
                _ => return Ok(None),
            }
        };

        let path = self.entry_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.index().remove(name);
                Ok(Some(len))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.index().remove(name);
                Ok(Some(len))
            }
            Err(e) => {
                // Unlink failed and the file persists; restore the
                // entry so it stays accounted for.
                self.index().insert(
                    name.to_string(),
                    EntryState::Ready {
                        len,
                        atime: SystemTime::now(),
                        pins: 0,
                    },
                );
                Err(EngineError::cache(&path, e))
            }
        }
    }

    /// Total bytes of ready entries.
    pub fn ready_total(&self) -> u64 {
        self.index()
            .values()
            .map(|s| match s {
                EntryState::Ready { len, .. } => *len,
                _ => 0,
            })
            .sum()
    }

    /// Number of ready entries.
    pub fn ready_count(&self) -> usize {
        self.index()
            .values()
            .filter(|s| matches!(s, EntryState::Ready { .. }))
            .count()
    }

    /// A snapshot of every ready entry for eviction planning.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.index()
            .iter()
            .filter_map(|(name, state)| match state {
                EntryState::Ready { len, atime, pins } => Some(EntrySnapshot {
                    name: name.clone(),
                    len: *len,
                    atime: *atime,
                    pinned: *pins > 0,
                }),
                _ => None,
            })
            .collect()
    }
}
