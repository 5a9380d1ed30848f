//! Cache size maintenance.
//!
//! The [`SizeMaintainer`] keeps the sum of ready entries under the
//! configured byte budget by evicting the least-recently-accessed
//! eligible entries. Pinned entries are always skipped, so the total
//! may transiently exceed the budget while readers hold entries open;
//! once they close, the next sweep restores the bound. It runs on a
//! periodic tick in its own thread and is also nudged by the build
//! coordinator after each promotion.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use super::store::{CacheStore, EntrySnapshot};
use crate::error::{EngineError, EngineResult};
use crate::signal::ShutdownSignal;

/// What the maintainer is allowed to evict.
#[derive(Clone, Debug)]
pub struct SweepPolicy {
    /// Byte budget for ready entries; 0 disables eviction.
    pub budget: u64,
    /// Entries smaller than this are never evicted.
    pub min_evictable_size: u64,
    /// Entry names that are never evicted.
    pub exclude: Vec<String>,
}

impl SweepPolicy {
    fn eligible(&self, entry: &EntrySnapshot) -> bool {
        !entry.pinned
            && entry.len >= self.min_evictable_size
            && !self.exclude.iter().any(|n| n == &entry.name)
    }
}

/// Selects the entries to evict to bring `total` under the budget:
/// eligible entries in ascending (access time, name) order, taken until
/// the projected total fits.
fn plan_evictions(
    mut snapshot: Vec<EntrySnapshot>,
    total: u64,
    policy: &SweepPolicy,
) -> Vec<EntrySnapshot> {
    if policy.budget == 0 || total <= policy.budget {
        return Vec::new();
    }
    snapshot.retain(|e| policy.eligible(e));
    snapshot.sort_by(|a, b| a.atime.cmp(&b.atime).then_with(|| a.name.cmp(&b.name)));

    let mut victims = Vec::new();
    let mut projected = total;
    for entry in snapshot {
        if projected <= policy.budget {
            break;
        }
        projected = projected.saturating_sub(entry.len);
        victims.push(entry);
    }
    victims
}

/// Periodic enforcer of the cache byte budget.
pub struct SizeMaintainer {
    store: Arc<CacheStore>,
    policy: SweepPolicy,
    interval: Duration,
    log: Option<Mutex<File>>,
    shutdown: Arc<ShutdownSignal>,
}

impl SizeMaintainer {
    pub fn new(
        store: Arc<CacheStore>,
        policy: SweepPolicy,
        interval: Duration,
        eviction_log: Option<&Path>,
        shutdown: Arc<ShutdownSignal>,
    ) -> EngineResult<Arc<Self>> {
        let log = match eviction_log {
            Some(path) => Some(Mutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| EngineError::cache(path, e))?,
            )),
            None => None,
        };
        Ok(Arc::new(SizeMaintainer {
            store,
            policy,
            interval,
            log,
            shutdown,
        }))
    }

    /// Runs one sweep, returning the number of entries evicted.
    pub fn enforce(&self) -> usize {
        let total = self.store.ready_total();
        let victims = plan_evictions(self.store.snapshot(), total, &self.policy);
        if victims.is_empty() {
            return 0;
        }

        let now = SystemTime::now();
        let mut evicted = 0;
        for victim in victims {
            match self.store.evict(&victim.name) {
                Ok(Some(len)) => {
                    evicted += 1;
                    let age = now
                        .duration_since(victim.atime)
                        .unwrap_or(Duration::ZERO)
                        .as_secs();
                    info!(name = %victim.name, len, age, "evicted cache entry");
                    self.record(&victim.name, len, age);
                }
                // Pinned or rebuilt since the snapshot; leave it.
                Ok(None) => debug!(name = %victim.name, "eviction skipped"),
                Err(e) => warn!(name = %victim.name, error = %e, "eviction failed"),
            }
        }
        evicted
    }

    fn record(&self, name: &str, len: u64, age_secs: u64) {
        if let Some(log) = &self.log {
            let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(log, "{name} {len} {age_secs}") {
                warn!(error = %e, "failed to append eviction log");
            }
        }
    }

    /// Spawns the periodic sweep thread. Sweeps once immediately, then
    /// on every interval tick until shutdown.
    pub fn spawn(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let maintainer = self.clone();
        thread::Builder::new()
            .name("audiofs-sweeper".to_string())
            .spawn(move || {
                maintainer.enforce();
                while !maintainer.wait_for_tick() {
                    maintainer.enforce();
                }
            })
            .expect("failed to spawn sweeper thread")
    }

    /// Sleeps one interval in short slices; returns true on shutdown.
    fn wait_for_tick(&self) -> bool {
        let mut remaining = self.interval;
        let slice = Duration::from_millis(200);
        while remaining > Duration::ZERO {
            if self.shutdown.is_signaled() {
                return true;
            }
            let nap = remaining.min(slice);
            thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
        self.shutdown.is_signaled()
    }
}
