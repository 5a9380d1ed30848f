//! # audiofs
//!
//! A family of read-only FUSE filesystems that project a tree of
//! lossless audio files into a derived tree whose contents are
//! computed lazily on first access:
//!
//! - **tracks**: each album FLAC with a sibling cue sheet becomes a
//!   directory of per-track FLAC files with embedded tags
//! - **mp3**: each FLAC becomes an MPEG Layer III file at a configured
//!   bitrate
//! - **ogg**: each FLAC becomes an Ogg Vorbis file at a configured
//!   bitrate
//!
//! All three share one engine: a virtual catalog answering `lookup`,
//! `readdir`, and `getattr` without running encoders; a build
//! coordinator guaranteeing at-most-one encoder invocation per derived
//! file under arbitrary concurrent opens; a content-addressed on-disk
//! cache published by atomic rename; and a size maintainer evicting
//! least-recently-accessed entries to honor a byte budget.
//!
//! ```text
//! kernel ── fuse::AudioFs ──┬── catalog::Catalog ── catalog::projection
//! (VFS)                     │         │ estimates       (mp3/ogg/tracks)
//!                           │         ▼
//!                           └── cache::BuildCoordinator ── drivers::{mp3,ogg,split}
//!                                     │                        (flac, lame, oggenc)
//!                                     ▼
//!                               cache::CacheStore ◄── cache::SizeMaintainer
//!                               (fingerprint-named files, pins, LRU eviction)
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fingerprint;
pub mod fuse;
pub mod media;
pub mod signal;

use std::path::Path;
use std::sync::Arc;

pub use cache::{BuildCoordinator, CacheStore, SizeMaintainer, SweepPolicy};
pub use catalog::{Catalog, Ino, ROOT_INO};
pub use config::MountConfig;
pub use drivers::{BuildRequest, Driver};
pub use error::{EngineError, EngineResult};
pub use fingerprint::{Fingerprint, SourceId};
pub use fuse::{mount, spawn_mount, AudioFs, MountOptions};
pub use signal::ShutdownSignal;

use crate::catalog::projection::{HideRules, Projection, TrackSplitProjection, TranscodeProjection};
use crate::drivers::{mp3::Mp3Driver, ogg::OggDriver, split::SplitDriver};
use crate::media::MediaProber;

/// Which projection a mount serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    /// Album FLAC + cue → directory of per-track FLAC files.
    Tracks,
    /// FLAC → MPEG Layer III.
    Mp3,
    /// FLAC → Ogg Vorbis.
    Ogg,
}

/// Assembles the full engine stack for one mount: store, driver,
/// projection, catalog, coordinator, and size maintainer.
///
/// The returned maintainer is not yet running; call
/// [`SizeMaintainer::spawn`] to start the periodic sweep.
pub fn build_engine(
    flavor: Flavor,
    source_root: &Path,
    cfg: &MountConfig,
    shutdown: Arc<ShutdownSignal>,
) -> EngineResult<(AudioFs, Arc<SizeMaintainer>)> {
    let store = CacheStore::open(&cfg.cache_dir)?;
    let prober = Arc::new(MediaProber::new());
    let hide = HideRules::new(&cfg.hidden_extensions, &cfg.hidden_directories);

    let (driver, projection): (Arc<dyn Driver>, Arc<dyn Projection>) = match flavor {
        Flavor::Mp3 => (
            Arc::new(Mp3Driver::new(cfg.bitrate_kbps, prober.clone())),
            Arc::new(TranscodeProjection::new(source_root, "mp3", hide)),
        ),
        Flavor::Ogg => (
            Arc::new(OggDriver::new(cfg.bitrate_kbps, prober.clone())),
            Arc::new(TranscodeProjection::new(source_root, "ogg", hide)),
        ),
        Flavor::Tracks => (
            Arc::new(SplitDriver::new(prober.clone())),
            Arc::new(TrackSplitProjection::new(
                source_root,
                cfg.track_separator.clone(),
                hide,
            )),
        ),
    };

    let catalog = Catalog::new(projection, driver.clone(), store.clone())?;
    let coordinator = BuildCoordinator::new(store.clone(), driver, shutdown.clone());

    let maintainer = SizeMaintainer::new(
        store,
        SweepPolicy {
            budget: cfg.cache_budget,
            min_evictable_size: cfg.min_evictable_size,
            exclude: cfg.evict_exclude.clone(),
        },
        cfg.sweep_interval,
        cfg.eviction_log.as_deref(),
        shutdown,
    )?;
    coordinator.set_maintainer(maintainer.clone());

    Ok((AudioFs::new(catalog, coordinator), maintainer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_assembles_for_every_flavor() {
        for flavor in [Flavor::Mp3, Flavor::Ogg, Flavor::Tracks] {
            let source = tempfile::tempdir().unwrap();
            let cache = tempfile::tempdir().unwrap();
            let cfg = MountConfig::new(cache.path(), 1 << 20);
            let shutdown = Arc::new(ShutdownSignal::new());
            build_engine(flavor, source.path(), &cfg, shutdown).unwrap();
        }
    }
}
