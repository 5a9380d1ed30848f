//! The virtual catalog: a lazily-built directory tree over the
//! projection, with stable inodes and projected sizes.
//!
//! Entries are interned on first `lookup`/`readdir` and keep their
//! inode for the life of the mount. `getattr` never invokes an
//! encoder: sizes come from the realized-size memo, then from a ready
//! cache entry, then from the driver's upper-bound estimator. Once a
//! build realizes the true size, the memo is updated and the entry's
//! attribute TTL drops to zero so the kernel re-fetches it (the
//! invalidation signal toward the filesystem adapter).

pub mod projection;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cache::CacheStore;
use crate::drivers::{BuildRequest, Driver};
use crate::error::{EngineError, EngineResult};
use crate::fingerprint::{Fingerprint, SourceId};
use self::projection::{Projection, ProjectedNode};

/// Inode number type (matches fuser's u64 convention).
pub type Ino = u64;

/// Root inode number (FUSE convention: inode 1 is root).
pub const ROOT_INO: Ino = 1;

/// Attribute TTL for entries whose metadata is settled.
const SETTLED_ATTR_TTL: Duration = Duration::from_secs(1);

/// File type of a catalog entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
    Symlink,
}

/// File attributes, mirroring fuser's but independent of it so the
/// catalog can be exercised without a kernel.
#[derive(Clone, Debug)]
pub struct FileAttr {
    pub ino: Ino,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub flags: u32,
}

/// Directory entry returned by [`Catalog::readdir`].
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub ino: Ino,
    pub name: String,
    pub kind: FileKind,
}

#[derive(Clone, Debug)]
struct Record {
    rel: PathBuf,
    node: ProjectedNode,
}

#[derive(Default)]
struct Tables {
    by_ino: FxHashMap<Ino, Record>,
    by_path: FxHashMap<PathBuf, Ino>,
}

/// The virtual directory tree of one mount.
pub struct Catalog {
    projection: Arc<dyn Projection>,
    driver: Arc<dyn Driver>,
    store: Arc<CacheStore>,
    tables: RwLock<Tables>,
    /// True sizes learned from finished builds, by inode (lock-free
    /// reads on the getattr hot path).
    realized: ArcSwap<FxHashMap<Ino, u64>>,
    next_ino: AtomicU64,
    uid: u32,
    gid: u32,
}

impl Catalog {
    pub fn new(
        projection: Arc<dyn Projection>,
        driver: Arc<dyn Driver>,
        store: Arc<CacheStore>,
    ) -> EngineResult<Arc<Self>> {
        let root = projection
            .resolve(Path::new(""))?
            .ok_or(EngineError::NotFound)?;
        let mut tables = Tables::default();
        tables.by_ino.insert(
            ROOT_INO,
            Record {
                rel: PathBuf::new(),
                node: root,
            },
        );
        tables.by_path.insert(PathBuf::new(), ROOT_INO);

        Ok(Arc::new(Catalog {
            projection,
            driver,
            store,
            tables: RwLock::new(tables),
            realized: ArcSwap::from_pointee(FxHashMap::default()),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            // SAFETY: getuid/getgid cannot fail.
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }))
    }

    fn record(&self, ino: Ino) -> EngineResult<Record> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_ino
            .get(&ino)
            .cloned()
            .ok_or(EngineError::NotFound)
    }

    /// Interns (or refreshes) the entry at `rel`, keeping its inode
    /// stable across repeated lookups.
    fn intern(&self, rel: &Path, node: ProjectedNode) -> Ino {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(&ino) = tables.by_path.get(rel) {
            if let Some(record) = tables.by_ino.get_mut(&ino) {
                record.node = node;
            }
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        tables.by_ino.insert(
            ino,
            Record {
                rel: rel.to_path_buf(),
                node,
            },
        );
        tables.by_path.insert(rel.to_path_buf(), ino);
        ino
    }

    /// Drops a vanished entry from the tables.
    fn invalidate(&self, rel: &Path) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ino) = tables.by_path.remove(rel) {
            tables.by_ino.remove(&ino);
            debug!(path = %rel.display(), ino, "catalog entry invalidated");
        }
    }

    /// Resolves `name` under the directory `parent`.
    ///
    /// Returns the attribute and its TTL.
    pub fn lookup(&self, parent: Ino, name: &str) -> EngineResult<(FileAttr, Duration)> {
        let parent_record = self.record(parent)?;
        if !parent_record.node.is_dir() {
            return Err(EngineError::NotFound);
        }
        let rel = parent_record.rel.join(name);
        match self.projection.resolve(&rel)? {
            Some(node) => {
                let ino = self.intern(&rel, node.clone());
                let attr = self.attr_for(ino, &node)?;
                Ok((attr, self.ttl_for(ino, &node)))
            }
            None => {
                self.invalidate(&rel);
                Err(EngineError::NotFound)
            }
        }
    }

    /// Attributes of an already-interned entry.
    pub fn getattr(&self, ino: Ino) -> EngineResult<(FileAttr, Duration)> {
        let record = self.record(ino)?;
        match self.attr_for(ino, &record.node) {
            Ok(attr) => Ok((attr, self.ttl_for(ino, &record.node))),
            Err(EngineError::NotFound) => {
                self.invalidate(&record.rel);
                Err(EngineError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Enumerates the directory `ino`, interning every entry.
    pub fn readdir(&self, ino: Ino) -> EngineResult<Vec<DirEntry>> {
        let record = self.record(ino)?;
        if !record.node.is_dir() {
            return Err(EngineError::NotFound);
        }
        let entries = self.projection.list(&record.rel)?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let rel = record.rel.join(&entry.name);
            let kind = if entry.node.is_dir() {
                FileKind::Directory
            } else {
                FileKind::RegularFile
            };
            let child = self.intern(&rel, entry.node);
            out.push(DirEntry {
                ino: child,
                name: entry.name,
                kind,
            });
        }
        Ok(out)
    }

    /// The parent inode of `ino`, if its parent has been interned.
    pub fn parent_of(&self, ino: Ino) -> Option<Ino> {
        if ino == ROOT_INO {
            return Some(ROOT_INO);
        }
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let record = tables.by_ino.get(&ino)?;
        let parent_rel = record.rel.parent()?;
        tables.by_path.get(parent_rel).copied()
    }

    /// The projected node behind `ino`, for the open path.
    pub fn node(&self, ino: Ino) -> EngineResult<ProjectedNode> {
        Ok(self.record(ino)?.node)
    }

    /// The build request for a derived entry, capturing the source
    /// identity at this moment.
    pub fn build_request(&self, node: &ProjectedNode) -> EngineResult<BuildRequest> {
        let ProjectedNode::Derived { source, track } = node else {
            return Err(EngineError::NotFound);
        };
        let md = std::fs::metadata(source).map_err(|e| EngineError::source(source, e))?;
        Ok(BuildRequest {
            source: source.clone(),
            source_id: SourceId::from_metadata(&md),
            track: track.clone(),
        })
    }

    /// Records the realized byte length of a derived entry after a
    /// successful build, so the next `getattr` reports the true size.
    pub fn record_realized(&self, ino: Ino, len: u64) {
        if self.realized.load().get(&ino) == Some(&len) {
            return;
        }
        self.realized.rcu(|map| {
            let mut next = (**map).clone();
            next.insert(ino, len);
            next
        });
        debug!(ino, len, "realized size recorded");
    }

    fn fingerprint_for(&self, node: &ProjectedNode) -> EngineResult<Fingerprint> {
        let req = self.build_request(node)?;
        Ok(req.fingerprint(self.driver.as_ref()))
    }

    /// Whether this entry's size is still an estimate.
    fn is_estimated(&self, ino: Ino, node: &ProjectedNode) -> bool {
        match node {
            ProjectedNode::Derived { .. } => {
                self.realized.load().get(&ino).is_none()
                    && self
                        .fingerprint_for(node)
                        .map(|fp| self.store.ready_len(&fp).is_none())
                        .unwrap_or(true)
            }
            _ => false,
        }
    }

    fn ttl_for(&self, ino: Ino, node: &ProjectedNode) -> Duration {
        if self.is_estimated(ino, node) {
            // Keep the kernel asking until the size settles.
            Duration::ZERO
        } else {
            SETTLED_ATTR_TTL
        }
    }

    fn attr_for(&self, ino: Ino, node: &ProjectedNode) -> EngineResult<FileAttr> {
        let source = match node {
            ProjectedNode::Dir { source }
            | ProjectedNode::PassThrough { source }
            | ProjectedNode::Derived { source, .. } => source,
        };
        let md = std::fs::metadata(source).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::NotFound
            } else {
                EngineError::source(source, e)
            }
        })?;

        let mtime = md.modified().unwrap_or(UNIX_EPOCH);
        let ctime = {
            use std::os::unix::fs::MetadataExt;
            UNIX_EPOCH + Duration::from_secs(md.ctime().max(0) as u64)
        };

        let (kind, perm, nlink, size, atime) = match node {
            ProjectedNode::Dir { .. } => (FileKind::Directory, 0o555, 2, 0, mtime),
            ProjectedNode::PassThrough { .. } => {
                (FileKind::RegularFile, 0o444, 1, md.len(), mtime)
            }
            ProjectedNode::Derived { .. } => {
                let (size, atime) = self.derived_size_and_atime(ino, node, &md)?;
                (FileKind::RegularFile, 0o444, 1, size, atime)
            }
        };

        Ok(FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime,
            mtime,
            ctime,
            crtime: mtime,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        })
    }

    fn derived_size_and_atime(
        &self,
        ino: Ino,
        node: &ProjectedNode,
        md: &std::fs::Metadata,
    ) -> EngineResult<(u64, SystemTime)> {
        let mtime = md.modified().unwrap_or(UNIX_EPOCH);

        let ProjectedNode::Derived { source, track } = node else {
            return Err(EngineError::NotFound);
        };
        let req = BuildRequest {
            source: source.clone(),
            source_id: SourceId::from_metadata(md),
            track: track.clone(),
        };
        let fp = req.fingerprint(self.driver.as_ref());

        if let Some(len) = self.store.ready_len(&fp) {
            let atime = self.store.ready_atime(&fp).unwrap_or(mtime);
            return Ok((len, atime));
        }
        if let Some(&len) = self.realized.load().get(&ino) {
            return Ok((len, mtime));
        }
        match self.driver.estimate_size(&req) {
            Ok(estimate) => Ok((estimate, mtime)),
            Err(e) => {
                // An unprobeable source still needs a stat answer; the
                // source length is the fallback upper bound.
                debug!(source = %source.display(), error = %e, "size estimate failed");
                Ok((md.len(), mtime))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::Reserve;
    use crate::signal::ShutdownSignal;
    use std::io::Write as _;

    /// Driver whose estimates and output are synthetic, so catalog
    /// behavior can be tested without encoders.
    struct FixedDriver {
        estimate: u64,
        payload: Vec<u8>,
    }

    impl Driver for FixedDriver {
        fn id(&self) -> &'static str {
            "fixed"
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
            sink: &mut dyn std::io::Write,
            _cancel: &ShutdownSignal,
        ) -> EngineResult<()> {
            sink.write_all(&self.payload)
                .map_err(|e| EngineError::DriverFailure {
                    driver: "fixed",
                    detail: e.to_string(),
                })
        }
    }

    struct Fixture {
        _source: tempfile::TempDir,
        _cache: tempfile::TempDir,
        catalog: Arc<Catalog>,
        store: Arc<CacheStore>,
    }

    fn fixture(estimate: u64) -> Fixture {
        use crate::catalog::projection::{HideRules, TranscodeProjection};

        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("alpha.flac"), b"flac bytes here").unwrap();
        std::fs::write(source.path().join("readme.txt"), b"hello").unwrap();

        let cache = tempfile::tempdir().unwrap();
        let store = CacheStore::open(cache.path()).unwrap();
        let projection = Arc::new(TranscodeProjection::new(
            source.path(),
            "mp3",
            HideRules::default(),
        ));
        let driver = Arc::new(FixedDriver {
            estimate,
            payload: b"mp3!".to_vec(),
        });
        let catalog = Catalog::new(projection, driver, store.clone()).unwrap();
        Fixture {
            _source: source,
            _cache: cache,
            catalog,
            store,
        }
    }

    #[test]
    fn lookup_and_readdir_agree_on_inodes() {
        let fx = fixture(1000);
        let entries = fx.catalog.readdir(ROOT_INO).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["alpha.mp3", "readme.txt"]);

        let (attr, _) = fx.catalog.lookup(ROOT_INO, "alpha.mp3").unwrap();
        assert_eq!(attr.ino, entries[0].ino);

        // A second lookup keeps the inode stable.
        let (again, _) = fx.catalog.lookup(ROOT_INO, "alpha.mp3").unwrap();
        assert_eq!(again.ino, attr.ino);
    }

    #[test]
    fn derived_attr_uses_estimate_with_zero_ttl() {
        let fx = fixture(12_345);
        let (attr, ttl) = fx.catalog.lookup(ROOT_INO, "alpha.mp3").unwrap();
        assert_eq!(attr.size, 12_345);
        assert_eq!(attr.perm, 0o444);
        assert_eq!(attr.kind, FileKind::RegularFile);
        assert_eq!(ttl, Duration::ZERO);
    }

    #[test]
    fn passthrough_attr_uses_source_size() {
        let fx = fixture(0);
        let (attr, ttl) = fx.catalog.lookup(ROOT_INO, "readme.txt").unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(ttl, SETTLED_ATTR_TTL);
    }

    #[test]
    fn realized_size_replaces_estimate() {
        let fx = fixture(12_345);
        let (attr, _) = fx.catalog.lookup(ROOT_INO, "alpha.mp3").unwrap();
        fx.catalog.record_realized(attr.ino, 4);

        let (after, _) = fx.catalog.getattr(attr.ino).unwrap();
        assert_eq!(after.size, 4);
    }

    #[test]
    fn ready_cache_entry_wins_and_settles_ttl() {
        let fx = fixture(12_345);
        let (attr, _) = fx.catalog.lookup(ROOT_INO, "alpha.mp3").unwrap();

        // Publish the entry the catalog's fingerprint points at.
        let node = fx.catalog.node(attr.ino).unwrap();
        let req = fx.catalog.build_request(&node).unwrap();
        let fp = req.fingerprint(fx.catalog.driver.as_ref());
        let Reserve::Slot(slot) = fx.store.reserve(&fp).unwrap() else {
            panic!("expected slot");
        };
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .open(slot.temp_path())
            .unwrap();
        f.write_all(b"mp3!").unwrap();
        drop(f);
        fx.store.promote(slot).unwrap();

        let (after, ttl) = fx.catalog.getattr(attr.ino).unwrap();
        assert_eq!(after.size, 4);
        assert_eq!(ttl, SETTLED_ATTR_TTL);
    }

    #[test]
    fn vanished_source_invalidates_the_entry() {
        let fx = fixture(100);
        let (attr, _) = fx.catalog.lookup(ROOT_INO, "readme.txt").unwrap();
        std::fs::remove_file(fx._source.path().join("readme.txt")).unwrap();

        assert!(matches!(
            fx.catalog.lookup(ROOT_INO, "readme.txt").unwrap_err(),
            EngineError::NotFound
        ));
        assert!(matches!(
            fx.catalog.getattr(attr.ino).unwrap_err(),
            EngineError::NotFound
        ));
    }

    #[test]
    fn parent_links() {
        let fx = fixture(100);
        assert_eq!(fx.catalog.parent_of(ROOT_INO), Some(ROOT_INO));
        let (attr, _) = fx.catalog.lookup(ROOT_INO, "alpha.mp3").unwrap();
        assert_eq!(fx.catalog.parent_of(attr.ino), Some(ROOT_INO));
    }
}
