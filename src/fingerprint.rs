//! Content-addressed naming of derived byte streams.
//!
//! A [`Fingerprint`] deterministically names the byte stream a driver
//! would produce for a given source file and parameter set. It is a
//! SHA-256 digest over the driver identifier, the driver's version tag,
//! the canonical parameter string, and the source file's stable
//! identity. Equal fingerprints imply byte-identical derived streams
//! for the same driver version; changing a driver's version tag
//! invalidates every cache entry it previously produced.

use std::fmt;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use sha2::{Digest, Sha256};

/// Stable identity of a source file: device, inode, mtime, size.
///
/// Two observations with equal `SourceId` are treated as the same
/// bytes; a touched or rewritten source yields a new identity and
/// therefore a new fingerprint on the next open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceId {
    /// Device number of the containing filesystem.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Length in bytes.
    pub size: u64,
}

impl SourceId {
    /// Captures the identity from an already-obtained `stat` result.
    pub fn from_metadata(md: &Metadata) -> Self {
        SourceId {
            dev: md.dev(),
            ino: md.ino(),
            mtime: md.mtime(),
            size: md.size(),
        }
    }
}

/// A derived stream's content-addressed name.
///
/// The hexadecimal form doubles as the cache filename.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint for one (driver, parameters, source)
    /// combination.
    pub fn compute(
        driver_id: &str,
        version_tag: &str,
        params: &str,
        source: &SourceId,
    ) -> Self {
        let mut h = Sha256::new();
        h.update(driver_id.as_bytes());
        h.update([0]);
        h.update(version_tag.as_bytes());
        h.update([0]);
        h.update(params.as_bytes());
        h.update([0]);
        h.update(source.dev.to_le_bytes());
        h.update(source.ino.to_le_bytes());
        h.update(source.mtime.to_le_bytes());
        h.update(source.size.to_le_bytes());
        let digest = h.finalize();
        let mut hex = String::with_capacity(64);
        for b in digest {
            hex.push_str(&format!("{b:02x}"));
        }
        Fingerprint(hex)
    }

    /// The hexadecimal form, which is also the cache filename.
    pub fn hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.0[..12])
    }
}
