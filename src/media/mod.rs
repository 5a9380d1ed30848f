//! Probing of lossless source files.
//!
//! Stream properties (sample count, sample rate) and tag blocks are
//! obtained from `metaflac`, the same tool the encoder pipelines build
//! on. Probes are memoized per source identity so `getattr` stays cheap
//! after the first estimate of a given source.

pub mod cue;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::error::{EngineError, EngineResult};
use crate::fingerprint::SourceId;

/// Canonical FLAC tag names the engine maps onto encoder options.
pub mod tag {
    pub const TITLE: &str = "TITLE";
    pub const ARTIST: &str = "ARTIST";
    pub const ALBUM: &str = "ALBUM";
    pub const DATE: &str = "DATE";
    pub const TRACK_NUMBER: &str = "TRACKNUMBER";
    pub const GENRE: &str = "GENRE";
    pub const COMMENT: &str = "COMMENT";
}

/// Stream properties of a FLAC source file.
#[derive(Clone, Copy, Debug)]
pub struct FlacInfo {
    /// Total number of audio samples.
    pub total_samples: u64,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Encoded length of the source in bytes.
    pub source_len: u64,
}

impl FlacInfo {
    /// Duration of the stream in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.total_samples as f64 / self.sample_rate as f64
    }

    /// Mean encoded bytes per second of audio.
    pub fn bytes_per_second(&self) -> f64 {
        let d = self.duration_secs();
        if d <= 0.0 {
            return 0.0;
        }
        self.source_len as f64 / d
    }
}

/// Memoizing prober for FLAC sources.
///
/// Entries are keyed by path and validated against the source identity,
/// so a rewritten source is re-probed rather than served stale numbers.
pub struct MediaProber {
    memo: Mutex<FxHashMap<PathBuf, (SourceId, Arc<FlacInfo>)>>,
}

impl MediaProber {
    pub fn new() -> Self {
        MediaProber {
            memo: Mutex::new(FxHashMap::default()),
        }
    }

    /// Stream properties for the source at `path` with identity `id`.
    pub fn probe(&self, path: &Path, id: &SourceId) -> EngineResult<Arc<FlacInfo>> {
        if let Some((cached_id, info)) = self.memo.lock().unwrap_or_else(|e| e.into_inner()).get(path) {
            if cached_id == id {
                return Ok(info.clone());
            }
        }

        let total_samples: u64 = metaflac_value(path, "--show-total-samples")?;
        let sample_rate: u32 = metaflac_value(path, "--show-sample-rate")?;
        let info = Arc::new(FlacInfo {
            total_samples,
            sample_rate,
            source_len: id.size,
        });

        self.memo
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), (*id, info.clone()));
        Ok(info)
    }

    /// Drops the memo entry for `path`, if any.
    pub fn forget(&self, path: &Path) {
        self.memo.lock().unwrap_or_else(|e| e.into_inner()).remove(path);
    }
}

impl Default for MediaProber {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the tag block of a FLAC file as (name, value) pairs.
///
/// Later occurrences of a tag replace earlier ones, and tags with empty
/// values are ignored, matching how the encoder pipelines consume them.
pub fn flac_tags(path: &Path) -> EngineResult<Vec<(String, String)>> {
    let output = Command::new("metaflac")
        .arg("--export-tags-to=-")
        .arg(path)
        .output()
        .map_err(|e| EngineError::source(path, e))?;
    if !output.status.success() {
        return Err(EngineError::SourceUnavailable {
            path: path.to_path_buf(),
            detail: format!("metaflac exited with {}", output.status),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let mut tags: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name.is_empty() || value.is_empty() {
            continue;
        }
        let name = name.to_ascii_uppercase();
        if let Some(existing) = tags.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value.to_string();
        } else {
            tags.push((name, value.to_string()));
        }
    }
    Ok(tags)
}

fn metaflac_value<T: std::str::FromStr>(path: &Path, flag: &str) -> EngineResult<T> {
    let output = Command::new("metaflac")
        .arg(flag)
        .arg(path)
        .output()
        .map_err(|e| EngineError::source(path, e))?;
    if !output.status.success() {
        return Err(EngineError::SourceUnavailable {
            path: path.to_path_buf(),
            detail: format!("metaflac {flag} exited with {}", output.status),
        });
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.trim().parse().map_err(|_| EngineError::SourceUnavailable {
        path: path.to_path_buf(),
        detail: format!("metaflac {flag} produced unparseable output"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_and_rate_math() {
        let info = FlacInfo {
            total_samples: 44_100 * 30,
            sample_rate: 44_100,
            source_len: 3_000_000,
        };
        assert_eq!(info.duration_secs(), 30.0);
        assert_eq!(info.bytes_per_second(), 100_000.0);
    }

    #[test]
    fn zero_rate_is_harmless() {
        let info = FlacInfo {
            total_samples: 1000,
            sample_rate: 0,
            source_len: 10,
        };
        assert_eq!(info.duration_secs(), 0.0);
        assert_eq!(info.bytes_per_second(), 0.0);
    }

    #[test]
    fn probe_failure_is_source_unavailable() {
        let prober = MediaProber::new();
        let id = SourceId {
            dev: 1,
            ino: 2,
            mtime: 3,
            size: 4,
        };
        let err = prober
            .probe(Path::new("/nonexistent/never.flac"), &id)
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnavailable { .. }));
    }
}
