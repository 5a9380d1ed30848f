//! Mount-time configuration.
//!
//! All knobs are gathered into one plain [`MountConfig`] record built by
//! the CLI and handed to the engine at mount time. There is no global
//! mutable configuration state.

use std::path::PathBuf;
use std::time::Duration;

/// Default sweep interval for the cache size maintainer.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default bitrate for lossy transcoders, in kbit/s.
pub const DEFAULT_BITRATE_KBPS: u32 = 192;

/// Default separator between the track number and title in split-track
/// filenames.
pub const DEFAULT_TRACK_SEPARATOR: &str = "_";

/// File extensions (lowercase, no dot) hidden from the derived view
/// unless overridden.
pub const DEFAULT_HIDDEN_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "nfo", "db", "ini", "log",
];

/// Configuration for one mounted projection.
#[derive(Clone, Debug)]
pub struct MountConfig {
    /// Directory holding the materialized derived files.
    pub cache_dir: PathBuf,
    /// Byte budget for ready cache entries. 0 disables eviction.
    pub cache_budget: u64,
    /// How often the size maintainer sweeps.
    pub sweep_interval: Duration,
    /// Entries smaller than this are never evicted.
    pub min_evictable_size: u64,
    /// Cache entry names that are never evicted.
    pub evict_exclude: Vec<String>,
    /// Optional append-only eviction log.
    pub eviction_log: Option<PathBuf>,
    /// Extensions (lowercase, no dot) hidden from the derived view.
    pub hidden_extensions: Vec<String>,
    /// Directory names hidden from the derived view.
    pub hidden_directories: Vec<String>,
    /// Bitrate for lossy transcoders, in kbit/s.
    pub bitrate_kbps: u32,
    /// Separator between track number and title in split filenames.
    pub track_separator: String,
}

impl MountConfig {
    /// A configuration for the given cache directory and budget with
    /// every other knob at its default.
    pub fn new(cache_dir: impl Into<PathBuf>, cache_budget: u64) -> Self {
        MountConfig {
            cache_dir: cache_dir.into(),
            cache_budget,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            min_evictable_size: 0,
            evict_exclude: Vec::new(),
            eviction_log: None,
            hidden_extensions: DEFAULT_HIDDEN_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            hidden_directories: Vec::new(),
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            track_separator: DEFAULT_TRACK_SEPARATOR.to_string(),
        }
    }
}

/// Parses a human-friendly byte size of the form `nnnU`, where `U` is
/// one of `B`, `K`, `M`, `G`, or `T` (powers of 1024). A bare integer is
/// taken as bytes.
pub fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }
    let (digits, unit) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - 1], c.to_ascii_uppercase()),
        _ => (s, 'B'),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("'{s}' is not a valid size"))?;
    let shift = match unit {
        'B' => 0,
        'K' => 10,
        'M' => 20,
        'G' => 30,
        'T' => 40,
        _ => return Err(format!("unknown size unit '{unit}' in '{s}'")),
    };
    n.checked_shl(shift)
        .filter(|_| n.leading_zeros() as u64 >= shift as u64)
        .ok_or_else(|| format!("size '{s}' overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_byte_size("1234").unwrap(), 1234);
        assert_eq!(parse_byte_size("0").unwrap(), 0);
    }

    #[test]
    fn parses_units() {
        assert_eq!(parse_byte_size("1B").unwrap(), 1);
        assert_eq!(parse_byte_size("2K").unwrap(), 2048);
        assert_eq!(parse_byte_size("3M").unwrap(), 3 << 20);
        assert_eq!(parse_byte_size("4G").unwrap(), 4 << 30);
        assert_eq!(parse_byte_size("1T").unwrap(), 1 << 40);
        assert_eq!(parse_byte_size("500m").unwrap(), 500 << 20);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("12Q").is_err());
        assert!(parse_byte_size("abc").is_err());
        assert!(parse_byte_size("-5M").is_err());
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_byte_size("99999999999T").is_err());
    }

    #[test]
    fn defaults() {
        let cfg = MountConfig::new("/var/cache/audiofs", 1 << 30);
        assert_eq!(cfg.bitrate_kbps, DEFAULT_BITRATE_KBPS);
        assert_eq!(cfg.track_separator, "_");
        assert!(cfg.hidden_extensions.iter().any(|e| e == "jpg"));
        assert!(cfg.eviction_log.is_none());
    }
}
