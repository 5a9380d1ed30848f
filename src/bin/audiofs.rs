//! audiofs CLI
//!
//! Mounts the AudioFS projections:
//! - `tracks`: album FLAC + cue sheets as per-track FLAC directories
//! - `mp3`: FLAC trees as MPEG Layer III at a configured bitrate
//! - `ogg`: FLAC trees as Ogg Vorbis at a configured bitrate
//!
//! Each mount takes a source directory, a mount point, and a cache
//! directory with a byte budget; derived files are produced on first
//! open and evicted least-recently-used when the budget is exceeded.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use audiofs::config::{parse_byte_size, MountConfig, DEFAULT_BITRATE_KBPS};
use audiofs::signal::install_signal_handlers;
use audiofs::{build_engine, spawn_mount, Flavor, MountOptions, ShutdownSignal};

#[derive(Parser)]
#[command(name = "audiofs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Read-only projecting filesystems for audio trees")]
#[command(long_about = "audiofs - on-demand audio projection filesystems\n\n\
    Projects a tree of lossless audio files into a derived tree whose\n\
    contents are computed lazily on first access and held in a\n\
    size-bounded cache:\n\n\
    \u{2022} tracks: album FLAC + cue sheet \u{2192} directory of per-track FLACs\n\
    \u{2022} mp3:    FLAC \u{2192} MPEG Layer III at a configured bitrate\n\
    \u{2022} ogg:    FLAC \u{2192} Ogg Vorbis at a configured bitrate\n\n\
    Examples:\n\
      audiofs mp3 -s ~/music/flac -c ~/.cache/audiofs-mp3 -S 2G ~/music/mp3\n\
      audiofs tracks -s ~/music/albums -c ~/.cache/audiofs-trk -S 5G ~/music/tracks\n\
      audiofs ogg -s ~/music/flac -c ~/.cache/audiofs-ogg -S 2G -b 160 ~/music/ogg")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
struct MountArgs {
    /// Directory of source FLAC files
    #[arg(short = 's', long, value_name = "PATH")]
    source_dir: PathBuf,

    /// Directory to hold generated files
    #[arg(short = 'c', long, value_name = "PATH")]
    cache_dir: PathBuf,

    /// Cache byte budget, e.g. 500M or 2G (0 = unlimited)
    #[arg(short = 'S', long, value_name = "SIZE", default_value = "0", value_parser = parse_byte_size)]
    cache_size: u64,

    /// Never evict cache entries smaller than this
    #[arg(long, value_name = "SIZE", default_value = "0", value_parser = parse_byte_size)]
    min_evictable_size: u64,

    /// Cache entry names exempt from eviction
    #[arg(long, value_name = "NAME")]
    evict_exclude: Vec<String>,

    /// Append an eviction record (name, size, age) per evicted entry
    #[arg(long, value_name = "FILE")]
    eviction_log: Option<PathBuf>,

    /// Seconds between cache size sweeps
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    sweep_interval: u64,

    /// Hide files with this extension (repeatable; replaces defaults)
    #[arg(long, value_name = "EXT")]
    hide_ext: Vec<String>,

    /// Hide directories with this name (repeatable)
    #[arg(long, value_name = "NAME")]
    hide_dir: Vec<String>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Mount point
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Mount FLAC sources as MPEG Layer III files
    #[command(long_about = "Mount a FLAC tree as MP3 files\n\n\
        A source file 'some/dirs/name.flac' appears as\n\
        'MOUNTPOINT/some/dirs/name.mp3', generated on first open by\n\
        flac | lame and cached. Non-audio files pass through; a real\n\
        .mp3 next to its .flac hides the generated one.\n\n\
        Example:\n\
          audiofs mp3 -s ~/music/flac -c ~/.cache/audiofs-mp3 -S 2G ~/music/mp3")]
    Mp3 {
        #[command(flatten)]
        mount: MountArgs,

        /// Bitrate in kbit/s
        #[arg(short = 'b', long, value_name = "RATE", default_value_t = DEFAULT_BITRATE_KBPS)]
        bitrate: u32,
    },

    /// Mount FLAC sources as Ogg Vorbis files
    #[command(long_about = "Mount a FLAC tree as Ogg Vorbis files\n\n\
        A source file 'some/dirs/name.flac' appears as\n\
        'MOUNTPOINT/some/dirs/name.ogg', generated on first open by\n\
        oggenc and cached. Vorbis comments are copied from the source.\n\n\
        Example:\n\
          audiofs ogg -s ~/music/flac -c ~/.cache/audiofs-ogg -S 2G -b 160 ~/music/ogg")]
    Ogg {
        #[command(flatten)]
        mount: MountArgs,

        /// Bitrate in kbit/s
        #[arg(short = 'b', long, value_name = "RATE", default_value_t = DEFAULT_BITRATE_KBPS)]
        bitrate: u32,
    },

    /// Mount album FLAC + cue sheets as per-track FLAC directories
    #[command(long_about = "Mount album FLAC files as per-track directories\n\n\
        An album 'some/dirs/name.flac' with a sibling 'name.cue' appears\n\
        as the directory 'MOUNTPOINT/some/dirs/name/' containing one\n\
        'NN_Title.flac' per cue track, extracted on first open with the\n\
        album's tags plus per-track title, artist, and number. FLAC\n\
        files without a cue sheet pass through unchanged.\n\n\
        Example:\n\
          audiofs tracks -s ~/music/albums -c ~/.cache/audiofs-trk -S 5G ~/music/tracks")]
    Tracks {
        #[command(flatten)]
        mount: MountArgs,

        /// Separator between track number and title in filenames
        #[arg(long, value_name = "SEP", default_value = "_")]
        separator: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (flavor, mount_args, bitrate, separator) = match cli.command {
        Commands::Mp3 { mount, bitrate } => (Flavor::Mp3, mount, bitrate, None),
        Commands::Ogg { mount, bitrate } => (Flavor::Ogg, mount, bitrate, None),
        Commands::Tracks { mount, separator } => {
            (Flavor::Tracks, mount, DEFAULT_BITRATE_KBPS, Some(separator))
        }
    };

    if !mount_args.source_dir.is_dir() {
        return Err(format!(
            "source directory {} does not exist",
            mount_args.source_dir.display()
        )
        .into());
    }
    if !mount_args.mountpoint.is_dir() {
        return Err(format!(
            "mount point {} does not exist",
            mount_args.mountpoint.display()
        )
        .into());
    }
    if bitrate == 0 {
        return Err("bitrate must be positive".into());
    }

    let mut cfg = MountConfig::new(&mount_args.cache_dir, mount_args.cache_size);
    cfg.sweep_interval = Duration::from_secs(mount_args.sweep_interval.max(1));
    cfg.min_evictable_size = mount_args.min_evictable_size;
    cfg.evict_exclude = mount_args.evict_exclude.clone();
    cfg.eviction_log = mount_args.eviction_log.clone();
    cfg.bitrate_kbps = bitrate;
    if !mount_args.hide_ext.is_empty() {
        cfg.hidden_extensions = mount_args.hide_ext.clone();
    }
    cfg.hidden_directories = mount_args.hide_dir.clone();
    if let Some(sep) = separator {
        cfg.track_separator = sep;
    }

    let shutdown = Arc::new(ShutdownSignal::new());
    install_signal_handlers(shutdown.clone())?;

    let (fs, maintainer) = build_engine(flavor, &mount_args.source_dir, &cfg, shutdown.clone())?;
    let sweeper = maintainer.spawn();

    let options = MountOptions {
        allow_other: mount_args.allow_other,
        ..MountOptions::default()
    };
    let session = spawn_mount(fs, &mount_args.mountpoint, options)?;
    tracing::info!(
        mountpoint = %mount_args.mountpoint.display(),
        source = %mount_args.source_dir.display(),
        "mounted; waiting for shutdown signal"
    );

    while !shutdown.is_signaled() {
        std::thread::sleep(Duration::from_millis(200));
    }
    tracing::info!(signal = shutdown.signal_name(), "unmounting");

    drop(session);
    let _ = sweeper.join();
    Ok(())
}
