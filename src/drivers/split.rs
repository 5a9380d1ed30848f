//! Per-track extraction driver.
//!
//! Slices one track out of an album FLAC file using the cue-derived
//! window: `flac -d -c` with `--skip`/`--until` decodes the range, and
//! a second `flac` re-encodes it with the track's tags. The container
//! stays lossless; album-level tags are copied from the source with the
//! track title, artist, and number overriding.

use std::io::Write;
use std::process::Command;
use std::sync::Arc;

use super::{run_pipeline, BuildRequest, Driver};
use crate::error::{EngineError, EngineResult};
use crate::media::cue::TrackWindow;
use crate::media::{flac_tags, tag, MediaProber};
use crate::signal::ShutdownSignal;

/// Headroom for stream headers, seek padding, and encoder variance.
const HEADER_ALLOWANCE: u64 = 64 * 1024;

/// Margin over the mean source bitrate; individual tracks can encode
/// denser than the album average.
const DENSITY_MARGIN: f64 = 1.05;

/// Extracts single tracks from album FLAC files.
pub struct SplitDriver {
    prober: Arc<MediaProber>,
}

impl SplitDriver {
    pub fn new(prober: Arc<MediaProber>) -> Self {
        SplitDriver { prober }
    }

    fn window<'r>(&self, req: &'r BuildRequest) -> EngineResult<&'r TrackWindow> {
        req.track.as_ref().ok_or_else(|| EngineError::DriverFailure {
            driver: "split",
            detail: "request carries no track window".to_string(),
        })
    }
}

impl Driver for SplitDriver {
    fn id(&self) -> &'static str {
        "split"
    }

    fn version_tag(&self) -> &'static str {
        "flacsplit-1"
    }

    fn params(&self, req: &BuildRequest) -> String {
        match &req.track {
            Some(w) => format!(
                "track={:02};skip={};until={};title={};artist={}",
                w.number,
                w.skip.map(|t| t.flac_spec()).unwrap_or_default(),
                w.until.map(|t| t.flac_spec()).unwrap_or_default(),
                w.title,
                w.artist,
            ),
            None => String::new(),
        }
    }

    fn estimate_size(&self, req: &BuildRequest) -> EngineResult<u64> {
        let w = self.window(req)?;
        let info = self.prober.probe(&req.source, &req.source_id)?;
        let begin = w.skip.map(|t| t.seconds()).unwrap_or(0.0);
        let end = w
            .until
            .map(|t| t.seconds())
            .unwrap_or_else(|| info.duration_secs());
        let duration = (end - begin).max(0.0);
        let estimate = duration * info.bytes_per_second() * DENSITY_MARGIN;
        Ok(estimate.ceil() as u64 + HEADER_ALLOWANCE)
    }

    fn produce(
        &self,
        req: &BuildRequest,
        sink: &mut dyn Write,
        cancel: &ShutdownSignal,
    ) -> EngineResult<()> {
        let w = self.window(req)?;

        let mut tags = flac_tags(&req.source)?;
        set_tag(&mut tags, tag::TITLE, &w.title);
        set_tag(&mut tags, tag::ARTIST, &w.artist);
        set_tag(&mut tags, tag::TRACK_NUMBER, &format!("{:02}", w.number));

        let mut decode = Command::new("flac");
        decode.args(["-d", "-w", "--totally-silent", "-c"]);
        if let Some(skip) = w.skip {
            decode.arg(format!("--skip={}", skip.flac_spec()));
        }
        if let Some(until) = w.until {
            decode.arg(format!("--until={}", until.flac_spec()));
        }
        decode.arg(&req.source);

        // --no-seektable: flac cannot build a seek table while writing
        // to stdout.
        let mut encode = Command::new("flac");
        for (name, value) in &tags {
            encode.arg("-T").arg(format!("{name}={value}"));
        }
        encode.args([
            "-w",
            "--totally-silent",
            "-f",
            "--fast",
            "--no-seektable",
            "-o",
            "-",
            "-",
        ]);

        run_pipeline(self.id(), vec![decode, encode], sink, cancel)
    }
}

fn set_tag(tags: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(existing) = tags.iter_mut().find(|(n, _)| n == name) {
        existing.1 = value.to_string();
    } else {
        tags.push((name.to_string(), value.to_string()));
    }
}
