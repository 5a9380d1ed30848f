//! MPEG Layer III transcoding driver.
//!
//! Decodes the FLAC source with `flac -dcs` and pipes the raw stream
//! into `lame` at a fixed (CBR) bitrate. The source's tag block is
//! mapped 1:1 onto ID3v2 fields using lame's tag options.

use std::io::Write;
use std::process::Command;
use std::sync::Arc;

use super::{run_pipeline, BuildRequest, Driver};
use crate::error::EngineResult;
use crate::media::{flac_tags, tag, MediaProber};
use crate::signal::ShutdownSignal;

/// Samples per MPEG-1 Layer III frame.
const SAMPLES_PER_FRAME: u64 = 1152;

/// Allowance for the ID3v2 header the encoder prepends.
const ID3_ALLOWANCE: u64 = 16 * 1024;

/// FLAC tag name → lame tag option.
const TAG_OPTIONS: &[(&str, &str)] = &[
    (tag::TITLE, "--tt"),
    (tag::ARTIST, "--ta"),
    (tag::ALBUM, "--tl"),
    (tag::DATE, "--ty"),
    (tag::TRACK_NUMBER, "--tn"),
    (tag::GENRE, "--tg"),
    (tag::COMMENT, "--tc"),
];

/// Transcodes FLAC sources to CBR MP3 via `flac | lame`.
pub struct Mp3Driver {
    bitrate_kbps: u32,
    prober: Arc<MediaProber>,
}

impl Mp3Driver {
    pub fn new(bitrate_kbps: u32, prober: Arc<MediaProber>) -> Self {
        Mp3Driver {
            bitrate_kbps,
            prober,
        }
    }
}

impl Driver for Mp3Driver {
    fn id(&self) -> &'static str {
        "mp3"
    }

    fn version_tag(&self) -> &'static str {
        "lame-cbr-1"
    }

    fn params(&self, _req: &BuildRequest) -> String {
        format!("bitrate={}", self.bitrate_kbps)
    }

    fn estimate_size(&self, req: &BuildRequest) -> EngineResult<u64> {
        let info = self.prober.probe(&req.source, &req.source_id)?;
        if info.sample_rate == 0 {
            return Ok(ID3_ALLOWANCE);
        }
        // CBR frame arithmetic, rounded up to complete frames; the
        // extra byte per frame covers the padding bit.
        let frames = info.total_samples.div_ceil(SAMPLES_PER_FRAME);
        let frame_bytes =
            (144_000 * self.bitrate_kbps as u64).div_ceil(info.sample_rate as u64) + 1;
        Ok(frames * frame_bytes + ID3_ALLOWANCE)
    }

    fn produce(
        &self,
        req: &BuildRequest,
        sink: &mut dyn Write,
        cancel: &ShutdownSignal,
    ) -> EngineResult<()> {
        let tags = flac_tags(&req.source)?;

        let mut decode = Command::new("flac");
        decode.args(["-d", "-w", "-c", "--totally-silent"]);
        decode.arg(&req.source);

        let mut encode = Command::new("lame");
        encode.args(["--noreplaygain", "--silent"]);
        for (name, value) in &tags {
            if let Some((_, opt)) = TAG_OPTIONS.iter().find(|(t, _)| t == name) {
                encode.arg(opt).arg(value);
            }
        }
        encode.args(["--add-id3v2", "-b"]);
        encode.arg(self.bitrate_kbps.to_string());
        encode.args(["-", "-"]);

        run_pipeline(self.id(), vec![decode, encode], sink, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::SourceId;
    use std::path::PathBuf;

    fn req() -> BuildRequest {
        BuildRequest {
            source: PathBuf::from("/music/alpha.flac"),
            source_id: SourceId {
                dev: 1,
                ino: 2,
                mtime: 3,
                size: 4,
            },
            track: None,
        }
    }

    #[test]
    fn params_carry_the_bitrate() {
        let d = Mp3Driver::new(128, Arc::new(MediaProber::new()));
        assert_eq!(d.params(&req()), "bitrate=128");
    }

    #[test]
    fn bitrate_changes_the_fingerprint() {
        let prober = Arc::new(MediaProber::new());
        let a = req().fingerprint(&Mp3Driver::new(128, prober.clone()));
        let b = req().fingerprint(&Mp3Driver::new(192, prober));
        assert_ne!(a, b);
    }
}
