//! Ogg Vorbis transcoding driver.
//!
//! `oggenc` reads the FLAC source directly, targets a nominal bitrate,
//! and copies the source's vorbis comment block verbatim into the
//! output, so no tag mapping is needed here.

use std::io::Write;
use std::process::Command;
use std::sync::Arc;

use super::{run_pipeline, BuildRequest, Driver};
use crate::error::EngineResult;
use crate::media::MediaProber;
use crate::signal::ShutdownSignal;

/// Headroom for Ogg container framing and the comment header.
const CONTAINER_ALLOWANCE: u64 = 16 * 1024;

/// Safety factor over the nominal bitrate; vorbis is variable-rate
/// around the target average.
const VBR_MARGIN: f64 = 1.15;

/// Transcodes FLAC sources to Ogg Vorbis via `oggenc`.
pub struct OggDriver {
    bitrate_kbps: u32,
    prober: Arc<MediaProber>,
}

impl OggDriver {
    pub fn new(bitrate_kbps: u32, prober: Arc<MediaProber>) -> Self {
        OggDriver {
            bitrate_kbps,
            prober,
        }
    }
}

impl Driver for OggDriver {
    fn id(&self) -> &'static str {
        "ogg"
    }

    fn version_tag(&self) -> &'static str {
        "oggenc-1"
    }

    fn params(&self, _req: &BuildRequest) -> String {
        format!("bitrate={}", self.bitrate_kbps)
    }

    fn estimate_size(&self, req: &BuildRequest) -> EngineResult<u64> {
        let info = self.prober.probe(&req.source, &req.source_id)?;
        let nominal = info.duration_secs() * (self.bitrate_kbps as f64 * 1000.0 / 8.0);
        Ok((nominal * VBR_MARGIN).ceil() as u64 + CONTAINER_ALLOWANCE)
    }

    fn produce(
        &self,
        req: &BuildRequest,
        sink: &mut dyn Write,
        cancel: &ShutdownSignal,
    ) -> EngineResult<()> {
        let mut encode = Command::new("oggenc");
        encode.args(["-Q", "-b"]);
        encode.arg(self.bitrate_kbps.to_string());
        encode.args(["-o", "-"]);
        encode.arg(&req.source);

        run_pipeline(self.id(), vec![encode], sink, cancel)
    }
}
