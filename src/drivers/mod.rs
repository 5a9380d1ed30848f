//! Encoder drivers.
//!
//! A driver turns one source file (plus parameters) into the complete
//! byte stream of a derived file by running external encoder processes
//! and capturing their output. Drivers are pure over their inputs:
//! the same request against the same driver version produces the same
//! bytes, which is what lets the fingerprint stand in for the stream.
//!
//! The capability set is deliberately small: identify yourself
//! ([`Driver::id`], [`Driver::version_tag`]), canonicalize your
//! parameters ([`Driver::params`]), predict your output size
//! ([`Driver::estimate_size`]), and produce the stream
//! ([`Driver::produce`]). Size estimates must be upper bounds; they are
//! replaced by true sizes after the first successful build.

pub mod mp3;
pub mod ogg;
pub mod split;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::fingerprint::{Fingerprint, SourceId};
use crate::media::cue::TrackWindow;
use crate::signal::ShutdownSignal;

/// Everything a driver needs to build one derived file.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    /// Absolute path of the source file.
    pub source: PathBuf,
    /// Identity of the source at the time the request was made.
    pub source_id: SourceId,
    /// The track window, for per-track extraction drivers.
    pub track: Option<TrackWindow>,
}

impl BuildRequest {
    /// The fingerprint naming this request's derived stream.
    pub fn fingerprint(&self, driver: &dyn Driver) -> Fingerprint {
        Fingerprint::compute(
            driver.id(),
            driver.version_tag(),
            &driver.params(self),
            &self.source_id,
        )
    }
}

/// The common contract every encoder driver honors.
pub trait Driver: Send + Sync {
    /// Short stable identifier, part of every fingerprint.
    fn id(&self) -> &'static str;

    /// Version tag baked into the driver. Changing it invalidates all
    /// cache entries the driver previously produced.
    fn version_tag(&self) -> &'static str;

    /// Canonical parameter string for `req`, part of the fingerprint.
    fn params(&self, req: &BuildRequest) -> String;

    /// Upper-bound estimate of the derived stream's byte length.
    fn estimate_size(&self, req: &BuildRequest) -> EngineResult<u64>;

    /// Produces the full derived stream into `sink`. Must not leave
    /// partial output claims behind on failure; the caller owns the
    /// sink file and discards it when this returns an error.
    fn produce(
        &self,
        req: &BuildRequest,
        sink: &mut dyn Write,
        cancel: &ShutdownSignal,
    ) -> EngineResult<()>;
}

/// Runs a pipeline of external commands, streaming the final stage's
/// stdout into `sink`.
///
/// Stages are connected stdout-to-stdin. Cancellation kills every child
/// and returns [`EngineError::Cancelled`]; a non-zero exit from any
/// stage is a [`EngineError::DriverFailure`].
pub(crate) fn run_pipeline(
    driver: &'static str,
    mut stages: Vec<Command>,
    sink: &mut dyn Write,
    cancel: &ShutdownSignal,
) -> EngineResult<()> {
    assert!(!stages.is_empty());

    let mut children: Vec<Child> = Vec::with_capacity(stages.len());
    for (i, cmd) in stages.iter_mut().enumerate() {
        if i == 0 {
            cmd.stdin(Stdio::null());
        } else {
            let upstream = children[i - 1].stdout.take().ok_or_else(|| {
                EngineError::DriverFailure {
                    driver,
                    detail: format!("stage {} produced no stdout", i - 1),
                }
            })?;
            cmd.stdin(Stdio::from(upstream));
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        let child = cmd.spawn().map_err(|e| EngineError::DriverFailure {
            driver,
            detail: format!("failed to spawn stage {i}: {e}"),
        })?;
        children.push(child);
    }

    let mut out = children
        .last_mut()
        .and_then(|c| c.stdout.take())
        .ok_or_else(|| EngineError::DriverFailure {
            driver,
            detail: "final stage produced no stdout".to_string(),
        })?;

    let mut buf = [0u8; 64 * 1024];
    let copy_result: EngineResult<()> = loop {
        if cancel.is_signaled() {
            break Err(EngineError::Cancelled);
        }
        match out.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = sink.write_all(&buf[..n]) {
                    break Err(EngineError::DriverFailure {
                        driver,
                        detail: format!("sink write failed: {e}"),
                    });
                }
            }
            Err(e) => {
                break Err(EngineError::DriverFailure {
                    driver,
                    detail: format!("pipeline read failed: {e}"),
                })
            }
        }
    };

    if copy_result.is_err() {
        for child in &mut children {
            let _ = child.kill();
        }
    }

    // Reap every stage; report the first non-zero status if the copy
    // itself succeeded.
    let mut status_failure = None;
    for (i, child) in children.iter_mut().enumerate() {
        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                if status_failure.is_none() {
                    status_failure = Some(EngineError::DriverFailure {
                        driver,
                        detail: format!("stage {i} exited with {status}"),
                    });
                }
            }
            Err(e) => {
                if status_failure.is_none() {
                    status_failure = Some(EngineError::DriverFailure {
                        driver,
                        detail: format!("failed to wait for stage {i}: {e}"),
                    });
                }
            }
        }
    }

    copy_result?;
    if let Some(err) = status_failure {
        warn!(driver, error = %err, "encoder pipeline failed");
        return Err(err);
    }
    Ok(())
}
