//! Cue-sheet parsing.
//!
//! Only the subset the engine consumes is modeled: track numbers,
//! titles, performers, and `INDEX 01` positions. Times are kept in cue
//! frames (1/75 s). Track N's audio spans from its own `INDEX 01` to
//! the next track's `INDEX 01`, with the first track implicitly
//! starting at zero and the last running to end of stream.

use std::fmt;
use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// Artist used when neither the track nor the album names a performer.
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// A position within the album audio, in cue frames (1/75 second).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CueTime {
    frames: u64,
}

impl CueTime {
    /// Parses an `mm:ss:ff` index time.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(':');
        let m: u64 = parts.next()?.trim().parse().ok()?;
        let sec: u64 = parts.next()?.trim().parse().ok()?;
        let f: u64 = parts.next()?.trim().parse().ok()?;
        if parts.next().is_some() || sec >= 60 || f >= 75 {
            return None;
        }
        Some(CueTime {
            frames: (m * 60 + sec) * 75 + f,
        })
    }

    /// The position in seconds.
    pub fn seconds(&self) -> f64 {
        self.frames as f64 / 75.0
    }

    /// The position as a `flac --skip`/`--until` time specification
    /// (`mm:ss.sss`).
    pub fn flac_spec(&self) -> String {
        let minutes = self.frames / (75 * 60);
        let rem = self.frames % (75 * 60);
        format!("{}:{:06.3}", minutes, rem as f64 / 75.0)
    }
}

impl fmt::Display for CueTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flac_spec())
    }
}

/// One track's share of the album audio, ready for extraction.
#[derive(Clone, Debug)]
pub struct TrackWindow {
    /// 1-based track number.
    pub number: u32,
    /// Track title, falling back to `Track NN`.
    pub title: String,
    /// Track performer, falling back to the album performer and then
    /// [`UNKNOWN_ARTIST`].
    pub artist: String,
    /// Start of the track's audio; `None` means start of stream.
    pub skip: Option<CueTime>,
    /// End of the track's audio; `None` means end of stream.
    pub until: Option<CueTime>,
}

#[derive(Clone, Debug, Default)]
struct RawTrack {
    number: u32,
    title: Option<String>,
    performer: Option<String>,
    index01: Option<CueTime>,
}

/// A parsed cue sheet.
#[derive(Clone, Debug, Default)]
pub struct CueSheet {
    /// Album-level performer, if present.
    pub performer: Option<String>,
    /// Album-level title, if present.
    pub title: Option<String>,
    tracks: Vec<RawTrack>,
}

impl CueSheet {
    /// Reads and parses the cue sheet at `path`.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text =
            std::fs::read_to_string(path).map_err(|e| EngineError::source(path, e))?;
        Self::parse(&text).ok_or_else(|| EngineError::SourceUnavailable {
            path: path.to_path_buf(),
            detail: "unparseable cue sheet".to_string(),
        })
    }

    /// Parses cue-sheet text. Returns `None` if no audio track with a
    /// usable structure is found.
    pub fn parse(text: &str) -> Option<Self> {
        let mut sheet = CueSheet::default();
        let mut in_track = false;

        for line in text.lines() {
            let line = line.trim();
            let (keyword, rest) = match line.split_once(char::is_whitespace) {
                Some((k, r)) => (k.to_ascii_uppercase(), r.trim()),
                None => (line.to_ascii_uppercase(), ""),
            };
            match keyword.as_str() {
                "TRACK" => {
                    let mut parts = rest.split_whitespace();
                    let number: u32 = parts.next()?.parse().ok()?;
                    let mode = parts.next().unwrap_or("");
                    if !mode.eq_ignore_ascii_case("AUDIO") {
                        // Data tracks end the audio portion.
                        break;
                    }
                    sheet.tracks.push(RawTrack {
                        number,
                        ..RawTrack::default()
                    });
                    in_track = true;
                }
                "TITLE" => {
                    let value = unquote(rest);
                    if in_track {
                        if let Some(t) = sheet.tracks.last_mut() {
                            t.title = Some(value);
                        }
                    } else {
                        sheet.title = Some(value);
                    }
                }
                "PERFORMER" => {
                    let value = unquote(rest);
                    if in_track {
                        if let Some(t) = sheet.tracks.last_mut() {
                            t.performer = Some(value);
                        }
                    } else {
                        sheet.performer = Some(value);
                    }
                }
                "INDEX" => {
                    let mut parts = rest.split_whitespace();
                    let idx = parts.next()?;
                    let time = parts.next()?;
                    if idx == "01" || idx == "1" {
                        if let Some(t) = sheet.tracks.last_mut() {
                            t.index01 = CueTime::parse(time);
                        }
                    }
                }
                _ => {}
            }
        }

        if sheet.tracks.is_empty() {
            return None;
        }
        Some(sheet)
    }

    /// Number of audio tracks.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// The extraction windows for every track, in cue order.
    ///
    /// Track boundaries follow the breakpoint rule: each track after
    /// the first starts at its own `INDEX 01`, and each track before
    /// the last ends at its successor's `INDEX 01`.
    pub fn windows(&self) -> Vec<TrackWindow> {
        let n = self.tracks.len();
        let mut out = Vec::with_capacity(n);
        for (i, t) in self.tracks.iter().enumerate() {
            let title = t
                .title
                .clone()
                .unwrap_or_else(|| format!("Track {:02}", t.number));
            let artist = t
                .performer
                .clone()
                .or_else(|| self.performer.clone())
                .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
            let skip = if i == 0 { None } else { t.index01 };
            let until = if i + 1 < n {
                self.tracks[i + 1].index01
            } else {
                None
            };
            out.push(TrackWindow {
                number: t.number,
                title,
                artist,
                skip,
                until,
            });
        }
        out
    }

    /// The window for the given 1-based track number.
    pub fn window_for(&self, number: u32) -> Option<TrackWindow> {
        self.windows().into_iter().find(|w| w.number == number)
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
        .to_string()
}
