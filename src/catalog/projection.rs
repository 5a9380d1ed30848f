//! Projection rules: how the source tree maps onto the derived tree.
//!
//! A [`Projection`] answers two questions without ever invoking an
//! encoder: what does a derived path resolve to, and what does a
//! derived directory contain. Entries in the source tree whose names
//! collide with would-be derived names win and pass through, so a real
//! `alpha.mp3` next to `alpha.flac` hides the transcode.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::error::{EngineError, EngineResult};
use crate::media::cue::{CueSheet, TrackWindow};

/// Longest filename the sanitizer will produce.
const MAX_SANITIZED_CHARS: usize = 80;

/// A name in a derived directory together with what it projects to.
#[derive(Clone, Debug)]
pub struct ProjectedEntry {
    pub name: String,
    pub node: ProjectedNode,
}

/// What one derived path stands for.
#[derive(Clone, Debug)]
pub enum ProjectedNode {
    /// A directory; `source` is the path whose stat backs its times.
    Dir { source: PathBuf },
    /// Bytes served straight from the source file.
    PassThrough { source: PathBuf },
    /// Bytes produced by the mount's driver from `source`.
    Derived {
        source: PathBuf,
        /// Set for per-track extraction, absent for whole-file drivers.
        track: Option<TrackWindow>,
    },
}

impl ProjectedNode {
    pub fn is_dir(&self) -> bool {
        matches!(self, ProjectedNode::Dir { .. })
    }
}

/// Name-based visibility rules for the derived view.
#[derive(Clone, Debug, Default)]
pub struct HideRules {
    extensions: Vec<String>,
    directories: Vec<String>,
}

impl HideRules {
    pub fn new(extensions: &[String], directories: &[String]) -> Self {
        HideRules {
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            directories: directories.to_vec(),
        }
    }

    fn hides_file(&self, name: &str) -> bool {
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self
                .extensions
                .iter()
                .any(|h| h.eq_ignore_ascii_case(ext)),
            _ => false,
        }
    }

    fn hides_dir(&self, name: &str) -> bool {
        self.directories.iter().any(|d| d == name)
    }

    /// Whether any directory component of `rel` is hidden.
    fn hides_path(&self, rel: &Path) -> bool {
        rel.parent()
            .map(|parent| {
                parent.components().any(|c| {
                    c.as_os_str()
                        .to_str()
                        .is_some_and(|name| self.hides_dir(name))
                })
            })
            .unwrap_or(false)
    }
}

/// Lazily answers structure questions about the derived tree.
pub trait Projection: Send + Sync {
    /// Resolves a mount-relative path to its node, or `None` if the
    /// derived tree has no entry there.
    fn resolve(&self, rel: &Path) -> EngineResult<Option<ProjectedNode>>;

    /// Lists a derived directory. The path must resolve to a `Dir`.
    fn list(&self, rel: &Path) -> EngineResult<Vec<ProjectedEntry>>;
}

fn classify_read_dir_err(path: &Path, e: io::Error) -> EngineError {
    if e.kind() == io::ErrorKind::NotFound {
        EngineError::NotFound
    } else {
        EngineError::source(path, e)
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

fn has_ext(name: &str, ext: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(stem, e)| !stem.is_empty() && e.eq_ignore_ascii_case(ext))
}

/// Simplifies a name for use as a filename: path separators and pipes
/// become commas, a small set of punctuation survives, everything else
/// (spaces included) is dropped, and the result is length-capped and
/// never starts with a dot.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::new();
    for ch in name.chars() {
        if ch == '/' || ch == '|' {
            out.push(',');
        } else if ch.is_alphanumeric() || ".,;:=+-_()[]".contains(ch) {
            out.push(ch);
        }
        if out.chars().count() >= MAX_SANITIZED_CHARS {
            break;
        }
    }
    if out.starts_with('.') {
        out.replace_range(..1, ",");
    }
    if out.is_empty() {
        out.push('x');
    }
    out
}

// ---------------------------------------------------------------------------
// Transcoding projection (mp3 / ogg)
// ---------------------------------------------------------------------------

/// Projects `stem.flac` to `stem.<target>`; everything else mirrors.
pub struct TranscodeProjection {
    source_root: PathBuf,
    target_ext: &'static str,
    hide: HideRules,
}

impl TranscodeProjection {
    pub fn new(source_root: impl Into<PathBuf>, target_ext: &'static str, hide: HideRules) -> Self {
        TranscodeProjection {
            source_root: source_root.into(),
            target_ext,
            hide,
        }
    }

    fn source_path(&self, rel: &Path) -> PathBuf {
        self.source_root.join(rel)
    }
}

impl Projection for TranscodeProjection {
    fn resolve(&self, rel: &Path) -> EngineResult<Option<ProjectedNode>> {
        if self.hide.hides_path(rel) {
            return Ok(None);
        }
        let src = self.source_path(rel);

        if let Ok(md) = fs::symlink_metadata(&src) {
            if md.is_dir() {
                let hidden = file_name(rel).is_some_and(|n| self.hide.hides_dir(n));
                return Ok(if hidden {
                    None
                } else {
                    Some(ProjectedNode::Dir { source: src })
                });
            }
            if md.is_file() {
                let Some(name) = file_name(rel) else {
                    return Ok(None);
                };
                // The lossless originals themselves are not visible;
                // they appear under their transcoded names.
                if has_ext(name, "flac") || self.hide.hides_file(name) {
                    return Ok(None);
                }
                return Ok(Some(ProjectedNode::PassThrough { source: src }));
            }
            return Ok(None);
        }

        // Nothing real at this name: is it the transcoded view of a
        // lossless sibling?
        let Some(name) = file_name(rel) else {
            return Ok(None);
        };
        if !has_ext(name, self.target_ext) {
            return Ok(None);
        }
        let stem = &name[..name.len() - self.target_ext.len() - 1];
        let flac = src.with_file_name(format!("{stem}.flac"));
        if fs::metadata(&flac).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(Some(ProjectedNode::Derived {
                source: flac,
                track: None,
            }));
        }
        Ok(None)
    }

    fn list(&self, rel: &Path) -> EngineResult<Vec<ProjectedEntry>> {
        let dir = self.source_path(rel);
        let mut real_names: Vec<String> = Vec::new();
        let mut files: Vec<(String, bool)> = Vec::new();

        let entries = fs::read_dir(&dir).map_err(|e| classify_read_dir_err(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::source(&dir, e))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Ok(ft) = entry.file_type() else { continue };
            if ft.is_dir() {
                files.push((name, true));
            } else if ft.is_file() {
                real_names.push(name.clone());
                files.push((name, false));
            }
        }

        let mut out = Vec::new();
        for (name, is_dir) in files {
            if is_dir {
                if !self.hide.hides_dir(&name) {
                    out.push(ProjectedEntry {
                        node: ProjectedNode::Dir {
                            source: dir.join(&name),
                        },
                        name,
                    });
                }
            } else if has_ext(&name, "flac") {
                let stem = &name[..name.len() - ".flac".len()];
                let derived = format!("{stem}.{}", self.target_ext);
                // A real file of the derived name hides the transcode.
                if !real_names.iter().any(|n| *n == derived) {
                    out.push(ProjectedEntry {
                        node: ProjectedNode::Derived {
                            source: dir.join(&name),
                            track: None,
                        },
                        name: derived,
                    });
                }
            } else if !self.hide.hides_file(&name) {
                out.push(ProjectedEntry {
                    node: ProjectedNode::PassThrough {
                        source: dir.join(&name),
                    },
                    name,
                });
            }
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Track-splitting projection
// ---------------------------------------------------------------------------

/// Projects each album FLAC with a sibling cue sheet into a directory
/// of per-track files.
pub struct TrackSplitProjection {
    source_root: PathBuf,
    separator: String,
    hide: HideRules,
    /// Parsed cue sheets, keyed by cue path and validated by mtime.
    cue_memo: Mutex<FxHashMap<PathBuf, (i64, CueSheet)>>,
}

impl TrackSplitProjection {
    pub fn new(
        source_root: impl Into<PathBuf>,
        separator: impl Into<String>,
        hide: HideRules,
    ) -> Self {
        TrackSplitProjection {
            source_root: source_root.into(),
            separator: separator.into(),
            hide,
            cue_memo: Mutex::new(FxHashMap::default()),
        }
    }

    /// Derived filename for one track.
    pub fn track_filename(&self, window: &TrackWindow) -> String {
        format!(
            "{:02}{}{}.flac",
            window.number,
            self.separator,
            sanitize_filename(&window.title)
        )
    }

    fn parse_track_number(&self, name: &str) -> Option<u32> {
        let digits = name.split(&self.separator).next()?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().filter(|n| *n > 0)
    }

    /// The album FLAC and cue paths a derived directory at `rel` would
    /// correspond to, if both exist.
    fn album_for(&self, rel: &Path) -> Option<(PathBuf, PathBuf)> {
        let base = self.source_root.join(rel);
        let mut album = base.into_os_string();
        album.push(".flac");
        let album = PathBuf::from(album);
        let cue = cue_sibling(&album);
        let album_ok = fs::metadata(&album).map(|m| m.is_file()).unwrap_or(false);
        let cue_ok = fs::metadata(&cue).map(|m| m.is_file()).unwrap_or(false);
        (album_ok && cue_ok).then_some((album, cue))
    }

    fn cue_sheet(&self, cue: &Path) -> EngineResult<CueSheet> {
        let mtime = fs::metadata(cue)
            .map(|m| std::os::unix::fs::MetadataExt::mtime(&m))
            .unwrap_or(0);
        if let Some((cached_mtime, sheet)) = self.cue_memo.lock().unwrap_or_else(|e| e.into_inner()).get(cue) {
            if *cached_mtime == mtime {
                return Ok(sheet.clone());
            }
        }
        let sheet = CueSheet::load(cue)?;
        self.cue_memo
            .lock()
            .unwrap()
            .insert(cue.to_path_buf(), (mtime, sheet.clone()));
        Ok(sheet)
    }
}

/// The cue sheet sibling of an album file: same stem, `.cue` extension.
fn cue_sibling(album: &Path) -> PathBuf {
    album.with_extension("cue")
}

impl Projection for TrackSplitProjection {
    fn resolve(&self, rel: &Path) -> EngineResult<Option<ProjectedNode>> {
        if self.hide.hides_path(rel) {
            return Ok(None);
        }
        let src = self.source_root.join(rel);

        if let Ok(md) = fs::symlink_metadata(&src) {
            if md.is_dir() {
                let hidden = file_name(rel).is_some_and(|n| self.hide.hides_dir(n));
                return Ok(if hidden {
                    None
                } else {
                    Some(ProjectedNode::Dir { source: src })
                });
            }
            if md.is_file() {
                let Some(name) = file_name(rel) else {
                    return Ok(None);
                };
                if self.hide.hides_file(name) {
                    return Ok(None);
                }
                if has_ext(name, "flac") {
                    // Albums are projected as directories; only
                    // cue-less files pass through under their own name.
                    let has_cue = fs::metadata(cue_sibling(&src))
                        .map(|m| m.is_file())
                        .unwrap_or(false);
                    return Ok(if has_cue {
                        None
                    } else {
                        Some(ProjectedNode::PassThrough { source: src })
                    });
                }
                if has_ext(name, "cue") {
                    // A cue consumed by an album is projection input,
                    // not content.
                    let album = src.with_extension("flac");
                    let paired = fs::metadata(&album).map(|m| m.is_file()).unwrap_or(false);
                    return Ok(if paired {
                        None
                    } else {
                        Some(ProjectedNode::PassThrough { source: src })
                    });
                }
                return Ok(Some(ProjectedNode::PassThrough { source: src }));
            }
            return Ok(None);
        }

        // The album directory itself?
        if let Some((album, _cue)) = self.album_for(rel) {
            return Ok(Some(ProjectedNode::Dir { source: album }));
        }

        // A track file inside an album directory?
        let (Some(parent), Some(name)) = (rel.parent(), file_name(rel)) else {
            return Ok(None);
        };
        if !has_ext(name, "flac") {
            return Ok(None);
        }
        let Some((album, cue)) = self.album_for(parent) else {
            return Ok(None);
        };
        let Some(number) = self.parse_track_number(name) else {
            return Ok(None);
        };
        let sheet = self.cue_sheet(&cue)?;
        let Some(window) = sheet.window_for(number) else {
            return Ok(None);
        };
        if self.track_filename(&window) != name {
            return Ok(None);
        }
        Ok(Some(ProjectedNode::Derived {
            source: album,
            track: Some(window),
        }))
    }

    fn list(&self, rel: &Path) -> EngineResult<Vec<ProjectedEntry>> {
        // An album directory lists one entry per cue track.
        if let Some((album, cue)) = self.album_for(rel) {
            let sheet = self.cue_sheet(&cue)?;
            let mut out = Vec::new();
            for window in sheet.windows() {
                out.push(ProjectedEntry {
                    name: self.track_filename(&window),
                    node: ProjectedNode::Derived {
                        source: album.clone(),
                        track: Some(window),
                    },
                });
            }
            return Ok(out);
        }

        let dir = self.source_root.join(rel);
        let entries = fs::read_dir(&dir).map_err(|e| classify_read_dir_err(&dir, e))?;

        let mut names: Vec<(String, bool)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::source(&dir, e))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Ok(ft) = entry.file_type() else { continue };
            if ft.is_dir() || ft.is_file() {
                names.push((name, ft.is_dir()));
            }
        }

        let mut album_dirs: Vec<String> = Vec::new();
        let mut out = Vec::new();
        for (name, is_dir) in &names {
            if !is_dir && has_ext(name, "flac") {
                let stem = &name[..name.len() - ".flac".len()];
                if self.album_for(&rel.join(stem)).is_some() {
                    album_dirs.push(stem.to_string());
                    out.push(ProjectedEntry {
                        name: stem.to_string(),
                        node: ProjectedNode::Dir {
                            source: dir.join(name),
                        },
                    });
                }
            }
        }

        for (name, is_dir) in &names {
            if *is_dir {
                // An album directory hides a real directory of the
                // same name.
                if !self.hide.hides_dir(name) && !album_dirs.iter().any(|a| a == name) {
                    out.push(ProjectedEntry {
                        name: name.clone(),
                        node: ProjectedNode::Dir {
                            source: dir.join(name),
                        },
                    });
                }
                continue;
            }
            if self.hide.hides_file(name) {
                continue;
            }
            if has_ext(name, "flac") {
                let stem = &name[..name.len() - ".flac".len()];
                if !album_dirs.iter().any(|a| a == stem) {
                    out.push(ProjectedEntry {
                        name: name.clone(),
                        node: ProjectedNode::PassThrough {
                            source: dir.join(name),
                        },
                    });
                }
                continue;
            }
            if has_ext(name, "cue") {
                let album = dir.join(name).with_extension("flac");
                if fs::metadata(&album).map(|m| m.is_file()).unwrap_or(false) {
                    continue;
                }
            }
            out.push(ProjectedEntry {
                name: name.clone(),
                node: ProjectedNode::PassThrough {
                    source: dir.join(name),
                },
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const CUE: &str = r#"
PERFORMER "The Ensemble"
TITLE "Opus"
FILE "opus.flac" WAVE
  TRACK 01 AUDIO
    TITLE "Overture"
    INDEX 01 00:00:00
  TRACK 02 AUDIO
    TITLE "Aria: Part One"
    INDEX 01 04:12:33
"#;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    fn names(entries: &[ProjectedEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn sanitizer_matches_the_filename_rules() {
        assert_eq!(sanitize_filename("Aria: Part One"), "Aria:PartOne");
        assert_eq!(sanitize_filename("AC/DC"), "AC,DC");
        assert_eq!(sanitize_filename(".hidden"), ",hidden");
        assert_eq!(sanitize_filename("???"), "x");
        assert_eq!(sanitize_filename("Name (Live) [2001]"), "Name(Live)[2001]");
    }

    #[test]
    fn transcode_lists_derived_and_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("alpha.flac"));
        touch(&dir.path().join("cover.jpg"));
        touch(&dir.path().join("notes.pdf"));
        std::fs::create_dir(dir.path().join("disc2")).unwrap();

        let hide = HideRules::new(&["jpg".to_string()], &[]);
        let p = TranscodeProjection::new(dir.path(), "mp3", hide);

        let entries = p.list(Path::new("")).unwrap();
        assert_eq!(names(&entries), ["alpha.mp3", "disc2", "notes.pdf"]);
    }

    #[test]
    fn transcode_real_file_hides_derived() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("alpha.flac"));
        touch(&dir.path().join("alpha.mp3"));

        let p = TranscodeProjection::new(dir.path(), "mp3", HideRules::default());
        let entries = p.list(Path::new("")).unwrap();
        assert_eq!(names(&entries), ["alpha.mp3"]);
        assert!(matches!(
            entries[0].node,
            ProjectedNode::PassThrough { .. }
        ));
    }

    #[test]
    fn transcode_resolves_derived_names() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("alpha.flac"));

        let p = TranscodeProjection::new(dir.path(), "mp3", HideRules::default());

        match p.resolve(Path::new("alpha.mp3")).unwrap() {
            Some(ProjectedNode::Derived { source, track }) => {
                assert_eq!(source, dir.path().join("alpha.flac"));
                assert!(track.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The raw lossless name is not visible.
        assert!(p.resolve(Path::new("alpha.flac")).unwrap().is_none());
        // Nor is a derived name without a source.
        assert!(p.resolve(Path::new("beta.mp3")).unwrap().is_none());
    }

    #[test]
    fn transcode_hides_configured_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("artwork")).unwrap();
        touch(&dir.path().join("artwork/scan.flac"));

        let hide = HideRules::new(&[], &["artwork".to_string()]);
        let p = TranscodeProjection::new(dir.path(), "mp3", hide);

        assert!(p.list(Path::new("")).unwrap().is_empty());
        assert!(p.resolve(Path::new("artwork")).unwrap().is_none());
        assert!(p.resolve(Path::new("artwork/scan.mp3")).unwrap().is_none());
    }

    #[test]
    fn split_projects_albums_as_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("opus.flac"));
        std::fs::write(dir.path().join("opus.cue"), CUE).unwrap();
        touch(&dir.path().join("single.flac"));

        let p = TrackSplitProjection::new(dir.path(), "_", HideRules::default());
        let entries = p.list(Path::new("")).unwrap();
        assert_eq!(names(&entries), ["opus", "single.flac"]);
        assert!(entries[0].node.is_dir());
        assert!(matches!(
            entries[1].node,
            ProjectedNode::PassThrough { .. }
        ));
    }

    #[test]
    fn split_album_directory_lists_tracks() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("opus.flac"));
        std::fs::write(dir.path().join("opus.cue"), CUE).unwrap();

        let p = TrackSplitProjection::new(dir.path(), "_", HideRules::default());
        let tracks = p.list(Path::new("opus")).unwrap();
        assert_eq!(names(&tracks), ["01_Overture.flac", "02_Aria:PartOne.flac"]);
        for t in &tracks {
            match &t.node {
                ProjectedNode::Derived { track: Some(w), .. } => {
                    assert!(!w.title.is_empty());
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn split_resolves_track_files_exactly() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("opus.flac"));
        std::fs::write(dir.path().join("opus.cue"), CUE).unwrap();

        let p = TrackSplitProjection::new(dir.path(), "_", HideRules::default());

        match p.resolve(Path::new("opus/02_Aria:PartOne.flac")).unwrap() {
            Some(ProjectedNode::Derived {
                track: Some(window),
                ..
            }) => assert_eq!(window.number, 2),
            other => panic!("unexpected: {other:?}"),
        }
        // Wrong name for the track number does not resolve.
        assert!(p
            .resolve(Path::new("opus/02_Wrong.flac"))
            .unwrap()
            .is_none());
        assert!(p.resolve(Path::new("opus/07_Nope.flac")).unwrap().is_none());
        // The album dir resolves as a directory.
        assert!(p.resolve(Path::new("opus")).unwrap().unwrap().is_dir());
    }

    #[test]
    fn split_consumed_cue_is_hidden() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("opus.flac"));
        std::fs::write(dir.path().join("opus.cue"), CUE).unwrap();
        std::fs::write(dir.path().join("orphan.cue"), CUE).unwrap();

        let p = TrackSplitProjection::new(dir.path(), "_", HideRules::default());
        assert!(p.resolve(Path::new("opus.cue")).unwrap().is_none());
        assert!(matches!(
            p.resolve(Path::new("orphan.cue")).unwrap(),
            Some(ProjectedNode::PassThrough { .. })
        ));
        let entries = p.list(Path::new("")).unwrap();
        assert_eq!(names(&entries), ["opus", "orphan.cue"]);
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let p = TranscodeProjection::new(dir.path(), "mp3", HideRules::default());
        assert!(matches!(
            p.list(Path::new("gone")).unwrap_err(),
            EngineError::NotFound
        ));
    }
}
