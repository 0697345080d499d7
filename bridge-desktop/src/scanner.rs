//! File-system media scanner
//!
//! Walks a local directory tree, keeps files whose extension is a known audio
//! or video container and derives metadata from the path:
//! `<Genre>/<Artist>/NN - Title.ext` style layouts are recognised, anything
//! else falls back to the file stem as title. No decoding happens here.

use bridge_traits::{
    error::{BridgeError, Result},
    mrl::{encode_mrl, mrl_to_path},
    scanner::{DiscoveredFile, MediaScanner, MediaType, ParsedMedia},
};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "aac", "wav", "wave", "wma", "alac", "aiff",
    "aif", "ape", "wv",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "webm", "m4v", "wmv", "flv", "mpg", "mpeg", "ts", "3gp",
];

/// Scanner backed by the local file system.
#[derive(Debug, Clone)]
pub struct FsMediaScanner {
    follow_links: bool,
    include_hidden: bool,
}

impl FsMediaScanner {
    pub fn new() -> Self {
        Self {
            follow_links: false,
            include_hidden: false,
        }
    }

    /// Follow symbolic links while walking.
    pub fn with_follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    /// Also index files and directories whose name starts with a dot.
    pub fn with_hidden(mut self, include: bool) -> Self {
        self.include_hidden = include;
        self
    }

    fn media_type_of(path: &Path) -> MediaType {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return MediaType::Unknown;
        };
        let ext = ext.to_ascii_lowercase();
        if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Audio
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Video
        } else {
            MediaType::Unknown
        }
    }

    fn is_hidden(name: &str) -> bool {
        name.starts_with('.') && name != "." && name != ".."
    }
}

impl Default for FsMediaScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaScanner for FsMediaScanner {
    fn list_files(&self, entry_point: &str) -> Result<Vec<DiscoveredFile>> {
        let root = mrl_to_path(entry_point)
            .ok_or_else(|| BridgeError::Unreachable(entry_point.to_string()))?;
        if !root.is_dir() {
            return Err(BridgeError::Unreachable(entry_point.to_string()));
        }

        let include_hidden = self.include_hidden;
        let walker = WalkDir::new(&root)
            .follow_links(self.follow_links)
            .into_iter()
            .filter_entry(move |entry| {
                entry.depth() == 0
                    || include_hidden
                    || !Self::is_hidden(&entry.file_name().to_string_lossy())
            });

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(entry_point, error = %err, "Skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file()
                || Self::media_type_of(entry.path()) == MediaType::Unknown
            {
                continue;
            }

            let Some(mrl) = entry.path().to_str().and_then(encode_mrl) else {
                continue;
            };
            let metadata = entry.metadata().map_err(|e| {
                BridgeError::OperationFailed(format!("metadata for {}: {}", mrl, e))
            })?;
            let modified_at = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default();

            files.push(DiscoveredFile::new(mrl, metadata.len(), modified_at));
        }

        files.sort_by(|a, b| a.mrl.cmp(&b.mrl));
        debug!(entry_point, count = files.len(), "Listed entry point");
        Ok(files)
    }

    fn parse(&self, file: &DiscoveredFile) -> Result<ParsedMedia> {
        let path = mrl_to_path(&file.mrl).ok_or_else(|| BridgeError::Parse {
            mrl: file.mrl.clone(),
            message: "not a local file".to_string(),
        })?;
        if !path.is_file() {
            return Err(BridgeError::Parse {
                mrl: file.mrl.clone(),
                message: "file vanished".to_string(),
            });
        }

        let media_type = Self::media_type_of(&path);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .trim();

        let (track_number, title) = split_track_number(stem);
        let mut parsed = ParsedMedia {
            title: title.to_string(),
            media_type,
            ..Default::default()
        };

        if media_type == MediaType::Audio {
            let mut ancestors = path.ancestors().skip(1);
            parsed.track_number = track_number;
            parsed.artist = ancestors.next().and_then(dir_name);
            parsed.genre = ancestors.next().and_then(dir_name);
        }

        Ok(parsed)
    }
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

/// Splits `"07 - Title"` / `"07. Title"` into the track number and the title.
fn split_track_number(stem: &str) -> (Option<u32>, &str) {
    let digits = stem.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 || digits > 3 {
        return (None, stem);
    }
    let rest = stem[digits..].trim_start_matches(&[' ', '-', '.', '_'][..]);
    if rest.is_empty() {
        return (None, stem);
    }
    (stem[..digits].parse().ok(), rest)
}
