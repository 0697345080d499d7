//! Media Scanner Abstraction
//!
//! The scanner is the boundary between the library core and whatever actually
//! touches storage: it enumerates the files below an entry point and extracts
//! the metadata the library indexes. Demuxing and tag parsing live behind this
//! trait; the core only sees [`DiscoveredFile`] and [`ParsedMedia`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Broad classification of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    #[default]
    Unknown,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file found while listing an entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredFile {
    /// Normalized resource locator of the file
    pub mrl: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time (Unix seconds)
    pub modified_at: i64,
}

impl DiscoveredFile {
    pub fn new(mrl: impl Into<String>, size: u64, modified_at: i64) -> Self {
        Self {
            mrl: mrl.into(),
            size,
            modified_at,
        }
    }

    /// Last path segment of the MRL.
    pub fn filename(&self) -> &str {
        self.mrl.rsplit('/').next().unwrap_or(&self.mrl)
    }
}

/// Metadata extracted from a single file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedMedia {
    pub title: String,
    pub media_type: MediaType,
    /// Duration in milliseconds, 0 when unknown
    pub duration_ms: i64,
    pub artist: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<u32>,
    pub release_year: Option<i32>,
}

/// Enumerates and parses media below an entry point.
///
/// Implementations are called from the discovery worker thread and must be
/// safe to share across threads.
pub trait MediaScanner: Send + Sync {
    /// List every candidate media file below `entry_point`.
    ///
    /// An error means the entry point itself could not be walked; it is
    /// reported for that entry point only.
    fn list_files(&self, entry_point: &str) -> Result<Vec<DiscoveredFile>>;

    /// Extract metadata for a single file.
    fn parse(&self, file: &DiscoveredFile) -> Result<ParsedMedia>;
}
