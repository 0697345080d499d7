//! Domain models for the media library
//!
//! Every entity is a [`LibraryItem`]: a stable id, a title and a tagged
//! [`ItemDetails`] payload. Kind-specific behaviour is exposed through the
//! small capability traits [`TrackContainer`] and [`Resumable`] instead of a
//! type hierarchy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};

pub use bridge_traits::scanner::MediaType;

/// Id of the artist unknown tracks are attached to.
pub const UNKNOWN_ARTIST_ID: u64 = 1;
/// Id of the compilation artist.
pub const VARIOUS_ARTISTS_ID: u64 = 2;
/// First id handed out to regular entities.
pub const FIRST_FREE_ID: u64 = 3;

// =============================================================================
// Results
// =============================================================================

/// Outcome of opening the persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitResult {
    Success,
    AlreadyInitialized,
    /// The database could not be created or opened for I/O reasons.
    Failed,
    /// The schema was outdated and has been recreated empty.
    DbReset,
    /// Damaged data was discarded; playlists were salvaged.
    DbCorrupted,
    /// The file is not usable at all; the caller has to reset it.
    DbUnrecoverable,
}

impl InitResult {
    /// Whether the store is usable after this result.
    pub fn is_usable(&self) -> bool {
        !matches!(self, InitResult::Failed | InitResult::DbUnrecoverable)
    }
}

/// How a reported playback time was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackResult {
    Error,
    /// Too close to the start; the resume point was reset.
    Begin,
    /// Stored as reported.
    AsIs,
    /// Considered finished; the resume point was reset and the play counted.
    End,
}

// =============================================================================
// Flags
// =============================================================================

/// Media flag bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaFlags(u32);

impl MediaFlags {
    pub const NONE: MediaFlags = MediaFlags(0);
    pub const FAVORITE: MediaFlags = MediaFlags(1 << 0);
    /// Added explicitly rather than found by discovery.
    pub const EXTERNAL: MediaFlags = MediaFlags(1 << 1);
    /// Playback should ignore the resume point.
    pub const FROM_START: MediaFlags = MediaFlags(1 << 2);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(&self, other: MediaFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, flag: MediaFlags, on: bool) {
        if on {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }
}

impl BitOr for MediaFlags {
    type Output = MediaFlags;

    fn bitor(self, rhs: Self) -> Self {
        MediaFlags(self.0 | rhs.0)
    }
}

impl BitAnd for MediaFlags {
    type Output = MediaFlags;

    fn bitand(self, rhs: Self) -> Self {
        MediaFlags(self.0 & rhs.0)
    }
}

// =============================================================================
// Item kinds
// =============================================================================

/// Tag of an [`ItemDetails`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    Media,
    Artist,
    Genre,
    Playlist,
    MediaGroup,
    Bookmark,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Media => "media",
            ItemType::Artist => "artist",
            ItemType::Genre => "genre",
            ItemType::Playlist => "playlist",
            ItemType::MediaGroup => "media_group",
            ItemType::Bookmark => "bookmark",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "media" => Some(ItemType::Media),
            "artist" => Some(ItemType::Artist),
            "genre" => Some(ItemType::Genre),
            "playlist" => Some(ItemType::Playlist),
            "media_group" => Some(ItemType::MediaGroup),
            "bookmark" => Some(ItemType::Bookmark),
            _ => None,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Details
// =============================================================================

/// A media file, discovered or added explicitly.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaDetails {
    pub mrl: String,
    pub filename: String,
    pub media_type: MediaType,
    /// Milliseconds, `<= 0` when unknown
    pub duration_ms: i64,
    /// Resume point in milliseconds
    pub last_time: i64,
    /// Resume point as a fraction of the duration
    pub last_position: f32,
    pub play_count: u32,
    /// Unix seconds of the last reported playback
    pub last_played_at: Option<i64>,
    pub flags: MediaFlags,
    /// File currently reachable on a known entry point
    pub is_present: bool,
    /// Entry point the file was discovered under, `None` for external media
    pub entry_point: Option<String>,
    pub artist_id: Option<u64>,
    pub genre_id: Option<u64>,
    pub track_number: Option<u32>,
    pub release_year: Option<i32>,
    pub file_size: u64,
    /// Unix seconds
    pub insertion_date: i64,
    /// File modification time (Unix seconds), 0 when unknown
    pub modification_date: i64,
}

impl MediaDetails {
    pub fn new(mrl: impl Into<String>) -> Self {
        let mrl = mrl.into();
        let filename = filename_of(&mrl);
        Self {
            mrl,
            filename,
            is_present: true,
            ..Default::default()
        }
    }

    pub fn is_external(&self) -> bool {
        self.flags.contains(MediaFlags::EXTERNAL)
    }

    pub fn is_favorite(&self) -> bool {
        self.flags.contains(MediaFlags::FAVORITE)
    }

    pub fn has_history(&self) -> bool {
        self.last_played_at.is_some() || self.play_count > 0
    }
}

/// Denormalized member counters.
///
/// `present_tracks_count <= tracks_count` at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackCounters {
    pub tracks_count: u32,
    pub present_tracks_count: u32,
}

impl TrackCounters {
    pub fn new(tracks_count: u32, present_tracks_count: u32) -> Self {
        Self {
            tracks_count,
            present_tracks_count: present_tracks_count.min(tracks_count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub mrl: String,
    /// `None` while the media is not in the library
    pub media_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaylistDetails {
    pub entries: Vec<PlaylistEntry>,
    pub counters: TrackCounters,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaGroupDetails {
    pub media_ids: Vec<u64>,
    pub counters: TrackCounters,
}

/// A named position inside a media. The name is the item title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkDetails {
    /// Weak reference; the bookmark is deleted with its media
    pub media_id: u64,
    /// Offset in milliseconds
    pub time: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum ItemDetails {
    Media(MediaDetails),
    Artist(TrackCounters),
    Genre(TrackCounters),
    Playlist(PlaylistDetails),
    MediaGroup(MediaGroupDetails),
    Bookmark(BookmarkDetails),
}

// =============================================================================
// LibraryItem
// =============================================================================

/// Snapshot of one library entity.
///
/// Equality is identity: two items are equal when they carry the same
/// persisted id. Transient items (`id == 0`) are never equal to anything,
/// including themselves, which is why the type is not `Eq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryItem {
    pub id: u64,
    pub title: String,
    pub details: ItemDetails,
}

impl PartialEq for LibraryItem {
    fn eq(&self, other: &Self) -> bool {
        self.id != 0 && other.id != 0 && self.id == other.id
    }
}

impl LibraryItem {
    pub fn new(id: u64, title: impl Into<String>, details: ItemDetails) -> Self {
        Self {
            id,
            title: title.into(),
            details,
        }
    }

    /// Unpersisted media for `mrl`, as handed out before the library knows it.
    pub fn transient_media(mrl: impl Into<String>) -> Self {
        let media = MediaDetails::new(mrl);
        let title = title_from_filename(&media.filename);
        Self::new(0, title, ItemDetails::Media(media))
    }

    pub fn item_type(&self) -> ItemType {
        match &self.details {
            ItemDetails::Media(_) => ItemType::Media,
            ItemDetails::Artist(_) => ItemType::Artist,
            ItemDetails::Genre(_) => ItemType::Genre,
            ItemDetails::Playlist(_) => ItemType::Playlist,
            ItemDetails::MediaGroup(_) => ItemType::MediaGroup,
            ItemDetails::Bookmark(_) => ItemType::Bookmark,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.id == 0
    }

    pub fn as_media(&self) -> Option<&MediaDetails> {
        match &self.details {
            ItemDetails::Media(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_media_mut(&mut self) -> Option<&mut MediaDetails> {
        match &mut self.details {
            ItemDetails::Media(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_playlist(&self) -> Option<&PlaylistDetails> {
        match &self.details {
            ItemDetails::Playlist(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_bookmark(&self) -> Option<&BookmarkDetails> {
        match &self.details {
            ItemDetails::Bookmark(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_container(&self) -> Option<&dyn TrackContainer> {
        match &self.details {
            ItemDetails::Artist(c) | ItemDetails::Genre(c) => Some(c as &dyn TrackContainer),
            ItemDetails::Playlist(p) => Some(p as &dyn TrackContainer),
            ItemDetails::MediaGroup(g) => Some(g as &dyn TrackContainer),
            _ => None,
        }
    }

    pub fn as_resumable(&self) -> Option<&dyn Resumable> {
        self.as_media().map(|m| m as &dyn Resumable)
    }

    /// Counters of a container item, for in-place updates.
    pub(crate) fn counters_mut(&mut self) -> Option<&mut TrackCounters> {
        match &mut self.details {
            ItemDetails::Artist(c) | ItemDetails::Genre(c) => Some(c),
            ItemDetails::Playlist(p) => Some(&mut p.counters),
            ItemDetails::MediaGroup(g) => Some(&mut g.counters),
            _ => None,
        }
    }

    /// Fixed artists every library starts with.
    pub fn reserved_artists() -> [LibraryItem; 2] {
        [
            LibraryItem::new(
                UNKNOWN_ARTIST_ID,
                "Unknown Artist",
                ItemDetails::Artist(TrackCounters::default()),
            ),
            LibraryItem::new(
                VARIOUS_ARTISTS_ID,
                "Various Artists",
                ItemDetails::Artist(TrackCounters::default()),
            ),
        ]
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Entities that group tracks.
pub trait TrackContainer {
    fn tracks_count(&self) -> u32;
    fn present_tracks_count(&self) -> u32;
}

impl TrackContainer for TrackCounters {
    fn tracks_count(&self) -> u32 {
        self.tracks_count
    }

    fn present_tracks_count(&self) -> u32 {
        self.present_tracks_count
    }
}

impl TrackContainer for PlaylistDetails {
    fn tracks_count(&self) -> u32 {
        self.counters.tracks_count
    }

    fn present_tracks_count(&self) -> u32 {
        self.counters.present_tracks_count
    }
}

impl TrackContainer for MediaGroupDetails {
    fn tracks_count(&self) -> u32 {
        self.counters.tracks_count
    }

    fn present_tracks_count(&self) -> u32 {
        self.counters.present_tracks_count
    }
}

/// Entities with a playback resume point.
pub trait Resumable {
    /// Milliseconds
    fn resume_time(&self) -> i64;
    /// Fraction of the duration
    fn resume_position(&self) -> f32;
}

impl Resumable for MediaDetails {
    fn resume_time(&self) -> i64 {
        self.last_time
    }

    fn resume_position(&self) -> f32 {
        self.last_position
    }
}

// =============================================================================
// Registry & aggregates
// =============================================================================

/// Persisted state of an entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPointRecord {
    pub mrl: String,
    pub banned: bool,
    /// Backing device mounted
    pub present: bool,
}

impl EntryPointRecord {
    pub fn new(mrl: impl Into<String>) -> Self {
        Self {
            mrl: mrl.into(),
            banned: false,
            present: true,
        }
    }
}

/// Results of a library-wide search.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchAggregate {
    pub videos: Vec<LibraryItem>,
    pub tracks: Vec<LibraryItem>,
    pub artists: Vec<LibraryItem>,
    pub genres: Vec<LibraryItem>,
    pub playlists: Vec<LibraryItem>,
}

impl SearchAggregate {
    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
            && self.tracks.is_empty()
            && self.artists.is_empty()
            && self.genres.is_empty()
            && self.playlists.is_empty()
    }
}

/// Last segment of an MRL, percent-decoded.
pub fn filename_of(mrl: &str) -> String {
    let raw = mrl.trim_end_matches('/').rsplit('/').next().unwrap_or(mrl);
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Display title derived from a file name: the extension is dropped.
pub fn title_from_filename(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => filename.to_string(),
    }
}
