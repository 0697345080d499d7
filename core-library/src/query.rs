//! Read-side query API over the entity store.
//!
//! Every listing takes [`QueryParams`] (sort key, direction, whether to
//! include missing media) and comes in three shapes: a full listing, a
//! [`Page`] and a count. Search variants additionally filter on a
//! case-insensitive substring of the title.

use crate::error::{LibraryError, Result};
use crate::models::{ItemType, LibraryItem, MediaType, SearchAggregate};
use crate::pagination::{Page, PageRequest};
use crate::store::EntityStore;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Sort keys, with the integer codes hosts use to select them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SortKey {
    #[default]
    Default,
    Alpha,
    Duration,
    InsertionDate,
    LastModificationDate,
    ReleaseDate,
    FileSize,
    Artist,
    PlayCount,
    Filename,
    TrackNumber,
    TrackId,
}

impl SortKey {
    pub fn code(self) -> i32 {
        match self {
            SortKey::Default => 0,
            SortKey::Alpha => 1,
            SortKey::Duration => 2,
            SortKey::InsertionDate => 3,
            SortKey::LastModificationDate => 4,
            SortKey::ReleaseDate => 5,
            SortKey::FileSize => 6,
            SortKey::Artist => 7,
            SortKey::PlayCount => 8,
            SortKey::Filename => 10,
            SortKey::TrackNumber => 11,
            SortKey::TrackId => 12,
        }
    }
}

impl TryFrom<i32> for SortKey {
    type Error = LibraryError;

    fn try_from(code: i32) -> Result<Self> {
        let key = match code {
            0 => SortKey::Default,
            1 => SortKey::Alpha,
            2 => SortKey::Duration,
            3 => SortKey::InsertionDate,
            4 => SortKey::LastModificationDate,
            5 => SortKey::ReleaseDate,
            6 => SortKey::FileSize,
            7 => SortKey::Artist,
            8 => SortKey::PlayCount,
            10 => SortKey::Filename,
            11 => SortKey::TrackNumber,
            12 => SortKey::TrackId,
            other => {
                return Err(LibraryError::invalid(
                    "sort",
                    format!("unknown sort code {}", other),
                ))
            }
        };
        Ok(key)
    }
}

/// Options shared by every listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryParams {
    pub sort: SortKey,
    pub descending: bool,
    /// Include media whose file is not reachable, and containers without any
    /// reachable track.
    pub include_missing: bool,
}

impl QueryParams {
    pub fn sorted(sort: SortKey) -> Self {
        Self {
            sort,
            ..Default::default()
        }
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn with_missing(mut self) -> Self {
        self.include_missing = true;
        self
    }
}

/// Which collection to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listing {
    Audio,
    Video,
    Artists,
    Genres,
    Playlists,
    MediaGroups,
    ArtistTracks(u64),
    GenreTracks(u64),
    PlaylistTracks(u64),
    /// Played media, most recent first.
    History,
    /// Bookmarks of one media, by time.
    Bookmarks(u64),
}

impl Listing {
    /// Listings with a meaningful order of their own, kept for `SortKey::Default`.
    fn has_natural_order(&self) -> bool {
        matches!(
            self,
            Listing::PlaylistTracks(_) | Listing::History | Listing::Bookmarks(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortValue {
    Int(i64),
    Text(String),
}

fn sort_value(
    key: SortKey,
    item: &LibraryItem,
    items: &BTreeMap<u64, LibraryItem>,
) -> Option<SortValue> {
    let media = item.as_media();
    let positive = |v: i64| (v > 0).then_some(SortValue::Int(v));
    match key {
        SortKey::Default | SortKey::Alpha => Some(SortValue::Text(item.title.to_lowercase())),
        SortKey::TrackId => Some(SortValue::Int(item.id as i64)),
        SortKey::Duration => media.and_then(|m| positive(m.duration_ms)),
        SortKey::InsertionDate => media.and_then(|m| positive(m.insertion_date)),
        SortKey::LastModificationDate => media.and_then(|m| positive(m.modification_date)),
        SortKey::ReleaseDate => media.and_then(|m| m.release_year.map(|y| SortValue::Int(y.into()))),
        SortKey::FileSize => media.and_then(|m| positive(m.file_size as i64)),
        SortKey::PlayCount => media.map(|m| SortValue::Int(m.play_count.into())),
        SortKey::TrackNumber => {
            media.and_then(|m| m.track_number.map(|n| SortValue::Int(n.into())))
        }
        SortKey::Filename => media.map(|m| SortValue::Text(m.filename.to_lowercase())),
        SortKey::Artist => media
            .and_then(|m| m.artist_id)
            .and_then(|id| items.get(&id))
            .map(|artist| SortValue::Text(artist.title.to_lowercase())),
    }
}

/// Ascending order: set values first, then unset ones, ties broken by id.
fn compare(a: &(Option<SortValue>, u64), b: &(Option<SortValue>, u64)) -> Ordering {
    let by_value = match (&a.0, &b.0) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_value.then(a.1.cmp(&b.1))
}

fn title_matches(item: &LibraryItem, needle: &str) -> bool {
    item.title.to_lowercase().contains(needle)
}

/// Sorted, paged and searched views over an [`EntityStore`].
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<EntityStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self { store }
    }

    // ------------------------------------------------------------------------
    // Generic listings
    // ------------------------------------------------------------------------

    pub fn list(&self, listing: Listing, params: &QueryParams) -> Vec<LibraryItem> {
        self.collect(listing, params, None)
    }

    pub fn list_page(
        &self,
        listing: Listing,
        params: &QueryParams,
        page: PageRequest,
    ) -> Page<LibraryItem> {
        Page::from_listing(&self.list(listing, params), page)
    }

    pub fn count(&self, listing: Listing, params: &QueryParams) -> u64 {
        self.list(listing, params).len() as u64
    }

    /// Items of `listing` whose title contains `query`, ignoring case.
    /// A blank query matches nothing.
    pub fn search_in(&self, listing: Listing, query: &str, params: &QueryParams) -> Vec<LibraryItem> {
        self.collect(listing, params, Some(query))
    }

    pub fn search_page(
        &self,
        listing: Listing,
        query: &str,
        params: &QueryParams,
        page: PageRequest,
    ) -> Page<LibraryItem> {
        Page::from_listing(&self.search_in(listing, query, params), page)
    }

    pub fn search_count(&self, listing: Listing, query: &str, params: &QueryParams) -> u64 {
        self.search_in(listing, query, params).len() as u64
    }

    /// Search every top-level collection at once.
    pub fn search(&self, query: &str, params: &QueryParams) -> SearchAggregate {
        SearchAggregate {
            videos: self.search_in(Listing::Video, query, params),
            tracks: self.search_in(Listing::Audio, query, params),
            artists: self.search_in(Listing::Artists, query, params),
            genres: self.search_in(Listing::Genres, query, params),
            playlists: self.search_in(Listing::Playlists, query, params),
        }
    }

    // ------------------------------------------------------------------------
    // Convenience wrappers
    // ------------------------------------------------------------------------

    pub fn audio(&self, params: &QueryParams) -> Vec<LibraryItem> {
        self.list(Listing::Audio, params)
    }

    pub fn videos(&self, params: &QueryParams) -> Vec<LibraryItem> {
        self.list(Listing::Video, params)
    }

    pub fn artists(&self, params: &QueryParams) -> Vec<LibraryItem> {
        self.list(Listing::Artists, params)
    }

    pub fn genres(&self, params: &QueryParams) -> Vec<LibraryItem> {
        self.list(Listing::Genres, params)
    }

    pub fn playlists(&self, params: &QueryParams) -> Vec<LibraryItem> {
        self.list(Listing::Playlists, params)
    }

    pub fn media_groups(&self, params: &QueryParams) -> Vec<LibraryItem> {
        self.list(Listing::MediaGroups, params)
    }

    pub fn artist_tracks(&self, artist_id: u64, params: &QueryParams) -> Vec<LibraryItem> {
        self.list(Listing::ArtistTracks(artist_id), params)
    }

    pub fn genre_tracks(&self, genre_id: u64, params: &QueryParams) -> Vec<LibraryItem> {
        self.list(Listing::GenreTracks(genre_id), params)
    }

    pub fn playlist_tracks(&self, playlist_id: u64, params: &QueryParams) -> Vec<LibraryItem> {
        self.list(Listing::PlaylistTracks(playlist_id), params)
    }

    /// Played media, most recent first. Missing media are kept.
    pub fn history(&self) -> Vec<LibraryItem> {
        self.list(Listing::History, &QueryParams::default().with_missing())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn collect(&self, listing: Listing, params: &QueryParams, query: Option<&str>) -> Vec<LibraryItem> {
        let needle = match query.map(|q| q.trim().to_lowercase()) {
            Some(q) if q.is_empty() => return Vec::new(),
            other => other,
        };

        self.store
            .with_items(|items| {
                let mut selected = Self::select(listing, params, items);
                if let Some(needle) = &needle {
                    selected.retain(|item| title_matches(item, needle));
                }
                Self::order(listing, params, selected, items)
            })
            .unwrap_or_default()
    }

    fn select(
        listing: Listing,
        params: &QueryParams,
        items: &BTreeMap<u64, LibraryItem>,
    ) -> Vec<LibraryItem> {
        let visible_media = |item: &LibraryItem, pred: &dyn Fn(&LibraryItem) -> bool| {
            item.as_media()
                .is_some_and(|m| params.include_missing || m.is_present)
                && pred(item)
        };
        let visible_container = |item: &LibraryItem, ty: ItemType| {
            item.item_type() == ty
                && (params.include_missing
                    || item
                        .as_container()
                        .is_some_and(|c| c.present_tracks_count() > 0))
        };
        let of_type = |ty: MediaType| {
            move |item: &LibraryItem| item.as_media().is_some_and(|m| m.media_type == ty)
        };
        let filtered = |pred: &dyn Fn(&LibraryItem) -> bool| {
            items.values().filter(|i| pred(i)).cloned().collect::<Vec<_>>()
        };

        match listing {
            Listing::Audio => filtered(&|i| visible_media(i, &of_type(MediaType::Audio))),
            Listing::Video => filtered(&|i| visible_media(i, &of_type(MediaType::Video))),
            Listing::Artists => filtered(&|i| visible_container(i, ItemType::Artist)),
            Listing::Genres => filtered(&|i| visible_container(i, ItemType::Genre)),
            Listing::Playlists => filtered(&|i| i.item_type() == ItemType::Playlist),
            Listing::MediaGroups => filtered(&|i| i.item_type() == ItemType::MediaGroup),
            Listing::ArtistTracks(id) => filtered(&|i| {
                visible_media(i, &|i| i.as_media().is_some_and(|m| m.artist_id == Some(id)))
            }),
            Listing::GenreTracks(id) => filtered(&|i| {
                visible_media(i, &|i| i.as_media().is_some_and(|m| m.genre_id == Some(id)))
            }),
            Listing::PlaylistTracks(id) => items
                .get(&id)
                .and_then(LibraryItem::as_playlist)
                .map(|playlist| {
                    playlist
                        .entries
                        .iter()
                        .filter_map(|entry| entry.media_id.and_then(|m| items.get(&m)))
                        .filter(|item| visible_media(item, &|_| true))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            Listing::History => {
                let mut played: Vec<LibraryItem> = filtered(&|i| {
                    i.as_media().is_some_and(|m| m.last_played_at.is_some())
                });
                played.sort_by(|a, b| {
                    let at = |i: &LibraryItem| i.as_media().and_then(|m| m.last_played_at);
                    at(b).cmp(&at(a)).then(b.id.cmp(&a.id))
                });
                played
            }
            Listing::Bookmarks(media_id) => {
                let mut marks =
                    filtered(&|i| i.as_bookmark().is_some_and(|b| b.media_id == media_id));
                marks.sort_by_key(|i| (i.as_bookmark().map(|b| b.time), i.id));
                marks
            }
        }
    }

    fn order(
        listing: Listing,
        params: &QueryParams,
        selected: Vec<LibraryItem>,
        items: &BTreeMap<u64, LibraryItem>,
    ) -> Vec<LibraryItem> {
        if params.sort == SortKey::Default && listing.has_natural_order() {
            let mut natural = selected;
            if params.descending {
                natural.reverse();
            }
            return natural;
        }

        let mut keyed: Vec<((Option<SortValue>, u64), LibraryItem)> = selected
            .into_iter()
            .map(|item| ((sort_value(params.sort, &item, items), item.id), item))
            .collect();
        keyed.sort_by(|a, b| {
            let ascending = compare(&a.0, &b.0);
            if params.descending {
                ascending.reverse()
            } else {
                ascending
            }
        });
        keyed.into_iter().map(|(_, item)| item).collect()
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine").finish_non_exhaustive()
    }
}
