//! # Entity Store
//!
//! Owns every library entity, keyed by a stable `u64` id.
//!
//! The working set lives in memory behind a single `RwLock`; every mutation
//! writes through to the SQLite [`Database`]. Change events are collected
//! while the lock is held and delivered through the [`ChangeNotifier`] once it
//! has been released, so listeners may call back into the store.
//!
//! While the store is not initialized every accessor returns a neutral value
//! (`None`, empty, `false`, [`PlaybackResult::Error`]) instead of failing.

use crate::db::{classify_open_error, Database, OpenFailure, SCHEMA_VERSION};
use crate::error::{LibraryError, Result};
use crate::models::{
    filename_of, title_from_filename, BookmarkDetails, EntryPointRecord, InitResult, ItemDetails,
    ItemType, LibraryItem, MediaDetails, MediaFlags, MediaGroupDetails, MediaType,
    PlaybackResult, PlaylistDetails, PlaylistEntry, TrackCounters, FIRST_FREE_ID,
    UNKNOWN_ARTIST_ID,
};
use bridge_traits::mrl::{encode_mrl, is_content_uri, is_under};
use bridge_traits::scanner::{DiscoveredFile, ParsedMedia};
use bridge_traits::time::{Clock, SystemClock};
use core_runtime::config::PlaybackThresholds;
use core_runtime::events::{ChangeEvent, ChangeKind, ChangeNotifier, EntityKind};
use core_runtime::logging::strip_path;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

fn entity_kind(ty: ItemType) -> EntityKind {
    match ty {
        ItemType::Media => EntityKind::Media,
        ItemType::Artist => EntityKind::Artist,
        ItemType::Genre => EntityKind::Genre,
        ItemType::Playlist => EntityKind::Playlist,
        ItemType::MediaGroup => EntityKind::MediaGroup,
        ItemType::Bookmark => EntityKind::Bookmark,
    }
}

/// Side effects gathered under the lock, delivered after it is released.
#[derive(Default)]
struct Effects {
    events: Vec<ChangeEvent>,
    history: Vec<u64>,
    failures: Vec<(String, String)>,
}

impl Effects {
    fn record(&mut self, entity: EntityKind, kind: ChangeKind, id: u64) {
        match self
            .events
            .iter_mut()
            .find(|e| e.entity == entity && e.kind == kind)
        {
            Some(event) if event.ids.contains(&id) => {}
            Some(event) => event.ids.push(id),
            None => self.events.push(ChangeEvent::new(entity, kind, vec![id])),
        }
    }

    fn fail(&mut self, context: &str, err: LibraryError) {
        warn!(context, error = %err, "Persistence failure");
        self.failures.push((context.to_string(), err.to_string()));
    }
}

/// Result of loading a database file.
struct Loaded {
    db: Database,
    items: Vec<LibraryItem>,
    entry_points: Vec<EntryPointRecord>,
    next_id: u64,
}

#[derive(Default)]
struct StoreState {
    path: Option<PathBuf>,
    db: Option<Database>,
    items: BTreeMap<u64, LibraryItem>,
    by_mrl: HashMap<String, u64>,
    /// Artists and genres by lowercased title.
    by_title: HashMap<(ItemType, String), u64>,
    /// Media of each artist and genre.
    members: HashMap<u64, BTreeSet<u64>>,
    /// Playlists and media groups.
    collections: BTreeSet<u64>,
    entry_points: BTreeMap<String, EntryPointRecord>,
    next_id: u64,
}

impl StoreState {
    fn is_initialized(&self) -> bool {
        self.db.is_some()
    }

    fn install(&mut self, loaded: Loaded) {
        self.items.clear();
        self.by_mrl.clear();
        self.by_title.clear();
        self.members.clear();
        self.collections.clear();
        for item in loaded.items {
            self.index(&item);
            self.items.insert(item.id, item);
        }
        self.entry_points = loaded
            .entry_points
            .into_iter()
            .map(|ep| (ep.mrl.clone(), ep))
            .collect();
        let max_id = self.items.keys().next_back().copied().unwrap_or(0);
        self.next_id = loaded.next_id.max(max_id + 1).max(FIRST_FREE_ID);
        self.db = Some(loaded.db);
    }

    fn media(&self, id: u64) -> Option<&MediaDetails> {
        self.items.get(&id).and_then(LibraryItem::as_media)
    }

    fn media_mut(&mut self, id: u64) -> Option<&mut MediaDetails> {
        self.items.get_mut(&id).and_then(LibraryItem::as_media_mut)
    }

    fn kind_of(&self, id: u64) -> Option<ItemType> {
        self.items.get(&id).map(LibraryItem::item_type)
    }

    fn alloc_id(&mut self, fx: &mut Effects) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if let Some(db) = &self.db {
            if let Err(err) = db.save_next_id(self.next_id) {
                fx.fail("save id sequence", err);
            }
        }
        id
    }

    fn index(&mut self, item: &LibraryItem) {
        match &item.details {
            ItemDetails::Media(media) => {
                self.by_mrl.insert(media.mrl.clone(), item.id);
                for container in [media.artist_id, media.genre_id].into_iter().flatten() {
                    self.members.entry(container).or_default().insert(item.id);
                }
            }
            ItemDetails::Artist(_) | ItemDetails::Genre(_) => {
                self.by_title
                    .insert((item.item_type(), item.title.to_lowercase()), item.id);
            }
            ItemDetails::Playlist(_) | ItemDetails::MediaGroup(_) => {
                self.collections.insert(item.id);
            }
            _ => {}
        }
    }

    /// Remove an item from the map and every index.
    fn remove_item(&mut self, id: u64) -> Option<LibraryItem> {
        let item = self.items.remove(&id)?;
        match &item.details {
            ItemDetails::Media(media) => {
                self.by_mrl.remove(&media.mrl);
                for container in [media.artist_id, media.genre_id].into_iter().flatten() {
                    if let Some(members) = self.members.get_mut(&container) {
                        members.remove(&id);
                    }
                }
            }
            ItemDetails::Artist(_) | ItemDetails::Genre(_) => {
                self.by_title
                    .remove(&(item.item_type(), item.title.to_lowercase()));
                self.members.remove(&id);
            }
            ItemDetails::Playlist(_) | ItemDetails::MediaGroup(_) => {
                self.collections.remove(&id);
            }
            _ => {}
        }
        Some(item)
    }

    /// Move `media_id` between artist/genre member sets.
    fn relink_members(&mut self, media_id: u64, before: &[u64], after: &[u64]) {
        for container in before.iter().filter(|c| !after.contains(c)) {
            if let Some(members) = self.members.get_mut(container) {
                members.remove(&media_id);
            }
        }
        for container in after {
            self.members.entry(*container).or_default().insert(media_id);
        }
    }

    fn insert(&mut self, item: LibraryItem, fx: &mut Effects) -> u64 {
        let id = item.id;
        self.index(&item);
        fx.record(entity_kind(item.item_type()), ChangeKind::Added, id);
        self.items.insert(id, item);
        self.persist(&[id], fx);
        id
    }

    fn touch(&mut self, id: u64, fx: &mut Effects) {
        if let Some(ty) = self.kind_of(id) {
            fx.record(entity_kind(ty), ChangeKind::Modified, id);
            self.persist(&[id], fx);
        }
    }

    fn persist(&self, ids: &[u64], fx: &mut Effects) {
        let Some(db) = &self.db else {
            return;
        };
        let items = ids.iter().filter_map(|id| self.items.get(id));
        if let Err(err) = db.save_items(items) {
            fx.fail("save items", err);
        }
    }

    fn persist_entry_point(&self, mrl: &str, fx: &mut Effects) {
        let Some(db) = &self.db else {
            return;
        };
        let outcome = match self.entry_points.get(mrl) {
            Some(record) => db.save_entry_point(record),
            None => db.delete_entry_point(mrl),
        };
        if let Err(err) = outcome {
            fx.fail("save entry point", err);
        }
    }

    fn find_by_title(&self, ty: ItemType, title: &str) -> Option<u64> {
        self.by_title.get(&(ty, title.to_lowercase())).copied()
    }

    fn find_or_create(&mut self, ty: ItemType, title: &str, fx: &mut Effects) -> u64 {
        if let Some(id) = self.find_by_title(ty, title) {
            return id;
        }
        let id = self.alloc_id(fx);
        let details = match ty {
            ItemType::Genre => ItemDetails::Genre(TrackCounters::default()),
            _ => ItemDetails::Artist(TrackCounters::default()),
        };
        self.insert(LibraryItem::new(id, title, details), fx)
    }

    /// Point playlist entries for `mrl` back at `media_id`.
    fn relink_playlists(&mut self, mrl: &str, media_id: u64, fx: &mut Effects) -> Vec<u64> {
        let mut touched = Vec::new();
        for id in &self.collections {
            let Some(ItemDetails::Playlist(playlist)) =
                self.items.get_mut(id).map(|item| &mut item.details)
            else {
                continue;
            };
            let mut changed = false;
            for entry in playlist.entries.iter_mut() {
                if entry.media_id.is_none() && entry.mrl == mrl {
                    entry.media_id = Some(media_id);
                    changed = true;
                }
            }
            if changed {
                touched.push(*id);
            }
        }
        for id in &touched {
            self.touch(*id, fx);
        }
        touched
    }

    fn compute_counters(&self, id: u64) -> Option<TrackCounters> {
        let item = self.items.get(&id)?;
        let count = |ids: &mut dyn Iterator<Item = Option<u64>>| {
            let mut total = 0u32;
            let mut present = 0u32;
            for media_id in ids {
                total += 1;
                if media_id
                    .and_then(|m| self.media(m))
                    .is_some_and(|m| m.is_present)
                {
                    present += 1;
                }
            }
            TrackCounters::new(total, present)
        };
        let counters = match &item.details {
            ItemDetails::Artist(_) | ItemDetails::Genre(_) => count(
                &mut self
                    .members
                    .get(&id)
                    .into_iter()
                    .flatten()
                    .map(|m| Some(*m)),
            ),
            ItemDetails::Playlist(p) => count(&mut p.entries.iter().map(|e| e.media_id)),
            ItemDetails::MediaGroup(g) => count(&mut g.media_ids.iter().map(|m| Some(*m))),
            _ => return None,
        };
        Some(counters)
    }

    /// Recompute the counters of every container affected by a change of
    /// `media_ids`, plus the explicitly listed `containers`.
    fn refresh_counters(&mut self, media_ids: &[u64], containers: &[u64], fx: &mut Effects) {
        let mut affected: BTreeSet<u64> = containers.iter().copied().collect();
        for id in media_ids {
            if let Some(media) = self.media(*id) {
                affected.extend(media.artist_id);
                affected.extend(media.genre_id);
            }
        }
        for item in self.collections.iter().filter_map(|id| self.items.get(id)) {
            let contains = match &item.details {
                ItemDetails::Playlist(p) => p
                    .entries
                    .iter()
                    .any(|e| e.media_id.is_some_and(|m| media_ids.contains(&m))),
                ItemDetails::MediaGroup(g) => g.media_ids.iter().any(|m| media_ids.contains(m)),
                _ => false,
            };
            if contains {
                affected.insert(item.id);
            }
        }

        for id in affected {
            let Some(fresh) = self.compute_counters(id) else {
                continue;
            };
            let changed = self
                .items
                .get_mut(&id)
                .and_then(LibraryItem::counters_mut)
                .map(|current| {
                    let changed = *current != fresh;
                    *current = fresh;
                    changed
                })
                .unwrap_or(false);
            if changed {
                self.touch(id, fx);
            }
        }
    }

    /// Delete media and everything hanging off them.
    fn delete_media(&mut self, ids: &[u64], fx: &mut Effects) {
        let mut containers = Vec::new();
        let mut removed = Vec::new();
        for id in ids {
            let Some(item) = self.remove_item(*id) else {
                continue;
            };
            if let Some(media) = item.as_media() {
                containers.extend(media.artist_id);
                containers.extend(media.genre_id);
            }
            fx.record(EntityKind::Media, ChangeKind::Deleted, *id);
            removed.push(*id);
        }
        if removed.is_empty() {
            return;
        }

        let bookmarks: Vec<u64> = self
            .items
            .values()
            .filter(|item| item.as_bookmark().is_some_and(|b| removed.contains(&b.media_id)))
            .map(|item| item.id)
            .collect();
        for id in &bookmarks {
            self.remove_item(*id);
            fx.record(EntityKind::Bookmark, ChangeKind::Deleted, *id);
        }

        for id in &self.collections {
            let Some(item) = self.items.get_mut(id) else {
                continue;
            };
            match &mut item.details {
                ItemDetails::Playlist(p) => {
                    let mut hit = false;
                    for entry in p.entries.iter_mut() {
                        if entry.media_id.is_some_and(|m| removed.contains(&m)) {
                            entry.media_id = None;
                            hit = true;
                        }
                    }
                    if hit {
                        containers.push(item.id);
                    }
                }
                ItemDetails::MediaGroup(g) => {
                    let before = g.media_ids.len();
                    g.media_ids.retain(|m| !removed.contains(m));
                    if g.media_ids.len() != before {
                        containers.push(item.id);
                    }
                }
                _ => {}
            }
        }

        if let Some(db) = &self.db {
            let mut doomed = removed.clone();
            doomed.extend(&bookmarks);
            if let Err(err) = db.delete_items(&doomed) {
                fx.fail("delete items", err);
            }
        }
        // Link changes may leave counters untouched; persist them anyway.
        for id in &containers {
            if matches!(
                self.kind_of(*id),
                Some(ItemType::Playlist | ItemType::MediaGroup)
            ) {
                self.touch(*id, fx);
            }
        }
        self.refresh_counters(&[], &containers, fx);
    }
}

/// The durable id → entity mapping.
pub struct EntityStore {
    state: RwLock<StoreState>,
    notifier: Arc<ChangeNotifier>,
    clock: Arc<dyn Clock>,
    thresholds: PlaybackThresholds,
}

impl EntityStore {
    pub fn new(notifier: Arc<ChangeNotifier>, thresholds: PlaybackThresholds) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            notifier,
            clock: Arc::new(SystemClock),
            thresholds,
        }
    }

    /// Replace the time source used for insertion and playback dates.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open or create the database at `db_path` and load it.
    #[instrument(skip(self), fields(path = %db_path.display()))]
    pub fn open(&self, db_path: &Path) -> InitResult {
        let mut state = self.state.write();
        if state.is_initialized() {
            return InitResult::AlreadyInitialized;
        }
        state.path = Some(db_path.to_path_buf());

        match Self::bootstrap(db_path) {
            Ok((loaded, result)) => {
                state.install(loaded);
                info!(?result, items = state.items.len(), "Store initialized");
                result
            }
            Err(result) => {
                warn!(?result, "Store initialization failed");
                result
            }
        }
    }

    fn bootstrap(path: &Path) -> std::result::Result<(Loaded, InitResult), InitResult> {
        let fatal = |err: LibraryError| match classify_open_error(&err) {
            OpenFailure::NotADatabase | OpenFailure::Corrupt => InitResult::DbUnrecoverable,
            OpenFailure::Io => InitResult::Failed,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(error = %err, "Cannot create database directory");
                return Err(InitResult::Failed);
            }
        }

        let db = Database::open(path).map_err(fatal)?;
        let version = db.user_version().map_err(fatal)?;

        if version == 0 {
            db.recreate_schema().map_err(fatal)?;
            return Self::load_clean(db).map(|l| (l, InitResult::Success)).map_err(fatal);
        }

        if version != SCHEMA_VERSION {
            info!(found = version, expected = SCHEMA_VERSION, "Schema mismatch, resetting");
            db.recreate_schema().map_err(fatal)?;
            return Self::load_clean(db).map(|l| (l, InitResult::DbReset)).map_err(fatal);
        }

        let healthy = db.integrity_ok().unwrap_or(false);
        let rows = db.load_rows().unwrap_or_default();
        let decoded: Vec<Result<LibraryItem>> = rows.iter().map(|row| row.decode()).collect();

        if healthy && decoded.iter().all(|r| r.is_ok()) {
            let items = decoded.into_iter().filter_map(|r| r.ok()).collect();
            let entry_points = db.load_entry_points().map_err(fatal)?;
            let next_id = db.load_next_id().map_err(fatal)?.unwrap_or(FIRST_FREE_ID);
            return Ok((
                Loaded {
                    db,
                    items,
                    entry_points,
                    next_id,
                },
                InitResult::Success,
            ));
        }

        // Salvage playlists, drop everything else.
        let max_row_id = rows.iter().map(|r| r.id).max().unwrap_or(0).max(0) as u64;
        let next_id = db
            .load_next_id()
            .ok()
            .flatten()
            .unwrap_or(FIRST_FREE_ID)
            .max(max_row_id + 1);
        let playlists: Vec<LibraryItem> = decoded
            .into_iter()
            .filter_map(|r| r.ok())
            .filter(|item| item.item_type() == ItemType::Playlist)
            .map(|mut item| {
                if let ItemDetails::Playlist(p) = &mut item.details {
                    for entry in p.entries.iter_mut() {
                        entry.media_id = None;
                    }
                    p.counters = TrackCounters::new(p.entries.len() as u32, 0);
                }
                item
            })
            .collect();
        warn!(
            salvaged = playlists.len(),
            discarded = rows.len().saturating_sub(playlists.len()),
            "Database corrupted, salvaging playlists"
        );

        db.recreate_schema().map_err(fatal)?;
        db.save_items(playlists.iter()).map_err(fatal)?;
        db.save_next_id(next_id).map_err(fatal)?;

        let mut loaded = Self::load_clean(db).map_err(fatal)?;
        loaded.next_id = loaded.next_id.max(next_id);
        Ok((loaded, InitResult::DbCorrupted))
    }

    fn load_clean(db: Database) -> Result<Loaded> {
        let items = db
            .load_rows()?
            .iter()
            .map(|row| row.decode())
            .collect::<Result<Vec<_>>>()?;
        let entry_points = db.load_entry_points()?;
        let next_id = db.load_next_id()?.unwrap_or(FIRST_FREE_ID);
        Ok(Loaded {
            db,
            items,
            entry_points,
            next_id,
        })
    }

    /// Drop the in-memory state and the database handle.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.db.take().is_some() {
            debug!("Store closed");
        }
        state.items.clear();
        state.by_mrl.clear();
        state.by_title.clear();
        state.members.clear();
        state.collections.clear();
        state.entry_points.clear();
    }

    /// Delete the database file and start over with an empty library.
    pub fn reset(&self) -> InitResult {
        let path = self.state.read().path.clone();
        let Some(path) = path else {
            return InitResult::Failed;
        };
        self.close();
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            let file = PathBuf::from(file);
            if file.exists() {
                if let Err(err) = fs::remove_file(&file) {
                    warn!(error = %err, file = %file.display(), "Cannot remove database file");
                    return InitResult::Failed;
                }
            }
        }
        self.open(&path)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_initialized()
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn get(&self, id: u64) -> Option<LibraryItem> {
        if id == 0 {
            return None;
        }
        let state = self.state.read();
        if !state.is_initialized() {
            return None;
        }
        state.items.get(&id).cloned()
    }

    pub fn get_media(&self, id: u64) -> Option<LibraryItem> {
        self.get(id).filter(|item| item.item_type() == ItemType::Media)
    }

    /// Look a media up by path or MRL.
    ///
    /// `content:` URIs can only be resolved by the platform that issued them
    /// and always yield `None`.
    pub fn media_by_mrl(&self, uri: &str) -> Option<LibraryItem> {
        if is_content_uri(uri) {
            return None;
        }
        let mrl = encode_mrl(uri)?;
        let state = self.state.read();
        if !state.is_initialized() {
            return None;
        }
        state
            .by_mrl
            .get(&mrl)
            .and_then(|id| state.items.get(id))
            .cloned()
    }

    /// Run `f` over the current items, or return `None` when not initialized.
    pub(crate) fn with_items<R>(&self, f: impl FnOnce(&BTreeMap<u64, LibraryItem>) -> R) -> Option<R> {
        let state = self.state.read();
        if !state.is_initialized() {
            return None;
        }
        Some(f(&state.items))
    }

    // ------------------------------------------------------------------------
    // Mutation plumbing
    // ------------------------------------------------------------------------

    /// Run `f` under the write lock, then deliver its effects.
    fn mutate<R>(&self, neutral: R, f: impl FnOnce(&mut StoreState, &mut Effects) -> R) -> R {
        let mut fx = Effects::default();
        let result = {
            let mut state = self.state.write();
            if !state.is_initialized() {
                return neutral;
            }
            f(&mut *state, &mut fx)
        };
        self.deliver(fx);
        result
    }

    fn deliver(&self, fx: Effects) {
        for (context, message) in fx.failures {
            self.notifier.report_exception(&context, &message, false);
        }
        for event in fx.events {
            self.notifier.notify_change(event);
        }
        for media_id in fx.history {
            self.notifier.notify_history_changed(media_id);
        }
    }

    // ------------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------------

    /// Add an external media.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before `open`, `InvalidInput` for an empty or
    /// `content:` URI, `Conflict` when the MRL is already known.
    pub fn add_media(&self, uri: &str, duration_ms: i64) -> Result<LibraryItem> {
        if is_content_uri(uri) {
            return Err(LibraryError::invalid("uri", "content URIs cannot be indexed"));
        }
        let mrl = encode_mrl(uri).ok_or_else(|| LibraryError::invalid("uri", "empty"))?;
        let now = self.clock.unix_timestamp();

        self.mutate(Err(LibraryError::NotInitialized), |state, fx| {
            if state.by_mrl.contains_key(&mrl) {
                return Err(LibraryError::Conflict(mrl.clone()));
            }
            let id = state.alloc_id(fx);
            let mut media = MediaDetails::new(mrl.clone());
            media.duration_ms = duration_ms;
            media.flags = MediaFlags::EXTERNAL;
            media.insertion_date = now;
            let title = title_from_filename(&media.filename);
            state.insert(LibraryItem::new(id, title, ItemDetails::Media(media)), fx);
            let playlists = state.relink_playlists(&mrl, id, fx);
            state.refresh_counters(&[id], &playlists, fx);
            debug!(id, mrl = %strip_path(&mrl), "External media added");
            state
                .items
                .get(&id)
                .cloned()
                .ok_or(LibraryError::NotInitialized)
        })
    }

    /// Remove an external media. Discovered media are owned by discovery and
    /// cannot be removed this way.
    pub fn remove_external_media(&self, id: u64) -> bool {
        self.mutate(false, |state, fx| {
            if !state.media(id).is_some_and(MediaDetails::is_external) {
                return false;
            }
            state.delete_media(&[id], fx);
            true
        })
    }

    /// Record a playback time (milliseconds) for a media.
    pub fn set_playback_time(&self, id: u64, time: u64) -> PlaybackResult {
        if id == 0 || time < 1 {
            return PlaybackResult::Error;
        }
        let thresholds = self.thresholds;
        let now = self.clock.unix_timestamp();

        self.mutate(PlaybackResult::Error, |state, fx| {
            let Some(media) = state.media_mut(id) else {
                return PlaybackResult::Error;
            };
            let stored = i64::try_from(time).unwrap_or(i64::MAX);
            let outcome = if media.duration_ms <= 0 {
                media.last_time = stored;
                PlaybackResult::AsIs
            } else {
                let duration = media.duration_ms as f64;
                let time = time as f64;
                if time < duration * thresholds.begin_ratio {
                    media.last_time = 0;
                    media.last_position = 0.0;
                    PlaybackResult::Begin
                } else if time > duration * thresholds.end_ratio {
                    media.last_time = 0;
                    media.last_position = 0.0;
                    media.play_count = media.play_count.saturating_add(1);
                    PlaybackResult::End
                } else {
                    media.last_time = stored;
                    media.last_position = (time / duration) as f32;
                    PlaybackResult::AsIs
                }
            };
            media.last_played_at = Some(now);
            state.touch(id, fx);
            fx.history.push(id);
            outcome
        })
    }

    /// Record the resume point as a fraction of the duration.
    pub fn set_playback_position(&self, id: u64, position: f32) -> bool {
        if id == 0 || !position.is_finite() {
            return false;
        }
        self.mutate(false, |state, fx| {
            let Some(media) = state.media_mut(id) else {
                return false;
            };
            let position = position.clamp(0.0, 1.0);
            media.last_position = position;
            if media.duration_ms > 0 {
                media.last_time = (media.duration_ms as f64 * position as f64) as i64;
            }
            state.touch(id, fx);
            true
        })
    }

    pub fn set_favorite(&self, id: u64, favorite: bool) -> bool {
        self.mutate(false, |state, fx| {
            let Some(media) = state.media_mut(id) else {
                return false;
            };
            if media.is_favorite() == favorite {
                return true;
            }
            media.flags.set(MediaFlags::FAVORITE, favorite);
            state.touch(id, fx);
            true
        })
    }

    /// Forget when every media was last played.
    pub fn clear_history(&self) -> bool {
        self.mutate(false, |state, fx| {
            let played: Vec<u64> = state
                .items
                .values()
                .filter(|item| item.as_media().is_some_and(|m| m.last_played_at.is_some()))
                .map(|item| item.id)
                .collect();
            for id in &played {
                if let Some(media) = state.media_mut(*id) {
                    media.last_played_at = None;
                }
                state.touch(*id, fx);
                fx.history.push(*id);
            }
            true
        })
    }

    // ------------------------------------------------------------------------
    // Bookmarks
    // ------------------------------------------------------------------------

    /// Bookmark `time` (milliseconds) in a media. One bookmark per time.
    pub fn add_bookmark(&self, media_id: u64, time: i64) -> Option<LibraryItem> {
        if time < 0 {
            return None;
        }
        self.mutate(None, |state, fx| {
            state.media(media_id)?;
            let taken = state.items.values().any(|item| {
                item.as_bookmark()
                    .is_some_and(|b| b.media_id == media_id && b.time == time)
            });
            if taken {
                return None;
            }
            let id = state.alloc_id(fx);
            let details = ItemDetails::Bookmark(BookmarkDetails {
                media_id,
                time,
                description: String::new(),
            });
            state.insert(LibraryItem::new(id, "", details), fx);
            state.items.get(&id).cloned()
        })
    }

    /// Bookmarks of a media, ordered by time.
    pub fn bookmarks(&self, media_id: u64) -> Vec<LibraryItem> {
        let mut marks = self
            .with_items(|items| {
                items
                    .values()
                    .filter(|item| item.as_bookmark().is_some_and(|b| b.media_id == media_id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        marks.sort_by_key(|item| item.as_bookmark().map(|b| (b.time, item.id)));
        marks
    }

    pub fn rename_bookmark(&self, id: u64, name: &str) -> bool {
        self.edit_bookmark(id, |item| {
            item.title = name.to_string();
            true
        })
    }

    pub fn update_bookmark_description(&self, id: u64, description: &str) -> bool {
        self.edit_bookmark(id, |item| match &mut item.details {
            ItemDetails::Bookmark(b) => {
                b.description = description.to_string();
                true
            }
            _ => false,
        })
    }

    /// Move a bookmark; fails if another bookmark of the media sits at `time`.
    pub fn move_bookmark(&self, id: u64, time: i64) -> bool {
        if time < 0 {
            return false;
        }
        self.mutate(false, |state, fx| {
            let Some(media_id) = state
                .items
                .get(&id)
                .and_then(|item| item.as_bookmark())
                .map(|b| b.media_id)
            else {
                return false;
            };
            let clash = state.items.values().any(|item| {
                item.id != id
                    && item
                        .as_bookmark()
                        .is_some_and(|b| b.media_id == media_id && b.time == time)
            });
            if clash {
                return false;
            }
            if let Some(ItemDetails::Bookmark(b)) = state.items.get_mut(&id).map(|i| &mut i.details) {
                b.time = time;
            }
            state.touch(id, fx);
            true
        })
    }

    pub fn remove_bookmark(&self, id: u64) -> bool {
        self.mutate(false, |state, fx| {
            if state.kind_of(id) != Some(ItemType::Bookmark) {
                return false;
            }
            state.remove_item(id);
            if let Some(db) = &state.db {
                if let Err(err) = db.delete_items(&[id]) {
                    fx.fail("delete bookmark", err);
                }
            }
            fx.record(EntityKind::Bookmark, ChangeKind::Deleted, id);
            true
        })
    }

    pub fn remove_all_bookmarks(&self, media_id: u64) -> bool {
        let ids: Vec<u64> = self.bookmarks(media_id).iter().map(|b| b.id).collect();
        !ids.is_empty() && ids.into_iter().all(|id| self.remove_bookmark(id))
    }

    fn edit_bookmark(&self, id: u64, edit: impl FnOnce(&mut LibraryItem) -> bool) -> bool {
        self.mutate(false, |state, fx| {
            let Some(item) = state.items.get_mut(&id) else {
                return false;
            };
            if item.item_type() != ItemType::Bookmark || !edit(item) {
                return false;
            }
            state.touch(id, fx);
            true
        })
    }

    // ------------------------------------------------------------------------
    // Playlists
    // ------------------------------------------------------------------------

    pub fn create_playlist(&self, name: &str) -> Option<LibraryItem> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.mutate(None, |state, fx| {
            let id = state.alloc_id(fx);
            let details = ItemDetails::Playlist(PlaylistDetails::default());
            state.insert(LibraryItem::new(id, name, details), fx);
            state.items.get(&id).cloned()
        })
    }

    pub fn rename_playlist(&self, id: u64, name: &str) -> bool {
        self.rename(id, ItemType::Playlist, name)
    }

    /// Append a media at the end of a playlist.
    pub fn playlist_append(&self, playlist_id: u64, media_id: u64) -> bool {
        self.mutate(false, |state, fx| {
            let Some(mrl) = state.media(media_id).map(|m| m.mrl.clone()) else {
                return false;
            };
            let Some(ItemDetails::Playlist(p)) =
                state.items.get_mut(&playlist_id).map(|i| &mut i.details)
            else {
                return false;
            };
            p.entries.push(PlaylistEntry {
                mrl,
                media_id: Some(media_id),
            });
            state.touch(playlist_id, fx);
            state.refresh_counters(&[], &[playlist_id], fx);
            true
        })
    }

    /// Remove the entry at `position`.
    pub fn playlist_remove(&self, playlist_id: u64, position: usize) -> bool {
        self.mutate(false, |state, fx| {
            let Some(ItemDetails::Playlist(p)) =
                state.items.get_mut(&playlist_id).map(|i| &mut i.details)
            else {
                return false;
            };
            if position >= p.entries.len() {
                return false;
            }
            p.entries.remove(position);
            state.touch(playlist_id, fx);
            state.refresh_counters(&[], &[playlist_id], fx);
            true
        })
    }

    pub fn delete_playlist(&self, id: u64) -> bool {
        self.delete_container(id, ItemType::Playlist)
    }

    // ------------------------------------------------------------------------
    // Media groups
    // ------------------------------------------------------------------------

    /// Group existing media under `name`. Unknown ids are ignored.
    pub fn create_media_group(&self, name: &str, media_ids: &[u64]) -> Option<LibraryItem> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.mutate(None, |state, fx| {
            let mut members = Vec::new();
            for id in media_ids {
                if state.media(*id).is_some() && !members.contains(id) {
                    members.push(*id);
                }
            }
            let id = state.alloc_id(fx);
            let details = ItemDetails::MediaGroup(MediaGroupDetails {
                media_ids: members,
                counters: TrackCounters::default(),
            });
            state.insert(LibraryItem::new(id, name, details), fx);
            state.refresh_counters(&[], &[id], fx);
            state.items.get(&id).cloned()
        })
    }

    pub fn rename_media_group(&self, id: u64, name: &str) -> bool {
        self.rename(id, ItemType::MediaGroup, name)
    }

    pub fn media_group_add(&self, group_id: u64, media_id: u64) -> bool {
        self.edit_group(group_id, media_id, |ids| {
            if ids.contains(&media_id) {
                return false;
            }
            ids.push(media_id);
            true
        })
    }

    pub fn media_group_remove(&self, group_id: u64, media_id: u64) -> bool {
        self.edit_group(group_id, media_id, |ids| {
            let before = ids.len();
            ids.retain(|m| *m != media_id);
            ids.len() != before
        })
    }

    pub fn delete_media_group(&self, id: u64) -> bool {
        self.delete_container(id, ItemType::MediaGroup)
    }

    fn edit_group(&self, group_id: u64, media_id: u64, edit: impl FnOnce(&mut Vec<u64>) -> bool) -> bool {
        self.mutate(false, |state, fx| {
            if state.media(media_id).is_none() {
                return false;
            }
            let Some(ItemDetails::MediaGroup(g)) =
                state.items.get_mut(&group_id).map(|i| &mut i.details)
            else {
                return false;
            };
            if !edit(&mut g.media_ids) {
                return false;
            }
            state.touch(group_id, fx);
            state.refresh_counters(&[], &[group_id], fx);
            true
        })
    }

    fn rename(&self, id: u64, ty: ItemType, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        self.mutate(false, |state, fx| {
            let Some(item) = state.items.get_mut(&id).filter(|i| i.item_type() == ty) else {
                return false;
            };
            item.title = name.to_string();
            state.touch(id, fx);
            true
        })
    }

    fn delete_container(&self, id: u64, ty: ItemType) -> bool {
        self.mutate(false, |state, fx| {
            if state.kind_of(id) != Some(ty) {
                return false;
            }
            state.remove_item(id);
            if let Some(db) = &state.db {
                if let Err(err) = db.delete_items(&[id]) {
                    fx.fail("delete container", err);
                }
            }
            fx.record(entity_kind(ty), ChangeKind::Deleted, id);
            true
        })
    }

    // ------------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------------

    pub fn entry_points(&self) -> Vec<EntryPointRecord> {
        let state = self.state.read();
        if !state.is_initialized() {
            return Vec::new();
        }
        state.entry_points.values().cloned().collect()
    }

    pub fn entry_point(&self, mrl: &str) -> Option<EntryPointRecord> {
        let state = self.state.read();
        state.entry_points.get(mrl).cloned()
    }

    /// Register an entry point. Returns `false` if it is already known.
    pub fn add_entry_point(&self, mrl: &str) -> bool {
        self.mutate(false, |state, fx| {
            if state.entry_points.contains_key(mrl) {
                return false;
            }
            state
                .entry_points
                .insert(mrl.to_string(), EntryPointRecord::new(mrl));
            state.persist_entry_point(mrl, fx);
            true
        })
    }

    pub fn remove_entry_point_record(&self, mrl: &str) -> bool {
        self.mutate(false, |state, fx| {
            if state.entry_points.remove(mrl).is_none() {
                return false;
            }
            state.persist_entry_point(mrl, fx);
            true
        })
    }

    /// Flip the ban flag. Returns `false` when the entry point is already in
    /// the requested state. Banning an unknown entry point registers it as
    /// banned.
    pub fn set_entry_point_banned(&self, mrl: &str, banned: bool) -> bool {
        self.mutate(false, |state, fx| {
            if !state.entry_points.contains_key(mrl) {
                if !banned {
                    return false;
                }
                state
                    .entry_points
                    .insert(mrl.to_string(), EntryPointRecord::new(mrl));
            }
            let Some(record) = state.entry_points.get_mut(mrl) else {
                return false;
            };
            if record.banned == banned {
                return false;
            }
            record.banned = banned;
            state.persist_entry_point(mrl, fx);
            true
        })
    }

    pub fn is_banned(&self, mrl: &str) -> bool {
        self.state
            .read()
            .entry_points
            .get(mrl)
            .is_some_and(|ep| ep.banned)
    }

    // ------------------------------------------------------------------------
    // Discovery support
    // ------------------------------------------------------------------------

    /// Whether `mrl` is indexed with the same modification time.
    pub fn is_up_to_date(&self, mrl: &str, modified_at: i64) -> bool {
        let state = self.state.read();
        state
            .by_mrl
            .get(mrl)
            .and_then(|id| state.media(*id))
            .is_some_and(|m| m.modification_date == modified_at && !m.is_external())
    }

    /// Create or update the media for a parsed file. Identity is kept across
    /// updates. Returns the media id.
    pub fn upsert_discovered(
        &self,
        entry_point: &str,
        file: &DiscoveredFile,
        parsed: &ParsedMedia,
    ) -> Option<u64> {
        let now = self.clock.unix_timestamp();
        self.mutate(None, |state, fx| {
            let artist_id = match parsed.media_type {
                MediaType::Audio => Some(match parsed.artist.as_deref().map(str::trim) {
                    Some(name) if !name.is_empty() => {
                        state.find_or_create(ItemType::Artist, name, fx)
                    }
                    _ => UNKNOWN_ARTIST_ID,
                }),
                _ => None,
            };
            let genre_id = match parsed.genre.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => {
                    Some(state.find_or_create(ItemType::Genre, name, fx))
                }
                _ => None,
            };
            let title = if parsed.title.trim().is_empty() {
                title_from_filename(&filename_of(&file.mrl))
            } else {
                parsed.title.trim().to_string()
            };

            let apply = |media: &mut MediaDetails| {
                media.media_type = parsed.media_type;
                media.duration_ms = parsed.duration_ms;
                media.artist_id = artist_id;
                media.genre_id = genre_id;
                media.track_number = parsed.track_number;
                media.release_year = parsed.release_year;
                media.file_size = file.size;
                media.modification_date = file.modified_at;
                media.is_present = true;
                media.entry_point = Some(entry_point.to_string());
                media.flags.set(MediaFlags::EXTERNAL, false);
            };

            let existing = state.by_mrl.get(&file.mrl).copied();
            let (id, previous) = match existing {
                Some(id) => {
                    let Some(item) = state.items.get_mut(&id) else {
                        return None;
                    };
                    item.title = title;
                    let media = item.as_media_mut()?;
                    let previous = [media.artist_id, media.genre_id];
                    apply(media);
                    let before: Vec<u64> = previous.into_iter().flatten().collect();
                    let after: Vec<u64> = [artist_id, genre_id].into_iter().flatten().collect();
                    state.relink_members(id, &before, &after);
                    state.touch(id, fx);
                    (id, previous)
                }
                None => {
                    let id = state.alloc_id(fx);
                    let mut media = MediaDetails::new(file.mrl.clone());
                    media.insertion_date = now;
                    apply(&mut media);
                    state.insert(LibraryItem::new(id, title, ItemDetails::Media(media)), fx);
                    state.relink_playlists(&file.mrl, id, fx);
                    (id, [None, None])
                }
            };
            let previous: Vec<u64> = previous.into_iter().flatten().collect();
            state.refresh_counters(&[id], &previous, fx);
            Some(id)
        })
    }

    /// `(id, mrl)` of every discovered media under `entry_point`.
    pub fn media_under(&self, entry_point: &str) -> Vec<(u64, String)> {
        self.with_items(|items| {
            items
                .values()
                .filter_map(|item| {
                    let media = item.as_media()?;
                    let belongs = media.entry_point.as_deref() == Some(entry_point)
                        || (!media.is_external() && is_under(&media.mrl, entry_point));
                    belongs.then(|| (item.id, media.mrl.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
    }

    /// Toggle presence of media. Returns how many actually changed.
    pub fn set_media_presence(&self, ids: &[u64], present: bool) -> usize {
        self.mutate(0, |state, fx| {
            let mut changed = Vec::new();
            for id in ids {
                if let Some(media) = state.media_mut(*id) {
                    if media.is_present != present {
                        media.is_present = present;
                        changed.push(*id);
                    }
                }
            }
            for id in &changed {
                state.touch(*id, fx);
            }
            state.refresh_counters(&changed, &[], fx);
            changed.len()
        })
    }

    /// Mark the device behind an entry point as (un)mounted.
    pub fn set_entry_point_presence(&self, entry_point: &str, present: bool) -> usize {
        let ids: Vec<u64> = self
            .media_under(entry_point)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        self.mutate((), |state, fx| {
            if let Some(record) = state.entry_points.get_mut(entry_point) {
                if record.present != present {
                    record.present = present;
                    state.persist_entry_point(entry_point, fx);
                }
            }
        });
        self.set_media_presence(&ids, present)
    }

    /// Garbage-collect the media of a removed entry point. Media with playback
    /// history survive as external media; the rest are deleted.
    ///
    /// Returns `(deleted, converted)`.
    pub fn remove_entry_point_media(&self, entry_point: &str) -> (usize, usize) {
        let ids: Vec<u64> = self
            .media_under(entry_point)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        self.mutate((0, 0), |state, fx| {
            let (keep, doomed): (Vec<u64>, Vec<u64>) = ids
                .iter()
                .copied()
                .partition(|id| state.media(*id).is_some_and(MediaDetails::has_history));
            for id in &keep {
                if let Some(media) = state.media_mut(*id) {
                    media.flags.set(MediaFlags::EXTERNAL, true);
                    media.entry_point = None;
                }
                fx.record(EntityKind::Media, ChangeKind::ConvertedToExternal, *id);
                state.persist(&[*id], fx);
            }
            state.delete_media(&doomed, fx);
            info!(
                entry_point = %strip_path(entry_point),
                deleted = doomed.len(),
                converted = keep.len(),
                "Entry point media collected"
            );
            (doomed.len(), keep.len())
        })
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("EntityStore")
            .field("initialized", &state.is_initialized())
            .field("items", &state.items.len())
            .field("entry_points", &state.entry_points.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TrackContainer, VARIOUS_ARTISTS_ID};
    use chrono::{DateTime, TimeZone, Utc};
    use core_runtime::events::{ChangeListener, HistoryListener};
    use parking_lot::Mutex;

    struct FixedClock;

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            Utc.timestamp_opt(1_700_000_000, 0).unwrap()
        }
    }

    #[derive(Default)]
    struct Events {
        changes: Mutex<Vec<ChangeEvent>>,
        history: Mutex<Vec<u64>>,
    }

    impl ChangeListener for Events {
        fn on_change(&self, event: &ChangeEvent) {
            self.changes.lock().push(event.clone());
        }
    }

    impl HistoryListener for Events {
        fn on_history_changed(&self, media_id: u64) {
            self.history.lock().push(media_id);
        }
    }

    impl Events {
        fn count(&self, entity: EntityKind, kind: ChangeKind) -> usize {
            self.changes
                .lock()
                .iter()
                .filter(|e| e.entity == entity && e.kind == kind)
                .map(|e| e.ids.len())
                .sum()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: EntityStore,
        events: Arc<Events>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(ChangeNotifier::new());
        let events = Arc::new(Events::default());
        for kind in EntityKind::ALL {
            notifier.entity(kind).register(events.clone());
        }
        notifier.history().register(events.clone());
        let store = EntityStore::new(notifier, PlaybackThresholds::default())
            .with_clock(Arc::new(FixedClock));
        assert_eq!(
            store.open(&dir.path().join("medialibrary.db")),
            InitResult::Success
        );
        Fixture {
            _dir: dir,
            store,
            events,
        }
    }

    fn audio(title: &str, artist: &str, genre: &str) -> ParsedMedia {
        ParsedMedia {
            title: title.to_string(),
            media_type: MediaType::Audio,
            duration_ms: 200_000,
            artist: Some(artist.to_string()),
            genre: Some(genre.to_string()),
            ..Default::default()
        }
    }

    fn counters(store: &EntityStore, id: u64) -> (u32, u32) {
        let item = store.get(id).unwrap();
        let c = item.as_container().unwrap();
        (c.tracks_count(), c.present_tracks_count())
    }

    #[test]
    fn test_uninitialized_store_is_neutral() {
        let store = EntityStore::new(Arc::new(ChangeNotifier::new()), PlaybackThresholds::default());
        assert!(!store.is_initialized());
        assert!(store.get(1).is_none());
        assert!(store.media_by_mrl("/music/a.mp3").is_none());
        assert!(matches!(
            store.add_media("/music/a.mp3", 0),
            Err(LibraryError::NotInitialized)
        ));
        assert_eq!(store.set_playback_time(3, 10), PlaybackResult::Error);
        assert!(!store.set_playback_position(3, 0.5));
        assert!(store.create_playlist("x").is_none());
        assert!(store.entry_points().is_empty());
        assert_eq!(store.set_media_presence(&[3], false), 0);
    }

    #[test]
    fn test_reserved_artists_exist() {
        let fx = fixture();
        assert_eq!(fx.store.get(UNKNOWN_ARTIST_ID).unwrap().title, "Unknown Artist");
        assert_eq!(fx.store.get(VARIOUS_ARTISTS_ID).unwrap().title, "Various Artists");
        assert_eq!(fx.store.open(Path::new("/elsewhere.db")), InitResult::AlreadyInitialized);
    }

    #[test]
    fn test_add_media_and_conflict() {
        let fx = fixture();
        let item = fx.store.add_media("/sdcard/Movies/clip one.mp4", 60_000).unwrap();
        let media = item.as_media().unwrap();
        assert_eq!(media.mrl, "file:///sdcard/Movies/clip%20one.mp4");
        assert!(media.is_external());
        assert_eq!(media.insertion_date, 1_700_000_000);
        assert_eq!(item.title, "clip one");

        let again = fx.store.add_media("/sdcard/Movies/clip one.mp4", 0);
        assert!(matches!(again, Err(LibraryError::Conflict(_))));
        assert!(fx.store.add_media("content://media/1", 0).is_err());

        assert_eq!(
            fx.store.media_by_mrl("/sdcard/Movies/clip one.mp4").unwrap().id,
            item.id
        );
        assert_eq!(fx.events.count(EntityKind::Media, ChangeKind::Added), 1);
    }

    #[test]
    fn test_path_and_file_uri_address_the_same_media() {
        let fx = fixture();
        let item = fx.store.add_media("/music/My Song.mp3", 0).unwrap();

        for uri in ["file:///music/My Song.mp3", "file:///music/My%20Song.mp3"] {
            assert_eq!(fx.store.media_by_mrl(uri).map(|m| m.id), Some(item.id));
            assert!(matches!(
                fx.store.add_media(uri, 0),
                Err(LibraryError::Conflict(_))
            ));
        }
        assert_eq!(fx.events.count(EntityKind::Media, ChangeKind::Added), 1);
    }

    #[test]
    fn test_content_uri_never_resolves() {
        let fx = fixture();
        fx.store.add_media("content://media/external/1", 0).ok();
        assert!(fx.store.media_by_mrl("content://media/external/1").is_none());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let fx = fixture();
        let a = fx.store.add_media("/m/a.mp3", 0).unwrap().id;
        assert!(fx.store.remove_external_media(a));
        let b = fx.store.add_media("/m/a.mp3", 0).unwrap().id;
        assert!(b > a);
    }

    #[test]
    fn test_remove_only_external_media() {
        let fx = fixture();
        let file = DiscoveredFile::new("file:///music/a.mp3", 10, 5);
        let discovered = fx
            .store
            .upsert_discovered("file:///music", &file, &audio("A", "Band", "Rock"))
            .unwrap();
        assert!(!fx.store.remove_external_media(discovered));
        assert!(!fx.store.remove_external_media(0));
        assert!(!fx.store.remove_external_media(9999));

        let external = fx.store.add_media("/x/b.mp3", 0).unwrap().id;
        fx.store.add_bookmark(external, 1000).unwrap();
        assert!(fx.store.remove_external_media(external));
        assert!(fx.store.get(external).is_none());
        assert!(fx.store.bookmarks(external).is_empty());
        assert_eq!(fx.events.count(EntityKind::Bookmark, ChangeKind::Deleted), 1);
    }

    #[test]
    fn test_playback_time_policy() {
        let fx = fixture();
        let id = fx.store.add_media("/m/film.mkv", 100_000).unwrap().id;

        assert_eq!(fx.store.set_playback_time(id, 0), PlaybackResult::Error);
        assert_eq!(fx.store.set_playback_time(0, 50), PlaybackResult::Error);
        assert_eq!(fx.store.set_playback_time(424242, 50), PlaybackResult::Error);

        assert_eq!(fx.store.set_playback_time(id, 1_000), PlaybackResult::Begin);
        assert_eq!(fx.store.get(id).unwrap().as_media().unwrap().last_time, 0);

        assert_eq!(fx.store.set_playback_time(id, 40_000), PlaybackResult::AsIs);
        let media = fx.store.get(id).unwrap().as_media().unwrap().clone();
        assert_eq!(media.last_time, 40_000);
        assert!((media.last_position - 0.4).abs() < 1e-6);
        assert_eq!(media.last_played_at, Some(1_700_000_000));

        assert_eq!(fx.store.set_playback_time(id, 99_000), PlaybackResult::End);
        let media = fx.store.get(id).unwrap().as_media().unwrap().clone();
        assert_eq!(media.last_time, 0);
        assert_eq!(media.play_count, 1);

        assert_eq!(fx.store.set_playback_time(id, u64::MAX), PlaybackResult::End);
        assert_eq!(*fx.events.history.lock(), vec![id, id, id, id]);
    }

    #[test]
    fn test_playback_time_unknown_duration() {
        let fx = fixture();
        let id = fx.store.add_media("/m/stream.ts", 0).unwrap().id;
        assert_eq!(fx.store.set_playback_time(id, u64::MAX), PlaybackResult::AsIs);
        assert_eq!(
            fx.store.get(id).unwrap().as_media().unwrap().last_time,
            i64::MAX
        );
        assert_eq!(fx.store.set_playback_time(u64::MAX, u64::MAX), PlaybackResult::Error);
    }

    #[test]
    fn test_playback_position() {
        let fx = fixture();
        let id = fx.store.add_media("/m/a.mp3", 10_000).unwrap().id;
        assert!(fx.store.set_playback_position(id, 0.25));
        assert_eq!(fx.store.get(id).unwrap().as_media().unwrap().last_time, 2_500);
        assert!(!fx.store.set_playback_position(0, 0.25));
        assert!(!fx.store.set_playback_position(id, f32::NAN));
        assert!(fx.store.set_playback_position(id, 7.0));
        assert_eq!(fx.store.get(id).unwrap().as_media().unwrap().last_position, 1.0);
    }

    #[test]
    fn test_presence_updates_counters_by_one() {
        let fx = fixture();
        let ep = "file:///music";
        let a = fx
            .store
            .upsert_discovered(ep, &DiscoveredFile::new("file:///music/a.mp3", 1, 1), &audio("A", "Band", "Rock"))
            .unwrap();
        fx.store
            .upsert_discovered(ep, &DiscoveredFile::new("file:///music/b.mp3", 1, 1), &audio("B", "band", "Rock"))
            .unwrap();

        let media = fx.store.get(a).unwrap();
        let artist = media.as_media().unwrap().artist_id.unwrap();
        let genre = media.as_media().unwrap().genre_id.unwrap();
        assert_eq!(counters(&fx.store, artist), (2, 2));
        assert_eq!(counters(&fx.store, genre), (2, 2));

        assert_eq!(fx.store.set_media_presence(&[a], false), 1);
        assert_eq!(counters(&fx.store, artist), (2, 1));
        assert_eq!(counters(&fx.store, genre), (2, 1));

        assert_eq!(fx.store.set_media_presence(&[a], false), 0);
        assert_eq!(counters(&fx.store, artist), (2, 1));
    }

    #[test]
    fn test_rediscovery_keeps_identity() {
        let fx = fixture();
        let file = DiscoveredFile::new("file:///music/a.mp3", 1, 1);
        let first = fx
            .store
            .upsert_discovered("file:///music", &file, &audio("Old", "One", "Pop"))
            .unwrap();
        assert!(fx.store.is_up_to_date(&file.mrl, 1));
        assert!(!fx.store.is_up_to_date(&file.mrl, 2));

        let touched = DiscoveredFile::new("file:///music/a.mp3", 1, 2);
        let second = fx
            .store
            .upsert_discovered("file:///music", &touched, &audio("New", "Two", "Pop"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.store.get(first).unwrap().title, "New");

        let old_artist = fx.store.with_items(|items| {
            items
                .values()
                .find(|i| i.title == "One")
                .map(|i| i.id)
        });
        let old_artist = old_artist.flatten().unwrap();
        assert_eq!(counters(&fx.store, old_artist), (0, 0));
    }

    #[test]
    fn test_artist_and_genre_indexes_survive_reopen_and_deletion() {
        let fx = fixture();
        let ep = "file:///music";
        let first = fx
            .store
            .upsert_discovered(ep, &DiscoveredFile::new("file:///music/a.mp3", 1, 1), &audio("A", "Band", "Rock"))
            .unwrap();
        let artist = fx.store.get(first).unwrap().as_media().unwrap().artist_id.unwrap();

        let path = fx._dir.path().join("medialibrary.db");
        fx.store.close();
        assert_eq!(fx.store.open(&path), InitResult::Success);

        let second = fx
            .store
            .upsert_discovered(ep, &DiscoveredFile::new("file:///music/b.mp3", 1, 1), &audio("B", "BAND", "rock"))
            .unwrap();
        let media = fx.store.get(second).unwrap();
        assert_eq!(media.as_media().unwrap().artist_id, Some(artist));
        let genre = media.as_media().unwrap().genre_id.unwrap();
        assert_eq!(counters(&fx.store, artist), (2, 2));
        assert_eq!(counters(&fx.store, genre), (2, 2));

        assert_eq!(fx.store.remove_entry_point_media(ep), (2, 0));
        assert_eq!(counters(&fx.store, artist), (0, 0));
        assert_eq!(counters(&fx.store, genre), (0, 0));
    }

    #[test]
    fn test_audio_without_artist_goes_to_unknown() {
        let fx = fixture();
        let parsed = ParsedMedia {
            title: "Loose".into(),
            media_type: MediaType::Audio,
            ..Default::default()
        };
        let id = fx
            .store
            .upsert_discovered("file:///m", &DiscoveredFile::new("file:///m/l.mp3", 1, 1), &parsed)
            .unwrap();
        assert_eq!(
            fx.store.get(id).unwrap().as_media().unwrap().artist_id,
            Some(UNKNOWN_ARTIST_ID)
        );
        assert_eq!(counters(&fx.store, UNKNOWN_ARTIST_ID), (1, 1));
    }

    #[test]
    fn test_playlist_links_survive_media_deletion() {
        let fx = fixture();
        let media = fx.store.add_media("/m/a.mp3", 0).unwrap().id;
        let playlist = fx.store.create_playlist("Mix").unwrap().id;
        assert!(fx.store.create_playlist("   ").is_none());

        assert!(fx.store.playlist_append(playlist, media));
        assert!(!fx.store.playlist_append(playlist, 9999));
        assert_eq!(counters(&fx.store, playlist), (1, 1));

        assert!(fx.store.remove_external_media(media));
        let pl = fx.store.get(playlist).unwrap();
        let entry = &pl.as_playlist().unwrap().entries[0];
        assert_eq!(entry.media_id, None);
        assert_eq!(counters(&fx.store, playlist), (1, 0));

        let again = fx.store.add_media("/m/a.mp3", 0).unwrap().id;
        let pl = fx.store.get(playlist).unwrap();
        assert_eq!(pl.as_playlist().unwrap().entries[0].media_id, Some(again));
        assert_eq!(counters(&fx.store, playlist), (1, 1));

        assert!(fx.store.playlist_remove(playlist, 0));
        assert!(!fx.store.playlist_remove(playlist, 0));
        assert!(fx.store.delete_playlist(playlist));
        assert!(!fx.store.delete_playlist(playlist));
    }

    #[test]
    fn test_bookmarks() {
        let fx = fixture();
        let media = fx.store.add_media("/m/a.mkv", 0).unwrap().id;
        let b1 = fx.store.add_bookmark(media, 5_000).unwrap().id;
        let b2 = fx.store.add_bookmark(media, 1_000).unwrap().id;
        assert!(fx.store.add_bookmark(media, 1_000).is_none());
        assert!(fx.store.add_bookmark(9999, 1).is_none());

        let ordered: Vec<u64> = fx.store.bookmarks(media).iter().map(|b| b.id).collect();
        assert_eq!(ordered, vec![b2, b1]);

        assert!(fx.store.rename_bookmark(b1, "Chorus"));
        assert!(fx.store.update_bookmark_description(b1, "the good part"));
        assert!(!fx.store.move_bookmark(b1, 1_000));
        assert!(fx.store.move_bookmark(b1, 500));
        let b1_item = fx.store.get(b1).unwrap();
        assert_eq!(b1_item.title, "Chorus");
        assert_eq!(b1_item.as_bookmark().unwrap().time, 500);

        assert!(!fx.store.rename_bookmark(media, "not a bookmark"));
        assert!(fx.store.remove_all_bookmarks(media));
        assert!(fx.store.bookmarks(media).is_empty());
    }

    #[test]
    fn test_media_groups() {
        let fx = fixture();
        let a = fx.store.add_media("/m/a.mkv", 0).unwrap().id;
        let b = fx.store.add_media("/m/b.mkv", 0).unwrap().id;
        let group = fx.store.create_media_group("Series", &[a, a, 777]).unwrap();
        assert_eq!(counters(&fx.store, group.id), (1, 1));

        assert!(fx.store.media_group_add(group.id, b));
        assert!(!fx.store.media_group_add(group.id, b));
        assert!(fx.store.media_group_remove(group.id, a));
        assert!(fx.store.rename_media_group(group.id, "Show"));
        assert_eq!(fx.store.get(group.id).unwrap().title, "Show");
        assert!(fx.store.delete_media_group(group.id));
    }

    #[test]
    fn test_entry_point_registry_and_bans() {
        let fx = fixture();
        assert!(fx.store.add_entry_point("file:///music"));
        assert!(!fx.store.add_entry_point("file:///music"));

        assert!(fx.store.set_entry_point_banned("file:///music", true));
        assert!(!fx.store.set_entry_point_banned("file:///music", true));
        assert!(fx.store.is_banned("file:///music"));
        assert!(fx.store.set_entry_point_banned("file:///music", false));

        assert!(fx.store.set_entry_point_banned("file:///unknown", true));
        assert!(fx.store.entry_point("file:///unknown").unwrap().banned);
        assert!(!fx.store.set_entry_point_banned("file:///never", false));

        assert!(fx.store.remove_entry_point_record("file:///music"));
        assert!(!fx.store.remove_entry_point_record("file:///music"));
    }

    #[test]
    fn test_entry_point_removal_converts_played_media() {
        let fx = fixture();
        let ep = "file:///music";
        let played = fx
            .store
            .upsert_discovered(ep, &DiscoveredFile::new("file:///music/a.mp3", 1, 1), &audio("A", "X", "Y"))
            .unwrap();
        let unplayed = fx
            .store
            .upsert_discovered(ep, &DiscoveredFile::new("file:///music/b.mp3", 1, 1), &audio("B", "X", "Y"))
            .unwrap();
        fx.store.set_playback_time(played, 10);

        assert_eq!(fx.store.remove_entry_point_media(ep), (1, 1));
        assert!(fx.store.get(unplayed).is_none());
        let kept = fx.store.get(played).unwrap();
        assert!(kept.as_media().unwrap().is_external());
        assert_eq!(
            fx.events.count(EntityKind::Media, ChangeKind::ConvertedToExternal),
            1
        );
    }

    #[test]
    fn test_device_presence() {
        let fx = fixture();
        let ep = "file:///usb";
        fx.store.add_entry_point(ep);
        for name in ["a", "b"] {
            let file = DiscoveredFile::new(format!("file:///usb/{}.mp3", name), 1, 1);
            fx.store.upsert_discovered(ep, &file, &audio(name, "Z", "Q"));
        }
        assert_eq!(fx.store.set_entry_point_presence(ep, false), 2);
        assert!(!fx.store.entry_point(ep).unwrap().present);
        assert_eq!(fx.store.set_entry_point_presence(ep, true), 2);
    }

    #[test]
    fn test_clear_history() {
        let fx = fixture();
        let id = fx.store.add_media("/m/a.mp3", 0).unwrap().id;
        fx.store.set_playback_time(id, 5);
        assert!(fx.store.clear_history());
        assert_eq!(fx.store.get(id).unwrap().as_media().unwrap().last_played_at, None);
    }
}
