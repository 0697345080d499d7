//! # Media Library Facade
//!
//! The single handle a host application holds on the library.
//!
//! ## Lifecycle
//!
//! ```text
//! new ─► construct ─► init ─► start ─► ... ─► release
//!           │           │        │
//!           │           │        └─ spawns discovery, fires ready listeners once
//!           │           └─ opens the database, reports an InitResult
//!           └─ checks both directories, prepares the artefacts directory
//! ```
//!
//! Every accessor is safe to call at any point of the lifecycle. Before
//! `init` succeeds, or after `release`, lookups return `None`, listings are
//! empty and mutators report failure.

use crate::{CoreError, Result};
use bridge_traits::mrl::{encode_mrl, sdcard_alternate};
use bridge_traits::scanner::MediaScanner;
use core_discovery::{DiscoveryController, DiscoveryState};
use core_library::models::EntryPointRecord;
use core_library::{
    EntityStore, InitResult, LibraryItem, PlaybackResult, QueryEngine, QueryParams,
    SearchAggregate,
};
use core_runtime::config::{is_writable_dir, LibraryConfig, LibraryConfigBuilder};
use core_runtime::events::{ChangeNotifier, ExceptionHandler};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Everything that exists between `construct` and `release`.
struct Session {
    config: LibraryConfig,
    store: Arc<EntityStore>,
    query: QueryEngine,
    discovery: Option<DiscoveryController>,
}

/// Process-wide media library handle.
///
/// Construct one per process and pass it by reference; tests build a fresh
/// one per case.
pub struct MediaLibrary {
    notifier: Arc<ChangeNotifier>,
    scanner: Arc<dyn MediaScanner>,
    session: RwLock<Option<Session>>,
    started: AtomicBool,
    released: AtomicBool,
}

impl MediaLibrary {
    pub fn new(scanner: Arc<dyn MediaScanner>) -> Self {
        Self {
            notifier: Arc::new(ChangeNotifier::new()),
            scanner,
            session: RwLock::new(None),
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Library backed by the local file system scanner.
    #[cfg(feature = "desktop-shims")]
    pub fn desktop() -> Self {
        Self::new(Arc::new(bridge_desktop::FsMediaScanner::new()))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Build the configuration and construct with it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` when the builder is missing a directory.
    /// Unusable directories are not an error; they yield `Ok(false)`.
    pub fn construct_with(&self, builder: LibraryConfigBuilder) -> Result<bool> {
        let config = builder.build()?;
        Ok(self.construct(&config))
    }

    /// Check the storage locations and prepare the library.
    ///
    /// Returns `false`, leaving the library unusable, when either directory
    /// is missing or read-only, or when the library is already initialized.
    #[instrument(skip_all, fields(db = %config.database_dir.display()))]
    pub fn construct(&self, config: &LibraryConfig) -> bool {
        if self.released.load(Ordering::SeqCst) {
            warn!("construct() after release");
            return false;
        }
        let mut session = self.session.write();
        if session.as_ref().is_some_and(|s| s.store.is_initialized()) {
            debug!("Already initialized, construct ignored");
            return false;
        }
        if !is_writable_dir(&config.database_dir) || !is_writable_dir(&config.media_dir) {
            warn!(
                media_dir = %config.media_dir.display(),
                "Storage directories are missing or not writable"
            );
            return false;
        }
        if let Err(err) = std::fs::create_dir_all(config.media_artifacts_dir()) {
            warn!(error = %err, "Cannot create the media artefacts directory");
            return false;
        }
        remove_legacy_thumbnails(&config.legacy_thumbnails_dir());

        let store = Arc::new(EntityStore::new(self.notifier.clone(), config.playback));
        *session = Some(Session {
            config: config.clone(),
            query: QueryEngine::new(store.clone()),
            store,
            discovery: None,
        });
        info!("Media library constructed");
        true
    }

    /// Open or create the database.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotConstructed` when `construct` has not
    /// succeeded yet.
    #[instrument(skip(self))]
    pub fn init(&self) -> Result<InitResult> {
        let session = self.session.read();
        let session = session.as_ref().ok_or(CoreError::NotConstructed)?;
        if session.store.is_initialized() {
            return Ok(InitResult::AlreadyInitialized);
        }

        let result = session.store.open(&session.config.database_path());
        match result {
            InitResult::DbCorrupted => {
                error!("Database was corrupted; damaged data cleared and playlists restored")
            }
            InitResult::DbUnrecoverable => error!("Database is unrecoverable; reset required"),
            InitResult::Failed => error!("Database could not be opened"),
            _ => info!(?result, "Media library initialized"),
        }
        Ok(result)
    }

    /// Drop the database file and start over with an empty one.
    pub fn reset_database(&self) -> InitResult {
        match self.session.read().as_ref() {
            Some(session) => session.store.reset(),
            None => InitResult::Failed,
        }
    }

    /// Start background operations and announce readiness.
    ///
    /// The first successful call spawns the discovery worker and fires every
    /// ready listener before returning; later calls do nothing. Returns
    /// whether the library is started.
    #[instrument(skip(self))]
    pub fn start(&self) -> bool {
        if self.started.load(Ordering::SeqCst) {
            return true;
        }
        {
            let mut session = self.session.write();
            let Some(session) = session.as_mut().filter(|s| s.store.is_initialized()) else {
                warn!("start() before a successful init()");
                return false;
            };
            if self.started.swap(true, Ordering::SeqCst) {
                return true;
            }
            match DiscoveryController::start(
                session.store.clone(),
                self.scanner.clone(),
                self.notifier.clone(),
                &session.config.discovery,
            ) {
                Ok(controller) => session.discovery = Some(controller),
                Err(err) => {
                    error!(error = %err, "Discovery worker could not start");
                    self.notifier
                        .report_exception("start", &err.to_string(), false);
                }
            }
        }
        self.notifier.notify_ready();
        info!("Media library started");
        true
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .is_some_and(|s| s.store.is_initialized())
    }

    /// Stop the worker and close the database. Only the first call does
    /// anything.
    #[instrument(skip(self))]
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("Media library already released");
            return;
        }
        let session = self.session.write().take();
        if let Some(session) = session {
            if let Some(discovery) = &session.discovery {
                discovery.shutdown();
            }
            session.store.close();
        }
        self.notifier.set_working(false);
        info!("Media library released");
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Listener registry. Register before `start` to receive readiness.
    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn set_exception_handler(&self, handler: Option<Arc<dyn ExceptionHandler>>) {
        self.notifier.set_exception_handler(handler);
    }

    /// Whether discovery is currently busy.
    pub fn is_working(&self) -> bool {
        self.notifier.is_working()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<bool> {
        self.notifier.subscribe_state()
    }

    // ========================================================================
    // Media
    // ========================================================================

    fn with_session<R>(&self, neutral: R, f: impl FnOnce(&Session) -> R) -> R {
        match self.session.read().as_ref() {
            Some(session) => f(session),
            None => neutral,
        }
    }

    fn store(&self) -> Option<Arc<EntityStore>> {
        self.with_session(None, |s| Some(s.store.clone()))
    }

    /// Sorted, paged and searched listings. `None` before `construct`.
    pub fn query(&self) -> Option<QueryEngine> {
        self.with_session(None, |s| Some(s.query.clone()))
    }

    pub fn get(&self, id: u64) -> Option<LibraryItem> {
        self.store()?.get(id)
    }

    pub fn get_media(&self, id: u64) -> Option<LibraryItem> {
        self.store()?.get_media(id)
    }

    /// Look a media up by path, URI or MRL. `content:` URIs always yield
    /// `None`.
    pub fn get_media_by_uri(&self, uri: &str) -> Option<LibraryItem> {
        self.store()?.media_by_mrl(uri)
    }

    /// Resolve a transient media against the library.
    ///
    /// A transient item (id 0) is looked up by its MRL, falling back to the
    /// primary storage root for `/sdcard` paths. When found, the persisted
    /// media is returned with the transient item's flags added. Anything
    /// else is returned unchanged.
    pub fn find_media(&self, item: LibraryItem) -> LibraryItem {
        if !item.is_transient() || !self.is_initialized() {
            return item;
        }
        let Some(wanted) = item.as_media() else {
            return item;
        };
        let found = self.get_media_by_uri(&wanted.mrl).or_else(|| {
            encode_mrl(&wanted.mrl)
                .as_deref()
                .and_then(sdcard_alternate)
                .and_then(|alt| self.get_media_by_uri(&alt))
        });
        let Some(mut found) = found else {
            return item;
        };
        if let Some(media) = found.as_media_mut() {
            media.flags = media.flags | wanted.flags;
        }
        found
    }

    /// Add an external media.
    ///
    /// # Errors
    ///
    /// Fails before `init`, for empty or `content:` URIs and when the MRL is
    /// already known.
    pub fn add_media(&self, uri: &str, duration_ms: i64) -> Result<LibraryItem> {
        let store = self.store().ok_or(CoreError::NotConstructed)?;
        Ok(store.add_media(uri, duration_ms)?)
    }

    pub fn remove_external_media(&self, id: u64) -> bool {
        self.store().is_some_and(|s| s.remove_external_media(id))
    }

    pub fn set_playback_time(&self, media_id: u64, time: u64) -> PlaybackResult {
        self.store()
            .map_or(PlaybackResult::Error, |s| s.set_playback_time(media_id, time))
    }

    pub fn set_playback_position(&self, media_id: u64, position: f32) -> bool {
        self.store()
            .is_some_and(|s| s.set_playback_position(media_id, position))
    }

    pub fn set_favorite(&self, media_id: u64, favorite: bool) -> bool {
        self.store().is_some_and(|s| s.set_favorite(media_id, favorite))
    }

    pub fn history(&self) -> Vec<LibraryItem> {
        self.with_session(Vec::new(), |s| s.query.history())
    }

    pub fn clear_history(&self) -> bool {
        self.store().is_some_and(|s| s.clear_history())
    }

    pub fn audio(&self, params: &QueryParams) -> Vec<LibraryItem> {
        self.with_session(Vec::new(), |s| s.query.audio(params))
    }

    pub fn videos(&self, params: &QueryParams) -> Vec<LibraryItem> {
        self.with_session(Vec::new(), |s| s.query.videos(params))
    }

    pub fn search(&self, query: &str) -> SearchAggregate {
        self.with_session(SearchAggregate::default(), |s| {
            s.query.search(query, &QueryParams::default())
        })
    }

    // ========================================================================
    // Bookmarks, playlists and groups
    // ========================================================================

    pub fn add_bookmark(&self, media_id: u64, time: i64) -> Option<LibraryItem> {
        self.store()?.add_bookmark(media_id, time)
    }

    pub fn bookmarks(&self, media_id: u64) -> Vec<LibraryItem> {
        self.store()
            .map(|s| s.bookmarks(media_id))
            .unwrap_or_default()
    }

    pub fn remove_bookmark(&self, id: u64) -> bool {
        self.store().is_some_and(|s| s.remove_bookmark(id))
    }

    pub fn create_playlist(&self, name: &str) -> Option<LibraryItem> {
        self.store()?.create_playlist(name)
    }

    pub fn playlist_append(&self, playlist_id: u64, media_id: u64) -> bool {
        self.store()
            .is_some_and(|s| s.playlist_append(playlist_id, media_id))
    }

    pub fn delete_playlist(&self, id: u64) -> bool {
        self.store().is_some_and(|s| s.delete_playlist(id))
    }

    pub fn create_media_group(&self, name: &str, media_ids: &[u64]) -> Option<LibraryItem> {
        self.store()?.create_media_group(name, media_ids)
    }

    pub fn delete_media_group(&self, id: u64) -> bool {
        self.store().is_some_and(|s| s.delete_media_group(id))
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    fn discovery<R>(
        &self,
        f: impl FnOnce(&DiscoveryController) -> core_discovery::Result<R>,
    ) -> Result<R> {
        let session = self.session.read();
        let controller = session
            .as_ref()
            .and_then(|s| s.discovery.as_ref())
            .ok_or(CoreError::NotStarted)?;
        Ok(f(controller)?)
    }

    pub fn reload(&self) -> Result<()> {
        self.discovery(|d| d.reload())
    }

    /// # Errors
    ///
    /// A blank entry point is rejected and nothing is scheduled.
    pub fn reload_entry_point(&self, entry_point: &str) -> Result<()> {
        self.discovery(|d| d.reload_entry_point(entry_point))
    }

    pub fn force_rescan(&self) -> Result<()> {
        self.discovery(|d| d.force_rescan())
    }

    pub fn force_parser_retry(&self) -> Result<()> {
        self.discovery(|d| d.retry_parser())
    }

    pub fn pause_background_operations(&self) -> Result<()> {
        self.discovery(|d| d.pause())
    }

    pub fn resume_background_operations(&self) -> Result<()> {
        self.discovery(|d| d.resume())
    }

    pub fn add_entry_point(&self, entry_point: &str) -> Result<()> {
        self.discovery(|d| d.add_entry_point(entry_point))
    }

    pub fn remove_entry_point(&self, entry_point: &str) -> Result<()> {
        self.discovery(|d| d.remove_entry_point(entry_point))
    }

    pub fn ban_entry_point(&self, entry_point: &str) -> Result<()> {
        self.discovery(|d| d.ban(entry_point))
    }

    pub fn unban_entry_point(&self, entry_point: &str) -> Result<()> {
        self.discovery(|d| d.unban(entry_point))
    }

    pub fn device_mounted(&self, entry_point: &str) -> Result<()> {
        self.discovery(|d| d.device_changed(entry_point, true))
    }

    pub fn device_unmounted(&self, entry_point: &str) -> Result<()> {
        self.discovery(|d| d.device_changed(entry_point, false))
    }

    pub fn entry_points(&self) -> Vec<EntryPointRecord> {
        self.store()
            .map(|s| s.entry_points())
            .unwrap_or_default()
    }

    pub fn discovery_state(&self, entry_point: &str) -> Option<DiscoveryState> {
        self.discovery(|d| Ok(d.state_of(entry_point))).ok().flatten()
    }
}

impl Drop for MediaLibrary {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MediaLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaLibrary")
            .field("initialized", &self.is_initialized())
            .field("started", &self.is_started())
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

/// Delete the thumbnail directory of older releases in the background.
fn remove_legacy_thumbnails(dir: &Path) {
    if !dir.is_dir() {
        return;
    }
    let dir = dir.to_path_buf();
    let spawned = thread::Builder::new()
        .name("medialib-thumbs-cleanup".into())
        .spawn(move || match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!(dir = %dir.display(), "Legacy thumbnails removed"),
            Err(err) => warn!(error = %err, "Cannot remove legacy thumbnails"),
        });
    if let Err(err) = spawned {
        warn!(error = %err, "Cannot spawn thumbnail cleanup");
    }
}
