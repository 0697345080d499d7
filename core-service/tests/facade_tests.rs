//! End-to-end behavior of the [`MediaLibrary`] facade: lifecycle, lookups,
//! playback policy and discovery driven through the public API.

use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::scanner::{DiscoveredFile, MediaScanner, MediaType, ParsedMedia};
use core_library::models::{MediaFlags, TrackContainer};
use core_library::{InitResult, LibraryItem, PlaybackResult, QueryParams};
use core_runtime::config::LibraryConfig;
use core_runtime::events::{DiscoveryEvent, DiscoveryListener, ReadyListener};
use core_service::{CoreError, MediaLibrary};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct FolderScanner {
    folders: Mutex<HashMap<String, Vec<String>>>,
}

impl FolderScanner {
    fn set(&self, entry_point: &str, names: &[&str]) {
        let files = names
            .iter()
            .map(|name| format!("{}/{}.mp3", entry_point, name))
            .collect();
        self.folders.lock().insert(entry_point.to_string(), files);
    }
}

impl MediaScanner for FolderScanner {
    fn list_files(&self, entry_point: &str) -> BridgeResult<Vec<DiscoveredFile>> {
        let folders = self.folders.lock();
        let files = folders
            .get(entry_point)
            .ok_or_else(|| BridgeError::Unreachable(entry_point.to_string()))?;
        Ok(files
            .iter()
            .map(|mrl| DiscoveredFile::new(mrl.clone(), 4_096, 7))
            .collect())
    }

    fn parse(&self, file: &DiscoveredFile) -> BridgeResult<ParsedMedia> {
        Ok(ParsedMedia {
            title: file.filename().trim_end_matches(".mp3").to_string(),
            media_type: MediaType::Audio,
            duration_ms: 200_000,
            artist: Some("Band".into()),
            genre: Some("Rock".into()),
            ..Default::default()
        })
    }
}

struct EventLog {
    tx: Mutex<Sender<DiscoveryEvent>>,
}

impl DiscoveryListener for EventLog {
    fn on_discovery_event(&self, event: &DiscoveryEvent) {
        self.tx.lock().send(event.clone()).ok();
    }
}

#[derive(Default)]
struct ReadyCounter {
    ready: AtomicUsize,
}

impl ReadyListener for ReadyCounter {
    fn on_library_ready(&self) {
        self.ready.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    dir: tempfile::TempDir,
    config: LibraryConfig,
    scanner: Arc<FolderScanner>,
    library: MediaLibrary,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db");
    let media = dir.path().join("external");
    std::fs::create_dir_all(&db).unwrap();
    std::fs::create_dir_all(&media).unwrap();
    let config = LibraryConfig::builder()
        .database_dir(db)
        .media_dir(media)
        .build()
        .unwrap();
    let scanner = Arc::new(FolderScanner::default());
    let library = MediaLibrary::new(scanner.clone());
    Harness {
        dir,
        config,
        scanner,
        library,
    }
}

/// Constructed, initialized and started library.
fn running() -> Harness {
    let h = harness();
    assert!(h.library.construct(&h.config));
    assert_eq!(h.library.init().unwrap(), InitResult::Success);
    assert!(h.library.start());
    h
}

fn listen(library: &MediaLibrary) -> Receiver<DiscoveryEvent> {
    let (tx, rx) = mpsc::channel();
    library
        .notifier()
        .discovery()
        .register(Arc::new(EventLog { tx: Mutex::new(tx) }));
    rx
}

fn wait_for(rx: &Receiver<DiscoveryEvent>, mut done: impl FnMut(&DiscoveryEvent) -> bool) -> Vec<DiscoveryEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = rx
            .recv_timeout(left)
            .unwrap_or_else(|_| panic!("timed out; saw {:?}", seen));
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

fn counters(item: &LibraryItem) -> (u32, u32) {
    let container = item.as_container().unwrap();
    (container.tracks_count(), container.present_tracks_count())
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_construct_then_init_twice() {
    let h = harness();
    assert!(h.library.construct(&h.config));
    assert_eq!(h.library.init().unwrap(), InitResult::Success);
    assert_eq!(h.library.init().unwrap(), InitResult::AlreadyInitialized);
    assert!(h.library.is_initialized());
    assert!(!h.library.construct(&h.config), "construct after init is refused");
    assert!(h.config.media_artifacts_dir().is_dir());
}

#[test]
fn test_init_before_construct_is_an_error() {
    let h = harness();
    assert!(matches!(h.library.init(), Err(CoreError::NotConstructed)));
}

#[test]
fn test_construct_fails_closed_on_missing_directory() {
    let h = harness();
    let config = LibraryConfig::builder()
        .database_dir(h.dir.path().join("nowhere"))
        .media_dir(h.config.media_dir.clone())
        .build()
        .unwrap();
    assert!(!h.library.construct(&config));
    assert!(!h.library.is_initialized());
    assert!(h.library.get(1).is_none());
}

#[test]
fn test_legacy_thumbnails_are_removed() {
    let h = harness();
    let thumbs = h.config.legacy_thumbnails_dir();
    std::fs::create_dir_all(&thumbs).unwrap();
    std::fs::write(thumbs.join("cover.jpg"), b"jpeg").unwrap();

    assert!(h.library.construct(&h.config));
    let deadline = Instant::now() + Duration::from_secs(5);
    while thumbs.exists() {
        assert!(Instant::now() < deadline, "thumbnails still present");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_start_fires_ready_listeners_once() {
    let h = harness();
    let counter = Arc::new(ReadyCounter::default());
    h.library.notifier().ready().register(counter.clone());

    assert!(h.library.construct(&h.config));
    assert!(!h.library.start(), "start needs an initialized store");
    assert_eq!(counter.ready.load(Ordering::SeqCst), 0);

    h.library.init().unwrap();
    assert!(h.library.start());
    assert!(h.library.start());
    assert!(h.library.is_started());
    assert_eq!(counter.ready.load(Ordering::SeqCst), 1);
}

#[test]
fn test_release_twice_is_harmless() {
    let h = running();
    let media = h.library.add_media("/music/a.mp3", 1_000).unwrap();

    h.library.release();
    h.library.release();
    assert!(!h.library.is_initialized());
    assert!(h.library.get(media.id).is_none());
    assert!(!h.library.construct(&h.config));
    assert!(matches!(h.library.reload(), Err(CoreError::NotStarted)));
}

#[test]
fn test_unrecoverable_database_needs_reset() {
    let h = harness();
    std::fs::write(h.config.database_path(), vec![0xAAu8; 8_192]).unwrap();
    assert!(h.library.construct(&h.config));
    assert_eq!(h.library.init().unwrap(), InitResult::DbUnrecoverable);
    assert!(!h.library.start());

    assert_eq!(h.library.reset_database(), InitResult::Success);
    assert!(h.library.start());
}

// ============================================================================
// Media
// ============================================================================

#[test]
fn test_content_uris_are_never_resolved() {
    let h = running();
    h.library.add_media("/music/c.mp3", 1_000).unwrap();
    assert!(h.library.get_media_by_uri("/music/c.mp3").is_some());
    assert!(h
        .library
        .get_media_by_uri("content://media/external/audio/media/1")
        .is_none());
    assert!(h.library.add_media("content://media/external/audio/media/1", 0).is_err());
}

#[test]
fn test_playback_time_policy() {
    let h = running();
    let id = h.library.add_media("/music/long.mp3", 100_000).unwrap().id;
    let unknown = h.library.add_media("/music/stream.mp3", 0).unwrap().id;

    assert_eq!(h.library.set_playback_time(id, 0), PlaybackResult::Error);
    assert_eq!(h.library.set_playback_time(0, 10), PlaybackResult::Error);
    assert_eq!(h.library.set_playback_time(u64::MAX, 10), PlaybackResult::Error);
    assert_eq!(h.library.set_playback_time(id, 1_000), PlaybackResult::Begin);
    assert_eq!(h.library.set_playback_time(id, 50_000), PlaybackResult::AsIs);
    assert_eq!(h.library.set_playback_time(id, 99_000), PlaybackResult::End);
    assert_eq!(h.library.set_playback_time(id, u64::MAX), PlaybackResult::End);
    assert_eq!(h.library.set_playback_time(unknown, 42), PlaybackResult::AsIs);

    assert!(h.library.set_playback_position(id, 0.5));
    assert!(!h.library.set_playback_position(0, 0.5));
    assert_eq!(h.library.history().len(), 2);
}

#[test]
fn test_find_media_merges_transient_flags() {
    let h = running();
    let stored = h
        .library
        .add_media("/storage/emulated/0/Music/song.mp3", 1_000)
        .unwrap();

    let mut transient = LibraryItem::transient_media("file:///sdcard/Music/song.mp3");
    transient
        .as_media_mut()
        .unwrap()
        .flags
        .set(MediaFlags::FAVORITE, true);

    let found = h.library.find_media(transient);
    assert_eq!(found.id, stored.id);
    let flags = found.as_media().unwrap().flags;
    assert!(flags.contains(MediaFlags::FAVORITE));
    assert!(flags.contains(MediaFlags::EXTERNAL));

    let unknown = h
        .library
        .find_media(LibraryItem::transient_media("file:///music/none.mp3"));
    assert_eq!(unknown.id, 0);
}

// ============================================================================
// Discovery
// ============================================================================

#[test]
fn test_ban_twice_reports_failure() {
    let h = running();
    let events = listen(&h.library);

    h.library.ban_entry_point("/music").unwrap();
    h.library.ban_entry_point("/music").unwrap();

    let outcomes: Vec<bool> = wait_for(&events, |e| {
        matches!(e, DiscoveryEvent::EntryPointBanned { success: false, .. })
    })
    .into_iter()
    .filter_map(|e| match e {
        DiscoveryEvent::EntryPointBanned { success, .. } => Some(success),
        _ => None,
    })
    .collect();
    assert_eq!(outcomes, vec![true, false]);
    assert!(h.library.entry_points()[0].banned);
}

#[test]
fn test_vanished_track_lowers_present_counters_only() {
    let h = running();
    h.scanner.set("file:///music", &["first", "second"]);
    let events = listen(&h.library);

    h.library.add_entry_point("/music").unwrap();
    wait_for(&events, |e| *e == DiscoveryEvent::Completed);

    let params = QueryParams::default().with_missing();
    let query = h.library.query().unwrap();
    let artist = query
        .artists(&params)
        .into_iter()
        .find(|a| a.title == "Band")
        .unwrap();
    let genre = query
        .genres(&params)
        .into_iter()
        .find(|g| g.title == "Rock")
        .unwrap();
    assert_eq!(counters(&artist), (2, 2));
    assert_eq!(counters(&genre), (2, 2));

    h.scanner.set("file:///music", &["first"]);
    h.library.reload_entry_point("/music").unwrap();
    wait_for(&events, |e| {
        *e == DiscoveryEvent::ReloadCompleted {
            entry_point: Some("file:///music".into()),
        }
    });

    assert_eq!(counters(&h.library.get(artist.id).unwrap()), (2, 1));
    assert_eq!(counters(&h.library.get(genre.id).unwrap()), (2, 1));
    assert_eq!(h.library.audio(&QueryParams::default()).len(), 1);
    assert_eq!(h.library.audio(&params).len(), 2);
}

#[test]
fn test_blank_reload_is_rejected() {
    let h = running();
    assert!(matches!(
        h.library.reload_entry_point(""),
        Err(CoreError::Discovery(_))
    ));
    assert!(!h.library.is_working());
}
