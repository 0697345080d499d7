//! # Change Notification
//!
//! Fan-out of typed library events to registered listeners.
//!
//! ## Overview
//!
//! The [`ChangeNotifier`] owns one [`ListenerGroup`] per event family:
//!
//! - **Entity groups**: media, artist, genre, playlist, media group and
//!   bookmark listeners receive [`ChangeEvent`]s
//! - **History**: playback history changes
//! - **Discovery**: scan progress and entry-point management ([`DiscoveryEvent`])
//! - **Ready**: `on_library_ready` once started, `on_library_idle` whenever
//!   background work drains
//! - **Device**: mount/unmount of an entry point
//! - **Exception handler**: a single optional sink for internal failures
//!
//! ```text
//! ┌──────────────┐  notify_change   ┌────────────────┐  snapshot   ┌──────────┐
//! │ EntityStore  ├─────────────────>│                ├────────────>│ Listener │
//! └──────────────┘                  │ ChangeNotifier │             └──────────┘
//! ┌──────────────┐  notify_discovery│  (one lock per │  snapshot   ┌──────────┐
//! │ Discovery    ├─────────────────>│     group)     ├────────────>│ Listener │
//! └──────────────┘                  └────────────────┘             └──────────┘
//! ```
//!
//! ## Delivery guarantees
//!
//! - Registration is idempotent per `Arc` instance and unregistration is by
//!   identity ([`Arc::ptr_eq`]).
//! - Dispatch clones the group's listener list under a read lock, releases the
//!   lock, then calls every listener in registration order. A listener that
//!   registers or unregisters from inside a callback does not deadlock and
//!   does not change the in-flight delivery.
//! - Each group has its own lock, so a slow listener in one group never
//!   blocks dispatch in another.
//! - A panicking listener is isolated: the panic is logged, reported to the
//!   exception handler, and the remaining listeners still run.
//!
//! Events carry ids only; listeners that need the entity look it up.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::events::{ChangeEvent, ChangeListener, ChangeNotifier, EntityKind};
//! use std::sync::Arc;
//!
//! struct Printer;
//! impl ChangeListener for Printer {
//!     fn on_change(&self, event: &ChangeEvent) {
//!         println!("{:?} {:?} {:?}", event.entity, event.kind, event.ids);
//!     }
//! }
//!
//! let notifier = ChangeNotifier::new();
//! let listener: Arc<dyn ChangeListener> = Arc::new(Printer);
//! notifier.entity(EntityKind::Media).register(listener.clone());
//! notifier.notify_change(ChangeEvent::added(EntityKind::Media, vec![42]));
//! assert!(notifier.entity(EntityKind::Media).unregister(&listener));
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, trace};

// ============================================================================
// Event Types
// ============================================================================

/// Entity family a [`ChangeEvent`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Media,
    Artist,
    Genre,
    Playlist,
    MediaGroup,
    Bookmark,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Media,
        EntityKind::Artist,
        EntityKind::Genre,
        EntityKind::Playlist,
        EntityKind::MediaGroup,
        EntityKind::Bookmark,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Media => "media",
            EntityKind::Artist => "artist",
            EntityKind::Genre => "genre",
            EntityKind::Playlist => "playlist",
            EntityKind::MediaGroup => "media_group",
            EntityKind::Bookmark => "bookmark",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the entities of a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    /// A discovered media lost its entry point but was kept as an external
    /// media because it has playback history.
    ConvertedToExternal,
}

/// Change of one or more entities of the same kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub kind: ChangeKind,
    pub ids: Vec<u64>,
}

impl ChangeEvent {
    pub fn new(entity: EntityKind, kind: ChangeKind, ids: Vec<u64>) -> Self {
        Self { entity, kind, ids }
    }

    pub fn added(entity: EntityKind, ids: Vec<u64>) -> Self {
        Self::new(entity, ChangeKind::Added, ids)
    }

    pub fn modified(entity: EntityKind, ids: Vec<u64>) -> Self {
        Self::new(entity, ChangeKind::Modified, ids)
    }

    pub fn deleted(entity: EntityKind, ids: Vec<u64>) -> Self {
        Self::new(entity, ChangeKind::Deleted, ids)
    }

    pub fn converted_to_external(ids: Vec<u64>) -> Self {
        Self::new(EntityKind::Media, ChangeKind::ConvertedToExternal, ids)
    }
}

/// Events raised by the discovery worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum DiscoveryEvent {
    /// A discovery pass started.
    Started,
    /// An entry point is being listed.
    Progress { entry_point: String },
    /// Every queued entry point has been processed.
    Completed,
    /// An entry point could not be listed, or some of its files failed to parse.
    Failed { entry_point: String },
    /// A reload was accepted (`None` means every entry point).
    ReloadStarted { entry_point: Option<String> },
    ReloadCompleted { entry_point: Option<String> },
    /// Parsed files versus files scheduled so far. Both counters only grow
    /// within a pass.
    ParsingStats { done: u32, scheduled: u32 },
    EntryPointBanned { entry_point: String, success: bool },
    EntryPointUnbanned { entry_point: String, success: bool },
    EntryPointAdded { entry_point: String, success: bool },
    EntryPointRemoved { entry_point: String, success: bool },
}

impl DiscoveryEvent {
    /// Routes the event to the matching `on_*` method of `listener`.
    pub fn deliver_to<L: DiscoveryListener + ?Sized>(&self, listener: &L) {
        match self {
            DiscoveryEvent::Started => listener.on_discovery_started(),
            DiscoveryEvent::Progress { entry_point } => {
                listener.on_discovery_progress(entry_point)
            }
            DiscoveryEvent::Completed => listener.on_discovery_completed(),
            DiscoveryEvent::Failed { entry_point } => listener.on_discovery_failed(entry_point),
            DiscoveryEvent::ReloadStarted { entry_point } => {
                listener.on_reload_started(entry_point.as_deref())
            }
            DiscoveryEvent::ReloadCompleted { entry_point } => {
                listener.on_reload_completed(entry_point.as_deref())
            }
            DiscoveryEvent::ParsingStats { done, scheduled } => {
                listener.on_parsing_stats(*done, *scheduled)
            }
            DiscoveryEvent::EntryPointBanned {
                entry_point,
                success,
            } => listener.on_entry_point_banned(entry_point, *success),
            DiscoveryEvent::EntryPointUnbanned {
                entry_point,
                success,
            } => listener.on_entry_point_unbanned(entry_point, *success),
            DiscoveryEvent::EntryPointAdded {
                entry_point,
                success,
            } => listener.on_entry_point_added(entry_point, *success),
            DiscoveryEvent::EntryPointRemoved {
                entry_point,
                success,
            } => listener.on_entry_point_removed(entry_point, *success),
        }
    }
}

// ============================================================================
// Listener Traits
// ============================================================================

/// Receives entity changes of the group it is registered in.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

/// Notified when a media's playback history changed.
pub trait HistoryListener: Send + Sync {
    fn on_history_changed(&self, media_id: u64);
}

/// Discovery callbacks. Every method has an empty default so listeners only
/// implement what they care about; overriding [`on_discovery_event`] receives
/// everything at once.
///
/// [`on_discovery_event`]: DiscoveryListener::on_discovery_event
pub trait DiscoveryListener: Send + Sync {
    fn on_discovery_event(&self, event: &DiscoveryEvent) {
        event.deliver_to(self);
    }

    fn on_discovery_started(&self) {}
    fn on_discovery_progress(&self, _entry_point: &str) {}
    fn on_discovery_completed(&self) {}
    fn on_discovery_failed(&self, _entry_point: &str) {}
    fn on_reload_started(&self, _entry_point: Option<&str>) {}
    fn on_reload_completed(&self, _entry_point: Option<&str>) {}
    fn on_parsing_stats(&self, _done: u32, _scheduled: u32) {}
    fn on_entry_point_banned(&self, _entry_point: &str, _success: bool) {}
    fn on_entry_point_unbanned(&self, _entry_point: &str, _success: bool) {}
    fn on_entry_point_added(&self, _entry_point: &str, _success: bool) {}
    fn on_entry_point_removed(&self, _entry_point: &str, _success: bool) {}
}

pub trait ReadyListener: Send + Sync {
    /// Fired once, synchronously, by the first `start()`.
    fn on_library_ready(&self);

    /// Fired whenever background work transitions to idle.
    fn on_library_idle(&self) {}
}

pub trait DeviceListener: Send + Sync {
    fn on_device_changed(&self, entry_point: &str, mounted: bool);
}

/// Sink for failures nobody else can handle.
pub trait ExceptionHandler: Send + Sync {
    fn on_unhandled_exception(&self, context: &str, message: &str, clear_suggested: bool);
}

// ============================================================================
// Listener Groups
// ============================================================================

/// Ordered, identity-keyed set of listeners with its own lock.
pub struct ListenerGroup<L: ?Sized> {
    name: &'static str,
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerGroup<L> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Adds `listener` at the end of the group. Returns `false` if this exact
    /// instance is already registered.
    pub fn register(&self, listener: Arc<L>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removes `listener`. Returns `false` if it was not registered.
    pub fn unregister(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.read().clone()
    }
}

impl<L: ?Sized> fmt::Debug for ListenerGroup<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGroup")
            .field("name", &self.name)
            .field("listeners", &self.len())
            .finish()
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Owner of every listener group plus the published busy state.
pub struct ChangeNotifier {
    media: ListenerGroup<dyn ChangeListener>,
    artists: ListenerGroup<dyn ChangeListener>,
    genres: ListenerGroup<dyn ChangeListener>,
    playlists: ListenerGroup<dyn ChangeListener>,
    media_groups: ListenerGroup<dyn ChangeListener>,
    bookmarks: ListenerGroup<dyn ChangeListener>,
    history: ListenerGroup<dyn HistoryListener>,
    discovery: ListenerGroup<dyn DiscoveryListener>,
    ready: ListenerGroup<dyn ReadyListener>,
    devices: ListenerGroup<dyn DeviceListener>,
    exception_handler: RwLock<Option<Arc<dyn ExceptionHandler>>>,
    working: AtomicBool,
    state_tx: watch::Sender<bool>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(false);
        Self {
            media: ListenerGroup::new("media"),
            artists: ListenerGroup::new("artist"),
            genres: ListenerGroup::new("genre"),
            playlists: ListenerGroup::new("playlist"),
            media_groups: ListenerGroup::new("media_group"),
            bookmarks: ListenerGroup::new("bookmark"),
            history: ListenerGroup::new("history"),
            discovery: ListenerGroup::new("discovery"),
            ready: ListenerGroup::new("ready"),
            devices: ListenerGroup::new("device"),
            exception_handler: RwLock::new(None),
            working: AtomicBool::new(false),
            state_tx,
        }
    }

    /// Listener group for one entity family.
    pub fn entity(&self, kind: EntityKind) -> &ListenerGroup<dyn ChangeListener> {
        match kind {
            EntityKind::Media => &self.media,
            EntityKind::Artist => &self.artists,
            EntityKind::Genre => &self.genres,
            EntityKind::Playlist => &self.playlists,
            EntityKind::MediaGroup => &self.media_groups,
            EntityKind::Bookmark => &self.bookmarks,
        }
    }

    pub fn history(&self) -> &ListenerGroup<dyn HistoryListener> {
        &self.history
    }

    pub fn discovery(&self) -> &ListenerGroup<dyn DiscoveryListener> {
        &self.discovery
    }

    pub fn ready(&self) -> &ListenerGroup<dyn ReadyListener> {
        &self.ready
    }

    pub fn devices(&self) -> &ListenerGroup<dyn DeviceListener> {
        &self.devices
    }

    pub fn set_exception_handler(&self, handler: Option<Arc<dyn ExceptionHandler>>) {
        *self.exception_handler.write() = handler;
    }

    /// Delivers an entity change. Events without ids are dropped.
    pub fn notify_change(&self, event: ChangeEvent) {
        if event.ids.is_empty() {
            return;
        }
        trace!(entity = %event.entity, kind = ?event.kind, count = event.ids.len(), "Dispatching change");
        self.dispatch(self.entity(event.entity), "on_change", |l| l.on_change(&event));
    }

    pub fn notify_history_changed(&self, media_id: u64) {
        self.dispatch(&self.history, "on_history_changed", |l| {
            l.on_history_changed(media_id)
        });
    }

    pub fn notify_discovery(&self, event: DiscoveryEvent) {
        trace!(?event, "Dispatching discovery event");
        self.dispatch(&self.discovery, "on_discovery_event", |l| {
            l.on_discovery_event(&event)
        });
    }

    pub fn notify_ready(&self) {
        self.dispatch(&self.ready, "on_library_ready", |l| l.on_library_ready());
    }

    pub fn notify_device_changed(&self, entry_point: &str, mounted: bool) {
        self.dispatch(&self.devices, "on_device_changed", |l| {
            l.on_device_changed(entry_point, mounted)
        });
    }

    /// Forwards an internal failure to the exception handler, if any.
    pub fn report_exception(&self, context: &str, message: &str, clear_suggested: bool) {
        error!(context, error = message, clear_suggested, "Unhandled library exception");
        let handler = self.exception_handler.read().clone();
        if let Some(handler) = handler {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                handler.on_unhandled_exception(context, message, clear_suggested)
            }));
            if let Err(payload) = outcome {
                error!(context, panic = %panic_message(payload.as_ref()), "Exception handler panicked");
            }
        }
    }

    /// Updates the busy flag. Transitions publish the new value; going idle
    /// also fires `on_library_idle`.
    pub fn set_working(&self, working: bool) {
        let previous = self.working.swap(working, Ordering::SeqCst);
        if previous == working {
            return;
        }
        debug!(working, "Library busy state changed");
        self.state_tx.send_replace(working);
        if !working {
            self.dispatch(&self.ready, "on_library_idle", |l| l.on_library_idle());
        }
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// Observable busy state, for UI binding.
    pub fn subscribe_state(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Drops every listener and the exception handler.
    pub fn clear(&self) {
        for kind in EntityKind::ALL {
            self.entity(kind).clear();
        }
        self.history.clear();
        self.discovery.clear();
        self.ready.clear();
        self.devices.clear();
        *self.exception_handler.write() = None;
    }

    fn dispatch<L, F>(&self, group: &ListenerGroup<L>, callback: &str, f: F)
    where
        L: ?Sized,
        F: Fn(&L),
    {
        for listener in group.snapshot() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(listener.as_ref())));
            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                error!(group = group.name(), callback, panic = %message, "Listener panicked");
                self.report_exception(&format!("{}::{}", group.name(), callback), &message, false);
            }
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("working", &self.is_working())
            .field("media", &self.media.len())
            .field("discovery", &self.discovery.len())
            .field("ready", &self.ready.len())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
