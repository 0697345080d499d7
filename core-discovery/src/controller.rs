//! # Discovery Controller
//!
//! Drives the scan and parse lifecycle of every registered entry point on a
//! dedicated worker thread.
//!
//! ## Overview
//!
//! Public calls are fire-and-forget: they validate their argument, post a
//! [`Command`] to the worker and return. Outcomes are observed later through
//! [`DiscoveryEvent`]s delivered by the [`ChangeNotifier`].
//!
//! ## Workflow
//!
//! 1. A reload, rescan, unban, mount or new entry point schedules a scan task
//!    per entry point and bumps its generation, superseding queued work
//! 2. Scanning lists the files, marks vanished media as missing and schedules
//!    one parse task per new or modified file
//! 3. Parse tasks feed the [`EntityStore`]; failures are remembered for
//!    [`retry_parser`](DiscoveryController::retry_parser)
//! 4. Parsing stats are published every `progress_tick` files and when the
//!    queue drains
//!
//! Between two tasks the worker drains its command channel, so pause, ban and
//! shutdown take effect without waiting for a pass to finish.

use crate::state::{DiscoveryState, EntryPointState, ParsingProgress};
use crate::{DiscoveryError, Result};
use bridge_traits::mrl::encode_mrl;
use bridge_traits::scanner::{DiscoveredFile, MediaScanner};
use core_library::EntityStore;
use core_runtime::config::DiscoverySettings;
use core_runtime::events::{ChangeNotifier, DiscoveryEvent};
use core_runtime::logging::strip_path;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, instrument, warn};

/// Requests accepted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reload(Option<String>),
    ForceRescan,
    RetryParser,
    Pause,
    Resume,
    Ban(String),
    Unban(String),
    AddEntryPoint(String),
    RemoveEntryPoint(String),
    DeviceChanged { entry_point: String, mounted: bool },
    Shutdown,
}

type SharedStates = Arc<RwLock<BTreeMap<String, EntryPointState>>>;

/// Handle on the discovery worker.
pub struct DiscoveryController {
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    states: SharedStates,
    paused: Arc<AtomicBool>,
}

impl DiscoveryController {
    /// Spawn the worker thread.
    ///
    /// Entry points already registered in the store are known but not
    /// scanned until the first reload.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    #[instrument(skip_all, fields(worker = %settings.worker_name))]
    pub fn start(
        store: Arc<EntityStore>,
        scanner: Arc<dyn MediaScanner>,
        notifier: Arc<ChangeNotifier>,
        settings: &DiscoverySettings,
    ) -> Result<Self> {
        let states: SharedStates = Arc::new(RwLock::new(
            store
                .entry_points()
                .into_iter()
                .map(|record| {
                    let mut state = EntryPointState::new(record.mrl.clone());
                    state.banned = record.banned;
                    (record.mrl, state)
                })
                .collect(),
        ));
        let paused = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            store,
            scanner,
            notifier,
            states: states.clone(),
            paused: paused.clone(),
            progress_tick: settings.progress_tick,
            queue: VecDeque::new(),
            outstanding: HashMap::new(),
            parse_failures: BTreeMap::new(),
            failed_in_pass: BTreeSet::new(),
            progress: ParsingProgress::default(),
            batch_active: false,
            pending_reloads: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name(settings.worker_name.clone())
            .spawn(move || worker.run(rx))?;

        info!("Discovery worker spawned");
        Ok(Self {
            commands: tx,
            worker: Mutex::new(Some(handle)),
            states,
            paused,
        })
    }

    /// Rediscover every registered entry point.
    pub fn reload(&self) -> Result<()> {
        self.send(Command::Reload(None))
    }

    /// Rediscover one entry point. An empty argument is rejected and changes
    /// nothing.
    pub fn reload_entry_point(&self, entry_point: &str) -> Result<()> {
        let mrl = normalize(entry_point)?;
        self.send(Command::Reload(Some(mrl)))
    }

    /// Forget cached parse results and rediscover everything.
    pub fn force_rescan(&self) -> Result<()> {
        self.send(Command::ForceRescan)
    }

    /// Parse again only the files that failed.
    pub fn retry_parser(&self) -> Result<()> {
        self.send(Command::RetryParser)
    }

    /// Suspend the worker. A no-op when nothing is queued.
    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub fn ban(&self, entry_point: &str) -> Result<()> {
        let mrl = normalize(entry_point)?;
        self.send(Command::Ban(mrl))
    }

    pub fn unban(&self, entry_point: &str) -> Result<()> {
        let mrl = normalize(entry_point)?;
        self.send(Command::Unban(mrl))
    }

    pub fn add_entry_point(&self, entry_point: &str) -> Result<()> {
        let mrl = normalize(entry_point)?;
        self.send(Command::AddEntryPoint(mrl))
    }

    pub fn remove_entry_point(&self, entry_point: &str) -> Result<()> {
        let mrl = normalize(entry_point)?;
        self.send(Command::RemoveEntryPoint(mrl))
    }

    /// The device holding `entry_point` was mounted or unmounted.
    pub fn device_changed(&self, entry_point: &str, mounted: bool) -> Result<()> {
        let entry_point = normalize(entry_point)?;
        self.send(Command::DeviceChanged {
            entry_point,
            mounted,
        })
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn state_of(&self, entry_point: &str) -> Option<DiscoveryState> {
        let mrl = encode_mrl(entry_point)?;
        self.states.read().get(&mrl).map(|s| s.state)
    }

    pub fn entry_point_states(&self) -> Vec<EntryPointState> {
        self.states.read().values().cloned().collect()
    }

    /// Stop the worker and wait for it. Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if self.commands.send(Command::Shutdown).is_err() {
            debug!("Discovery worker already gone; joining");
        }
        if handle.join().is_err() {
            warn!("Discovery worker panicked");
        }
        info!("Discovery worker joined");
    }

    fn send(&self, command: Command) -> Result<()> {
        debug!(?command, "Posting discovery command");
        self.commands.send(command).map_err(|_| DiscoveryError::Stopped)
    }
}

impl Drop for DiscoveryController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DiscoveryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryController")
            .field("entry_points", &self.states.read().len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

fn normalize(entry_point: &str) -> Result<String> {
    encode_mrl(entry_point).ok_or_else(|| DiscoveryError::InvalidEntryPoint(entry_point.to_string()))
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug)]
enum Task {
    Scan {
        entry_point: String,
        generation: u64,
        force: bool,
    },
    Parse {
        entry_point: String,
        generation: u64,
        file: DiscoveredFile,
    },
}

impl Task {
    fn entry_point(&self) -> &str {
        match self {
            Task::Scan { entry_point, .. } | Task::Parse { entry_point, .. } => entry_point,
        }
    }
}

struct Worker {
    store: Arc<EntityStore>,
    scanner: Arc<dyn MediaScanner>,
    notifier: Arc<ChangeNotifier>,
    states: SharedStates,
    paused: Arc<AtomicBool>,
    progress_tick: u32,
    queue: VecDeque<Task>,
    /// Queued tasks per entry point for its current generation.
    outstanding: HashMap<String, usize>,
    /// Files whose last parse failed, by entry point then file MRL.
    parse_failures: BTreeMap<String, BTreeMap<String, DiscoveredFile>>,
    failed_in_pass: BTreeSet<String>,
    progress: ParsingProgress,
    batch_active: bool,
    pending_reloads: Vec<Option<String>>,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("Discovery worker running");
        loop {
            let waiting = self.queue.is_empty() || self.paused.load(Ordering::SeqCst);
            let command = if waiting {
                match rx.blocking_recv() {
                    Some(command) => Some(command),
                    None => break,
                }
            } else {
                match rx.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            };

            match command {
                Some(Command::Shutdown) => break,
                Some(command) => self.handle(command),
                None => self.step(),
            }
            self.settle();
        }

        if self.batch_active {
            self.notifier.set_working(false);
        }
        debug!("Discovery worker stopped");
    }

    fn emit(&self, event: DiscoveryEvent) {
        self.notifier.notify_discovery(event);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle(&mut self, command: Command) {
        match command {
            Command::Reload(scope) => {
                self.emit(DiscoveryEvent::ReloadStarted {
                    entry_point: scope.clone(),
                });
                match &scope {
                    Some(mrl) => self.schedule_scan(mrl, false),
                    None => self.schedule_all(false),
                }
                self.pending_reloads.push(scope);
            }
            Command::ForceRescan => {
                info!("Forced rescan requested");
                self.parse_failures.clear();
                self.schedule_all(true);
            }
            Command::RetryParser => self.retry_failed_parses(),
            Command::Pause => {
                if self.queue.is_empty() {
                    debug!("Pause ignored while idle");
                } else if !self.paused.swap(true, Ordering::SeqCst) {
                    info!(queued = self.queue.len(), "Discovery paused");
                }
            }
            Command::Resume => {
                if self.paused.swap(false, Ordering::SeqCst) {
                    info!(queued = self.queue.len(), "Discovery resumed");
                }
            }
            Command::Ban(mrl) => {
                let success = self.store.set_entry_point_banned(&mrl, true);
                if success {
                    self.drop_tasks(&mrl);
                    let mut states = self.states.write();
                    let state = states
                        .entry(mrl.clone())
                        .or_insert_with(|| EntryPointState::new(mrl.clone()));
                    state.banned = true;
                    if state.state == DiscoveryState::Discovering {
                        state.fail().ok();
                    }
                }
                info!(entry_point = %strip_path(&mrl), success, "Entry point banned");
                self.emit(DiscoveryEvent::EntryPointBanned {
                    entry_point: mrl,
                    success,
                });
            }
            Command::Unban(mrl) => {
                let success = self.store.set_entry_point_banned(&mrl, false);
                if success {
                    if let Some(state) = self.states.write().get_mut(&mrl) {
                        state.banned = false;
                    }
                    self.schedule_scan(&mrl, false);
                }
                info!(entry_point = %strip_path(&mrl), success, "Entry point unbanned");
                self.emit(DiscoveryEvent::EntryPointUnbanned {
                    entry_point: mrl,
                    success,
                });
            }
            Command::AddEntryPoint(mrl) => {
                let success = self.store.add_entry_point(&mrl);
                if success {
                    self.states
                        .write()
                        .insert(mrl.clone(), EntryPointState::new(mrl.clone()));
                    self.schedule_scan(&mrl, false);
                }
                self.emit(DiscoveryEvent::EntryPointAdded {
                    entry_point: mrl,
                    success,
                });
            }
            Command::RemoveEntryPoint(mrl) => {
                let success = self.store.remove_entry_point_record(&mrl);
                if success {
                    self.drop_tasks(&mrl);
                    self.parse_failures.remove(&mrl);
                    self.states.write().remove(&mrl);
                    let (deleted, converted) = self.store.remove_entry_point_media(&mrl);
                    debug!(deleted, converted, "Entry point media collected");
                }
                self.emit(DiscoveryEvent::EntryPointRemoved {
                    entry_point: mrl,
                    success,
                });
            }
            Command::DeviceChanged {
                entry_point,
                mounted,
            } => {
                let toggled = self.store.set_entry_point_presence(&entry_point, mounted);
                info!(entry_point = %strip_path(&entry_point), mounted, toggled, "Device changed");
                if !mounted {
                    self.drop_tasks(&entry_point);
                }
                self.notifier.notify_device_changed(&entry_point, mounted);
                if mounted && self.states.read().contains_key(&entry_point) {
                    self.schedule_scan(&entry_point, false);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn schedule_all(&mut self, force: bool) {
        let targets: Vec<String> = self
            .store
            .entry_points()
            .into_iter()
            .filter(|ep| !ep.banned && ep.present)
            .map(|ep| ep.mrl)
            .collect();
        for mrl in targets {
            self.schedule_scan(&mrl, force);
        }
    }

    /// Queue a scan of `mrl`, superseding whatever is queued for it.
    fn schedule_scan(&mut self, mrl: &str, force: bool) {
        let known = self.store.entry_point(mrl);
        if known.as_ref().is_some_and(|ep| ep.banned || !ep.present) {
            debug!(entry_point = %strip_path(mrl), "Skipping banned or unmounted entry point");
            return;
        }
        if known.is_none() {
            warn!(entry_point = %strip_path(mrl), "Reload of an unknown entry point ignored");
            return;
        }

        let generation = {
            let mut states = self.states.write();
            let state = states
                .entry(mrl.to_string())
                .or_insert_with(|| EntryPointState::new(mrl));
            match state.begin() {
                Ok(generation) => generation,
                Err(err) => {
                    debug!(error = %err, "Scan not scheduled");
                    return;
                }
            }
        };
        self.drop_tasks(mrl);
        self.queue.push_back(Task::Scan {
            entry_point: mrl.to_string(),
            generation,
            force,
        });
        self.outstanding.insert(mrl.to_string(), 1);
        self.failed_in_pass.remove(mrl);
        // The new pass lists every file again and records fresh failures.
        self.parse_failures.remove(mrl);
    }

    fn retry_failed_parses(&mut self) {
        let failures = std::mem::take(&mut self.parse_failures);
        for (mrl, files) in failures {
            if files.is_empty() {
                continue;
            }
            let generation = self
                .states
                .write()
                .get_mut(&mrl)
                .filter(|state| !state.banned)
                .and_then(|state| state.retry().ok().map(|_| state.generation));
            let Some(generation) = generation else {
                // Keep them for a later retry.
                self.parse_failures.insert(mrl, files);
                continue;
            };
            info!(entry_point = %strip_path(&mrl), files = files.len(), "Retrying failed parses");
            self.failed_in_pass.remove(&mrl);
            self.progress.schedule(files.len() as u32);
            *self.outstanding.entry(mrl.clone()).or_default() += files.len();
            for file in files.into_values() {
                self.queue.push_back(Task::Parse {
                    entry_point: mrl.clone(),
                    generation,
                    file,
                });
            }
        }
    }

    /// Remove queued tasks of `mrl`. Dropped parses count as done for
    /// progress; scans were never scheduled there.
    fn drop_tasks(&mut self, mrl: &str) {
        let mut dropped_parses = 0;
        self.queue.retain(|task| match task {
            Task::Parse { entry_point, .. } if entry_point == mrl => {
                dropped_parses += 1;
                false
            }
            task => task.entry_point() != mrl,
        });
        for _ in 0..dropped_parses {
            self.progress.finish_one(0);
        }
        self.outstanding.remove(mrl);
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    fn step(&mut self) {
        let Some(task) = self.queue.pop_front() else {
            return;
        };
        match task {
            Task::Scan {
                entry_point,
                generation,
                force,
            } => self.scan(&entry_point, generation, force),
            Task::Parse {
                entry_point,
                generation,
                file,
            } => self.parse(&entry_point, generation, file),
        }
    }

    fn is_current(&self, mrl: &str, generation: u64) -> bool {
        self.states
            .read()
            .get(mrl)
            .is_some_and(|s| s.is_current(generation))
    }

    fn scan(&mut self, mrl: &str, generation: u64, force: bool) {
        if !self.is_current(mrl, generation) {
            return;
        }
        self.emit(DiscoveryEvent::Progress {
            entry_point: mrl.to_string(),
        });

        let files = match self.scanner.list_files(mrl) {
            Ok(files) => files,
            Err(err) => {
                warn!(entry_point = %strip_path(mrl), error = %err, "Entry point listing failed");
                self.outstanding.remove(mrl);
                self.finish_entry_point(mrl, false);
                return;
            }
        };

        let listed: BTreeSet<&str> = files.iter().map(|f| f.mrl.as_str()).collect();
        let missing: Vec<u64> = self
            .store
            .media_under(mrl)
            .into_iter()
            .filter(|(_, media_mrl)| !listed.contains(media_mrl.as_str()))
            .map(|(id, _)| id)
            .collect();
        self.store.set_media_presence(&missing, false);

        let mut unchanged = Vec::new();
        let mut to_parse = Vec::new();
        for file in &files {
            if !force && self.store.is_up_to_date(&file.mrl, file.modified_at) {
                if let Some(item) = self.store.media_by_mrl(&file.mrl) {
                    unchanged.push(item.id);
                }
            } else {
                to_parse.push(file.clone());
            }
        }
        self.store.set_media_presence(&unchanged, true);

        if let Some(state) = self.states.write().get_mut(mrl) {
            state.stats.listed = files.len() as u32;
            state.stats.unchanged = unchanged.len() as u32;
            state.stats.missing = missing.len() as u32;
        }
        debug!(
            entry_point = %strip_path(mrl),
            listed = files.len(),
            to_parse = to_parse.len(),
            missing = missing.len(),
            "Entry point listed"
        );

        self.progress.schedule(to_parse.len() as u32);
        self.outstanding.insert(mrl.to_string(), to_parse.len());
        for file in to_parse {
            self.queue.push_back(Task::Parse {
                entry_point: mrl.to_string(),
                generation,
                file,
            });
        }
        if self.outstanding.get(mrl).copied() == Some(0) {
            self.outstanding.remove(mrl);
            self.finish_entry_point(mrl, true);
        }
    }

    fn parse(&mut self, mrl: &str, generation: u64, file: DiscoveredFile) {
        if self.is_current(mrl, generation) {
            self.parse_current(mrl, file);
        }
        // Reported once the store holds the result.
        if self.progress.finish_one(self.progress_tick) {
            self.emit(DiscoveryEvent::ParsingStats {
                done: self.progress.done,
                scheduled: self.progress.scheduled,
            });
        }
    }

    fn parse_current(&mut self, mrl: &str, file: DiscoveredFile) {
        let parsed = match self.scanner.parse(&file) {
            Ok(parsed) => self.store.upsert_discovered(mrl, &file, &parsed).is_some(),
            Err(err) => {
                let target = err.mrl().unwrap_or(&file.mrl);
                warn!(file = %strip_path(target), error = %err, "Parse failed");
                false
            }
        };
        if let Some(state) = self.states.write().get_mut(mrl) {
            if parsed {
                state.stats.parsed += 1;
            } else {
                state.stats.failed += 1;
            }
        }
        if parsed {
            if let Some(failures) = self.parse_failures.get_mut(mrl) {
                failures.remove(&file.mrl);
            }
        } else {
            self.failed_in_pass.insert(mrl.to_string());
            self.parse_failures
                .entry(mrl.to_string())
                .or_default()
                .insert(file.mrl.clone(), file);
        }

        let remaining = self.outstanding.get_mut(mrl).map(|count| {
            *count = count.saturating_sub(1);
            *count
        });
        if remaining == Some(0) {
            self.outstanding.remove(mrl);
            let clean = !self.failed_in_pass.remove(mrl);
            self.finish_entry_point(mrl, clean);
        }
    }

    fn finish_entry_point(&mut self, mrl: &str, success: bool) {
        if let Some(state) = self.states.write().get_mut(mrl) {
            let outcome = if success { state.complete() } else { state.fail() };
            if let Err(err) = outcome {
                debug!(error = %err, "Entry point already settled");
            }
        }
        if success {
            info!(entry_point = %strip_path(mrl), "Entry point discovered");
        } else {
            self.emit(DiscoveryEvent::Failed {
                entry_point: mrl.to_string(),
            });
        }
    }

    // ------------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------------

    /// Open or close the busy window after every command or task.
    fn settle(&mut self) {
        if !self.queue.is_empty() && !self.batch_active {
            self.batch_active = true;
            self.notifier.set_working(true);
            self.emit(DiscoveryEvent::Started);
        }
        if self.queue.is_empty() && self.batch_active {
            self.batch_active = false;
            self.paused.store(false, Ordering::SeqCst);
            self.emit(DiscoveryEvent::ParsingStats {
                done: self.progress.done,
                scheduled: self.progress.scheduled,
            });
            self.progress.reset();
            self.emit(DiscoveryEvent::Completed);
            self.notifier.set_working(false);
        }
        if !self.batch_active {
            self.flush_reloads();
        }
    }

    fn flush_reloads(&mut self) {
        for scope in std::mem::take(&mut self.pending_reloads) {
            self.emit(DiscoveryEvent::ReloadCompleted { entry_point: scope });
        }
    }
}
