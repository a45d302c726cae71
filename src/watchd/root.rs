//! A watched root and its IO thread.
//!
//! Each root owns a kernel notification source, an in-memory [`View`], and a
//! [`CookieSync`]. A dedicated thread drains notifications, buffers them while
//! watchers are paused, and applies them in settled batches under a
//! [`DeliveryPermit`](super::pause::DeliveryPermit). Crawls run on the same
//! thread but bypass the pause gate.

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backend::notifier::{NotifySource, RawChange};
use crate::backend::walker::{self, EntryKind, WalkEntry};
use crate::error::{WatchdError, WatchdResult};
use crate::watchd::clock::ClockToken;
use crate::watchd::config::WatchdWatcherConfig;
use crate::watchd::cookie::{CookieSync, CrawlSettlement};
use crate::watchd::pause::PauseController;
use crate::watchd::states::StateTable;
use crate::watchd::subscription::Subscription;
use crate::watchd::util;
use crate::watchd::view::View;

const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct RootSettings {
    pub settle: Duration,
    pub batch_limit: usize,
}

impl From<&WatchdWatcherConfig> for RootSettings {
    fn from(cfg: &WatchdWatcherConfig) -> Self {
        Self {
            settle: Duration::from_millis(cfg.settle_ms.max(1)),
            batch_limit: cfg.batch_limit.max(1),
        }
    }
}

#[derive(Debug)]
enum RootCommand {
    Recrawl { reason: String },
    Wake,
    Stop,
}

pub struct Root {
    path: PathBuf,
    number: u64,
    settings: RootSettings,
    pause: Arc<PauseController>,
    cookies: CookieSync,
    view: RwLock<View>,
    states: StateTable,
    subscribers: Mutex<Vec<Weak<Subscription>>>,
    cancelled: AtomicBool,
    commands: Sender<RootCommand>,
    notifier: Mutex<Option<NotifySource>>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    updates: Mutex<u64>,
    updated: Condvar,
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root")
            .field("path", &self.path)
            .field("number", &self.number)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Root {
    /// Start watching `path`: subscribe to notifications, run the initial
    /// crawl synchronously, then hand off to the IO thread.
    ///
    /// The initial crawl ignores the pause state, so a `watch` issued while
    /// watchers are paused still reflects what is on disk.
    pub fn start(
        path: PathBuf,
        number: u64,
        pause: Arc<PauseController>,
        settings: RootSettings,
    ) -> WatchdResult<Arc<Root>> {
        let (change_tx, change_rx) = crossbeam_channel::unbounded();
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let notifier =
            NotifySource::start(&path, change_tx).map_err(|err| WatchdError::RootResolve {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;

        let root = Arc::new(Root {
            cookies: CookieSync::new(&path),
            path,
            number,
            settings,
            pause,
            view: RwLock::new(View::default()),
            states: StateTable::default(),
            subscribers: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            commands: command_tx,
            notifier: Mutex::new(Some(notifier)),
            io_thread: Mutex::new(None),
            updates: Mutex::new(0),
            updated: Condvar::new(),
        });

        root.crawl("initial crawl", false)?;

        let worker = Arc::clone(&root);
        let handle = thread::Builder::new()
            .name(format!("watchd-io-{number}"))
            .spawn(move || worker.io_loop(change_rx, command_rx))?;
        *root.io_thread.lock() = Some(handle);

        tracing::info!(root = %root.path.display(), number, "watch established");
        Ok(root)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cookies(&self) -> &CookieSync {
        &self.cookies
    }

    pub fn pause(&self) -> &PauseController {
        &self.pause
    }

    pub fn states(&self) -> &StateTable {
        &self.states
    }

    pub fn generation(&self) -> u64 {
        self.cookies.generation()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn view(&self) -> RwLockReadGuard<'_, View> {
        self.view.read()
    }

    /// Clock token for whatever the view currently reflects.
    pub fn clock(&self) -> ClockToken {
        self.token_at(self.view.read().ticks())
    }

    pub fn token_at(&self, ticks: u64) -> ClockToken {
        ClockToken {
            start_epoch_secs: util::process_start_epoch_secs(),
            pid: std::process::id(),
            root_number: self.number,
            ticks,
        }
    }

    /// Queue a full recrawl on the IO thread. Completion is signalled by a
    /// generation bump and cookie settlement.
    pub fn request_recrawl(&self, reason: &str) -> WatchdResult<()> {
        if self.is_cancelled() {
            return Err(WatchdError::NotWatched(self.path.display().to_string()));
        }
        self.commands
            .send(RootCommand::Recrawl {
                reason: reason.to_string(),
            })
            .map_err(|_| WatchdError::Shutdown)
    }

    pub fn abort_cookies(&self) -> usize {
        let aborted = self.cookies.abort_all();
        tracing::info!(root = %self.path.display(), aborted, "aborted pending cookies");
        aborted
    }

    /// Nudge the IO thread so buffered changes are applied without waiting
    /// for the idle poll.
    pub fn wake(&self) {
        let _ = self.commands.send(RootCommand::Wake);
    }

    /// Counter bumped every time the view may have changed.
    pub fn update_count(&self) -> u64 {
        *self.updates.lock()
    }

    /// Block until the update counter moves past `seen` or `timeout` passes.
    pub fn wait_for_update(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut updates = self.updates.lock();
        while *updates == seen && !self.is_cancelled() {
            if self.updated.wait_until(&mut updates, deadline).timed_out() {
                break;
            }
        }
        *updates
    }

    fn publish(&self) {
        let mut updates = self.updates.lock();
        *updates += 1;
        self.updated.notify_all();
    }

    pub fn add_subscriber(&self, sub: &Arc<Subscription>) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.push(Arc::downgrade(sub));
    }

    pub fn subscribers(&self) -> Vec<Arc<Subscription>> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|sub| !sub.is_cancelled())
            .collect()
    }

    /// Walk the whole tree and make the view match it.
    ///
    /// Cookie markers found on disk are reported as observed. With
    /// `supersede`, cookies that predate this crawl and were not found are
    /// aborted.
    fn crawl(&self, reason: &str, supersede: bool) -> WatchdResult<CrawlSettlement> {
        let generation = self.cookies.begin_crawl();
        let started = Instant::now();
        let listing = match walker::walk(&self.path) {
            Ok(listing) => listing,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    self.cancel("root directory was removed");
                    return Err(WatchdError::NotWatched(self.path.display().to_string()));
                }
                return Err(WatchdError::Io(err));
            }
        };

        let mut found = HashSet::new();
        let listing: Vec<WalkEntry> = listing
            .into_iter()
            .filter(|entry| {
                if self.cookies.is_own_cookie(entry.file_name()) {
                    found.insert(entry.file_name().to_string());
                    false
                } else {
                    true
                }
            })
            .collect();

        let (changed, files) = {
            let mut view = self.view.write();
            view.tick();
            let changed = view.apply_crawl(&listing);
            (changed, view.existing_len())
        };
        let settlement = self.cookies.settle_crawl(generation, &found, supersede);
        tracing::info!(
            root = %self.path.display(),
            generation,
            reason,
            files,
            changed,
            observed = settlement.observed,
            aborted = settlement.aborted,
            elapsed_ms = util::millis(started.elapsed()),
            "crawl complete"
        );
        self.publish();
        Ok(settlement)
    }

    fn io_loop(self: Arc<Self>, changes: Receiver<RawChange>, commands: Receiver<RootCommand>) {
        let mut pending: Vec<PathBuf> = Vec::new();
        let mut overflowed = false;

        while !self.is_cancelled() {
            select! {
                recv(changes) -> msg => match msg {
                    Ok(change) => {
                        if let Some(reason) = self.buffer(change, &mut pending, &mut overflowed) {
                            self.recrawl_now(&reason);
                        }
                    }
                    Err(_) => break,
                },
                recv(commands) -> msg => match msg {
                    Ok(RootCommand::Recrawl { reason }) => self.recrawl_now(&reason),
                    Ok(RootCommand::Wake) => {}
                    Ok(RootCommand::Stop) | Err(_) => break,
                },
                default(IDLE_POLL) => {}
            }

            // Let a burst settle before taking a permit.
            while !pending.is_empty() && pending.len() < self.settings.batch_limit {
                match changes.recv_timeout(self.settings.settle) {
                    Ok(change) => {
                        if let Some(reason) = self.buffer(change, &mut pending, &mut overflowed) {
                            self.recrawl_now(&reason);
                        }
                    }
                    Err(_) => break,
                }
            }

            self.flush(&mut pending, &mut overflowed);
        }
        tracing::debug!(root = %self.path.display(), "io thread exiting");
    }

    /// Returns a recrawl reason when the change cannot be applied
    /// incrementally.
    fn buffer(
        &self,
        change: RawChange,
        pending: &mut Vec<PathBuf>,
        overflowed: &mut bool,
    ) -> Option<String> {
        match change {
            RawChange::Rescan(reason) => {
                tracing::warn!(
                    code = "NOTIFY_RESCAN",
                    stage = "notify",
                    action = "recrawl",
                    root = %self.path.display(),
                    reason = %reason,
                    "notification stream lost events"
                );
                Some(reason)
            }
            RawChange::Path(path) => {
                if *overflowed {
                    return None;
                }
                // A paused root must not grow without bound; resync instead.
                if pending.len() >= self.settings.batch_limit && self.pause.is_paused() {
                    tracing::warn!(
                        code = "PAUSE_BUFFER_OVERFLOW",
                        stage = "notify",
                        action = "resync_on_unpause",
                        root = %self.path.display(),
                        limit = self.settings.batch_limit,
                        "dropping buffered changes while paused"
                    );
                    pending.clear();
                    *overflowed = true;
                    return None;
                }
                pending.push(path);
                None
            }
        }
    }

    fn recrawl_now(&self, reason: &str) {
        if let Err(err) = self.crawl(reason, true) {
            tracing::warn!(
                code = "RECRAWL_FAILED",
                stage = "crawl",
                action = "recrawl",
                root = %self.path.display(),
                reason,
                err = %err,
                "recrawl failed"
            );
        }
    }

    /// Apply buffered changes if the notification path is open.
    fn flush(&self, pending: &mut Vec<PathBuf>, overflowed: &mut bool) {
        if pending.is_empty() && !*overflowed {
            return;
        }
        let Some(_permit) = self.pause.try_admit() else {
            return;
        };
        if std::mem::take(overflowed) {
            pending.clear();
            if let Err(err) = self.crawl("resync after paused overflow", false) {
                tracing::warn!(root = %self.path.display(), err = %err, "resync failed");
            }
            return;
        }
        let batch = std::mem::take(pending);
        self.apply_batch(batch);
    }

    fn apply_batch(&self, batch: Vec<PathBuf>) {
        let mut cookies_seen = Vec::new();
        let mut root_gone = false;
        let mut applied = 0usize;
        {
            let mut view = self.view.write();
            view.tick();
            let mut seen = HashSet::new();
            for path in batch {
                if !seen.insert(path.clone()) {
                    continue;
                }
                let Some(rel) = walker::relative_path(&self.path, &path) else {
                    continue;
                };
                if rel.is_empty() {
                    root_gone = !self.path.is_dir();
                    continue;
                }
                let file_name = rel.rsplit('/').next().unwrap_or(&rel);
                if self.cookies.is_own_cookie(file_name) {
                    cookies_seen.push(file_name.to_string());
                    continue;
                }
                match walker::stat_entry(&self.path, &path) {
                    Ok(Some(entry)) => {
                        let new_dir = entry.kind == EntryKind::Dir
                            && view.get(&rel).is_none_or(|existing| !existing.exists);
                        if view.upsert(&entry) {
                            applied += 1;
                        }
                        if new_dir {
                            // Children created before the watch was added
                            // produce no events of their own.
                            match walker::walk_subtree(&self.path, &path) {
                                Ok(entries) => {
                                    for child in entries {
                                        if self.cookies.is_own_cookie(child.file_name()) {
                                            cookies_seen.push(child.file_name().to_string());
                                        } else if view.upsert(&child) {
                                            applied += 1;
                                        }
                                    }
                                }
                                Err(err) => tracing::debug!(rel = %rel, %err, "subtree walk failed"),
                            }
                        }
                    }
                    Ok(None) => applied += view.mark_deleted(&rel),
                    Err(err) => tracing::debug!(rel = %rel, %err, "stat failed"),
                }
            }
        }

        if root_gone {
            self.cancel("root directory was removed");
            return;
        }
        // The view already reflects everything that preceded these markers.
        for name in cookies_seen {
            self.cookies.notify_cookie(&name);
        }
        tracing::trace!(root = %self.path.display(), applied, "applied notification batch");
        self.publish();
    }

    /// Mark the root dead: abort waiters and stop the IO thread. Safe to call
    /// from the IO thread itself.
    pub fn cancel(&self, reason: &str) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(
            code = "ROOT_CANCELLED",
            stage = "root",
            action = "cancel",
            root = %self.path.display(),
            reason,
            pending = self.cookies.pending_count(),
            "watch cancelled"
        );
        self.notifier.lock().take();
        self.cookies.abort_all();
        let _ = self.commands.send(RootCommand::Stop);
        for sub in self.subscribers() {
            sub.cancel();
        }
        self.publish();
    }

    /// Cancel and wait for the IO thread to exit.
    pub fn stop(&self) {
        self.cancel("watch removed");
        let handle = self.io_thread.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}
