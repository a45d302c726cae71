//! Cookie synchronization.
//!
//! To answer "has the watcher seen everything up to now?" a request plants a
//! uniquely named marker file inside the root and waits for that file to come
//! back to us. It can come back three ways: through the notification path
//! ([`CookieSync::notify_cookie`]), through a crawl that finds it on disk
//! ([`CookieSync::settle_crawl`]), or not at all because an operator or a
//! recrawl cancelled it ([`CookieSync::abort_all`]). The waiter gives up at its
//! deadline. Whichever of those happens first decides the cookie's fate.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use crate::error::{WatchdError, WatchdResult};
use crate::watchd::util;

pub const COOKIE_PREFIX: &str = ".watchd-cookie-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieState {
    Pending,
    Observed,
    Aborted,
    TimedOut,
}

impl CookieState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Observed => 1,
            Self::Aborted => 2,
            Self::TimedOut => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Observed,
            2 => Self::Aborted,
            3 => Self::TimedOut,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug)]
pub struct Cookie {
    name: String,
    path: PathBuf,
    generation: u64,
    state: AtomicU8,
    lock: Mutex<()>,
    resolved: Condvar,
}

impl Cookie {
    fn new(name: String, path: PathBuf, generation: u64) -> Self {
        Self {
            name,
            path,
            generation,
            state: AtomicU8::new(CookieState::Pending.as_u8()),
            lock: Mutex::new(()),
            resolved: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> CookieState {
        CookieState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move out of `Pending`. Only the first caller succeeds.
    fn resolve(&self, to: CookieState) -> bool {
        let won = self
            .state
            .compare_exchange(
                CookieState::Pending.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            let _guard = self.lock.lock();
            self.resolved.notify_all();
        }
        won
    }

    fn wait_until(&self, deadline: Instant) -> CookieState {
        let mut guard = self.lock.lock();
        loop {
            let state = self.state();
            if state != CookieState::Pending {
                return state;
            }
            if self.resolved.wait_until(&mut guard, deadline).timed_out() {
                // Racing resolvers may still win here; their result stands.
                return match self.state.compare_exchange(
                    CookieState::Pending.as_u8(),
                    CookieState::TimedOut.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => CookieState::TimedOut,
                    Err(actual) => CookieState::from_u8(actual),
                };
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrawlSettlement {
    pub observed: usize,
    pub aborted: usize,
    pub still_pending: usize,
}

#[derive(Debug, Default)]
struct CookieRegistry {
    generation: u64,
    pending: HashMap<String, Arc<Cookie>>,
}

#[derive(Debug)]
pub struct CookieSync {
    dir: PathBuf,
    prefix: String,
    serial: AtomicU64,
    registry: Mutex<CookieRegistry>,
}

impl CookieSync {
    pub fn new(dir: &Path) -> Self {
        let digest = Sha256::digest(dir.to_string_lossy().as_bytes());
        let root_tag = format!("{digest:x}");
        let prefix = format!(
            "{COOKIE_PREFIX}{}-{}-",
            &root_tag[..12],
            std::process::id()
        );
        Self {
            dir: dir.to_path_buf(),
            prefix,
            // Start-time seed: serials never repeat across restarts that reuse a pid.
            serial: AtomicU64::new(util::process_start_epoch_millis().saturating_mul(1000)),
            registry: Mutex::new(CookieRegistry::default()),
        }
    }

    #[cfg(test)]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// True for markers planted by this process for this root.
    pub fn is_own_cookie(&self, file_name: &str) -> bool {
        file_name.starts_with(&self.prefix)
    }

    pub fn generation(&self) -> u64 {
        self.registry.lock().generation
    }

    pub fn pending_count(&self) -> usize {
        self.registry.lock().pending.len()
    }

    /// Register a cookie, then create its marker.
    ///
    /// Registration happens first so that a notification racing the file
    /// creation always finds the waiter. The registry lock is held across the
    /// create so a crawl cannot bump the generation between the two and then
    /// miss a marker that was about to appear.
    pub fn plant(&self) -> WatchdResult<Arc<Cookie>> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}{}", self.prefix, serial);
        let path = self.dir.join(&name);

        let mut registry = self.registry.lock();
        let cookie = Arc::new(Cookie::new(name.clone(), path.clone(), registry.generation));
        registry.pending.insert(name.clone(), Arc::clone(&cookie));

        if let Err(err) = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
        {
            registry.pending.remove(&name);
            drop(registry);
            cookie.resolve(CookieState::Aborted);
            return Err(WatchdError::Io(io::Error::new(
                err.kind(),
                format!("sync: create({}) failed: {err}", path.display()),
            )));
        }
        drop(registry);
        tracing::debug!(cookie = %name, generation = cookie.generation, "planted cookie");
        Ok(cookie)
    }

    /// Plant a cookie and block until it resolves or `deadline` passes.
    #[cfg(test)]
    pub fn plant_and_wait(&self, deadline: Instant) -> WatchdResult<CookieState> {
        let cookie = self.plant()?;
        Ok(self.wait(&cookie, deadline))
    }

    /// Block until `cookie` resolves or `deadline` passes. A timed out cookie
    /// is unregistered and its marker removed.
    pub fn wait(&self, cookie: &Arc<Cookie>, deadline: Instant) -> CookieState {
        let outcome = cookie.wait_until(deadline);
        if outcome == CookieState::TimedOut {
            self.forget(cookie);
            remove_marker(cookie.path());
            tracing::warn!(
                cookie = %cookie.name(),
                root = %self.dir.display(),
                "timed out waiting for cookie to be observed"
            );
        }
        outcome
    }

    fn forget(&self, cookie: &Arc<Cookie>) {
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.pending.get(cookie.name())
            && Arc::ptr_eq(existing, cookie)
        {
            registry.pending.remove(cookie.name());
        }
    }

    /// The notification path saw `file_name`. Returns true if that resolved a
    /// waiting cookie.
    pub fn notify_cookie(&self, file_name: &str) -> bool {
        let cookie = self.registry.lock().pending.remove(file_name);
        let Some(cookie) = cookie else {
            tracing::trace!(cookie = %file_name, "no waiter for cookie");
            return false;
        };
        let won = cookie.resolve(CookieState::Observed);
        remove_marker(cookie.path());
        won
    }

    /// Resolve every pending cookie as aborted. Returns how many waiters this
    /// call actually cancelled.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<Arc<Cookie>> = {
            let mut registry = self.registry.lock();
            registry.pending.drain().map(|(_, cookie)| cookie).collect()
        };
        let mut aborted = 0;
        for cookie in drained {
            if cookie.resolve(CookieState::Aborted) {
                aborted += 1;
                tracing::warn!(cookie = %cookie.name(), "aborting cookie");
            }
            remove_marker(cookie.path());
        }
        aborted
    }

    /// Start a crawl: bump the generation and return it.
    pub fn begin_crawl(&self) -> u64 {
        let mut registry = self.registry.lock();
        registry.generation += 1;
        registry.generation
    }

    /// Finish a crawl of `generation` that found the cookie markers named in
    /// `found` on disk.
    ///
    /// Found cookies are observed. With `supersede`, cookies planted before
    /// the crawl began and not found are aborted; cookies planted during the
    /// crawl stay pending for the notification path.
    pub fn settle_crawl(
        &self,
        generation: u64,
        found: &HashSet<String>,
        supersede: bool,
    ) -> CrawlSettlement {
        let mut observed = Vec::new();
        let mut aborted = Vec::new();
        let still_pending = {
            let mut registry = self.registry.lock();
            registry.pending.retain(|name, cookie| {
                if found.contains(name) {
                    observed.push(Arc::clone(cookie));
                    false
                } else if supersede && cookie.generation < generation {
                    aborted.push(Arc::clone(cookie));
                    false
                } else {
                    true
                }
            });
            registry.pending.len()
        };

        let mut settlement = CrawlSettlement {
            still_pending,
            ..CrawlSettlement::default()
        };
        for cookie in observed {
            if cookie.resolve(CookieState::Observed) {
                settlement.observed += 1;
            }
            remove_marker(cookie.path());
        }
        for cookie in aborted {
            if cookie.resolve(CookieState::Aborted) {
                settlement.aborted += 1;
            }
            remove_marker(cookie.path());
        }
        settlement
    }
}

impl Drop for CookieSync {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn remove_marker(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::debug!(path = %path.display(), %err, "failed to remove cookie marker"),
    }
}

#[cfg(test)]
mod tests {
    use super::{COOKIE_PREFIX, CookieState, CookieSync};
    use std::collections::HashSet;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    #[test]
    fn names_are_unique_and_prefixed() {
        let tmp = tempdir().expect("tempdir");
        let sync = CookieSync::new(tmp.path());
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let cookie = sync.plant().expect("plant");
            assert!(cookie.name().starts_with(COOKIE_PREFIX));
            assert!(sync.is_own_cookie(cookie.name()));
            assert!(cookie.path().exists());
            assert!(seen.insert(cookie.name().to_string()));
        }
        assert_eq!(sync.pending_count(), 64);
    }

    #[test]
    fn other_roots_use_other_prefixes() {
        let a = tempdir().expect("tempdir");
        let b = tempdir().expect("tempdir");
        assert_ne!(
            CookieSync::new(a.path()).prefix(),
            CookieSync::new(b.path()).prefix()
        );
    }

    #[test]
    fn notification_resolves_waiter() {
        let tmp = tempdir().expect("tempdir");
        let sync = CookieSync::new(tmp.path());
        let cookie = sync.plant().expect("plant");
        let marker = cookie.path().to_path_buf();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| cookie.wait_until(Instant::now() + Duration::from_secs(5)));
            thread::sleep(Duration::from_millis(30));
            assert!(sync.notify_cookie(cookie.name()));
            assert_eq!(waiter.join().expect("join"), CookieState::Observed);
        });
        assert!(!marker.exists(), "observed marker should be cleaned up");
        assert_eq!(sync.pending_count(), 0);
    }

    #[test]
    fn unobserved_cookie_times_out_and_is_forgotten() {
        let tmp = tempdir().expect("tempdir");
        let sync = CookieSync::new(tmp.path());
        let started = Instant::now();
        let outcome = sync
            .plant_and_wait(Instant::now() + Duration::from_millis(60))
            .expect("wait");
        assert_eq!(outcome, CookieState::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(sync.pending_count(), 0);
        let leftovers = std::fs::read_dir(tmp.path()).expect("read_dir").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn abort_unblocks_waiter_before_deadline() {
        let tmp = tempdir().expect("tempdir");
        let sync = CookieSync::new(tmp.path());
        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let started = Instant::now();
                let outcome = sync
                    .plant_and_wait(Instant::now() + Duration::from_secs(10))
                    .expect("wait");
                (outcome, started.elapsed())
            });
            while sync.pending_count() == 0 {
                thread::sleep(Duration::from_millis(5));
            }
            thread::sleep(Duration::from_millis(50));
            assert_eq!(sync.abort_all(), 1);
            let (outcome, elapsed) = waiter.join().expect("join");
            assert_eq!(outcome, CookieState::Aborted);
            assert!(elapsed < Duration::from_secs(2));
        });
    }

    #[test]
    fn first_terminal_state_wins() {
        let tmp = tempdir().expect("tempdir");
        let sync = CookieSync::new(tmp.path());
        let cookie = sync.plant().expect("plant");
        let name = cookie.name().to_string();
        assert_eq!(sync.abort_all(), 1);
        assert!(!sync.notify_cookie(&name));
        assert_eq!(cookie.state(), CookieState::Aborted);
        assert_eq!(
            cookie.wait_until(Instant::now() + Duration::from_millis(10)),
            CookieState::Aborted
        );
    }

    #[test]
    fn recrawl_observes_found_and_aborts_superseded() {
        let tmp = tempdir().expect("tempdir");
        let sync = CookieSync::new(tmp.path());
        let found_cookie = sync.plant().expect("plant");
        let lost_cookie = sync.plant().expect("plant");

        let generation = sync.begin_crawl();
        let during_crawl = sync.plant().expect("plant");
        let found = HashSet::from([found_cookie.name().to_string()]);
        let settlement = sync.settle_crawl(generation, &found, true);

        assert_eq!(settlement.observed, 1);
        assert_eq!(settlement.aborted, 1);
        assert_eq!(settlement.still_pending, 1);
        assert_eq!(found_cookie.state(), CookieState::Observed);
        assert_eq!(lost_cookie.state(), CookieState::Aborted);
        assert_eq!(during_crawl.state(), CookieState::Pending);
        assert_eq!(during_crawl.generation(), generation);
    }

    #[test]
    fn initial_crawl_keeps_unfound_cookies_pending() {
        let tmp = tempdir().expect("tempdir");
        let sync = CookieSync::new(tmp.path());
        let cookie = sync.plant().expect("plant");
        let generation = sync.begin_crawl();
        let settlement = sync.settle_crawl(generation, &HashSet::new(), false);
        assert_eq!(settlement.aborted, 0);
        assert_eq!(cookie.state(), CookieState::Pending);
    }

    #[test]
    fn recrawl_does_not_resurrect_aborted_cookie() {
        let tmp = tempdir().expect("tempdir");
        let sync = CookieSync::new(tmp.path());
        let cookie = sync.plant().expect("plant");
        sync.abort_all();

        let generation = sync.begin_crawl();
        let found = HashSet::from([cookie.name().to_string()]);
        let settlement = sync.settle_crawl(generation, &found, true);
        assert_eq!(settlement.observed, 0);
        assert_eq!(cookie.state(), CookieState::Aborted);
    }
}
