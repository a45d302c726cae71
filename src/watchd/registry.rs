use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{WatchdError, WatchdResult};
use crate::watchd::config::WatchdRestrictConfig;
use crate::watchd::pause::PauseController;
use crate::watchd::root::{Root, RootSettings};

#[derive(Debug)]
enum Slot {
    Starting,
    Ready(Arc<Root>),
}

enum Lookup {
    Live(Arc<Root>),
    Dead,
    Starting,
    Absent,
}

/// Every watched root, keyed by canonical path.
#[derive(Debug)]
pub struct RootRegistry {
    pause: Arc<PauseController>,
    settings: RootSettings,
    restrict: WatchdRestrictConfig,
    config_label: String,
    next_number: AtomicU64,
    roots: Mutex<HashMap<PathBuf, Slot>>,
    ready: Condvar,
}

impl RootRegistry {
    pub fn new(
        pause: Arc<PauseController>,
        settings: RootSettings,
        restrict: WatchdRestrictConfig,
        config_label: String,
    ) -> Self {
        Self {
            pause,
            settings,
            restrict,
            config_label,
            next_number: AtomicU64::new(1),
            roots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    fn lookup(roots: &HashMap<PathBuf, Slot>, path: &Path) -> Lookup {
        match roots.get(path) {
            Some(Slot::Ready(root)) if root.is_cancelled() => Lookup::Dead,
            Some(Slot::Ready(root)) => Lookup::Live(Arc::clone(root)),
            Some(Slot::Starting) => Lookup::Starting,
            None => Lookup::Absent,
        }
    }

    /// Watch `raw`, returning the root and whether this call created it.
    ///
    /// Returns only once the initial crawl has finished; concurrent callers
    /// for the same root wait for the one doing the crawl.
    pub fn watch(&self, raw: &str) -> WatchdResult<(Arc<Root>, bool)> {
        let path = resolve_root(raw, &self.restrict, &self.config_label)?;

        let mut roots = self.roots.lock();
        loop {
            match Self::lookup(&roots, &path) {
                Lookup::Live(root) => return Ok((root, false)),
                Lookup::Starting => self.ready.wait(&mut roots),
                Lookup::Dead => {
                    roots.remove(&path);
                    break;
                }
                Lookup::Absent => break,
            }
        }
        roots.insert(path.clone(), Slot::Starting);
        drop(roots);

        let number = self.next_number.fetch_add(1, Ordering::Relaxed);
        let started = Root::start(path.clone(), number, Arc::clone(&self.pause), self.settings);

        let mut roots = self.roots.lock();
        let result = match started {
            Ok(root) => {
                roots.insert(path, Slot::Ready(Arc::clone(&root)));
                Ok((root, true))
            }
            Err(err) => {
                roots.remove(&path);
                Err(err)
            }
        };
        self.ready.notify_all();
        result
    }

    /// The live root for `raw`, or `NotWatched`.
    pub fn get(&self, raw: &str) -> WatchdResult<Arc<Root>> {
        let path = lookup_key(raw)?;
        let mut roots = self.roots.lock();
        loop {
            match Self::lookup(&roots, &path) {
                Lookup::Live(root) => return Ok(root),
                Lookup::Starting => self.ready.wait(&mut roots),
                Lookup::Dead => {
                    roots.remove(&path);
                    return Err(WatchdError::NotWatched(raw.to_string()));
                }
                Lookup::Absent => return Err(WatchdError::NotWatched(raw.to_string())),
            }
        }
    }

    pub fn unwatch(&self, raw: &str) -> WatchdResult<Arc<Root>> {
        let root = self.get(raw)?;
        self.roots.lock().remove(root.path());
        root.stop();
        Ok(root)
    }

    pub fn list(&self) -> Vec<PathBuf> {
        let roots = self.roots.lock();
        let mut out: Vec<PathBuf> = roots
            .iter()
            .filter_map(|(path, slot)| match slot {
                Slot::Ready(root) if !root.is_cancelled() => Some(path.clone()),
                _ => None,
            })
            .collect();
        out.sort();
        out
    }

    pub fn live_roots(&self) -> Vec<Arc<Root>> {
        self.roots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(root) if !root.is_cancelled() => Some(Arc::clone(root)),
                _ => None,
            })
            .collect()
    }

    /// Let every IO thread apply what it buffered while paused.
    pub fn wake_all(&self) {
        for root in self.live_roots() {
            root.wake();
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<Arc<Root>> = self
            .roots
            .lock()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(root) => Some(root),
                Slot::Starting => None,
            })
            .collect();
        for root in drained {
            root.stop();
        }
    }
}

fn require_absolute(raw: &str) -> WatchdResult<()> {
    if Path::new(raw).is_absolute() {
        return Ok(());
    }
    Err(WatchdError::RootResolve {
        path: raw.to_string(),
        reason: format!("path \"{raw}\" must be absolute"),
    })
}

/// Key used to find an existing root: canonical when resolvable, so that a
/// root whose directory vanished can still be named.
fn lookup_key(raw: &str) -> WatchdResult<PathBuf> {
    require_absolute(raw)?;
    Ok(fs::canonicalize(raw).unwrap_or_else(|_| PathBuf::from(raw)))
}

/// Validate and canonicalize a path a client asked to watch.
pub fn resolve_root(
    raw: &str,
    restrict: &WatchdRestrictConfig,
    config_label: &str,
) -> WatchdResult<PathBuf> {
    require_absolute(raw)?;
    let unresolvable = |reason: String| WatchdError::RootResolve {
        path: raw.to_string(),
        reason,
    };
    if Path::new(raw) == Path::new("/") {
        return Err(unresolvable("cannot watch \"/\"".to_string()));
    }
    let canonical = fs::canonicalize(raw).map_err(|err| unresolvable(err.to_string()))?;
    if canonical == Path::new("/") {
        return Err(unresolvable("cannot watch \"/\"".to_string()));
    }
    if !canonical.is_dir() {
        return Err(unresolvable("not a directory".to_string()));
    }

    if restrict.enforce_root_files
        && !restrict
            .root_files
            .iter()
            .any(|name| canonical.join(name).exists())
    {
        return Err(unresolvable(format!(
            "Your administrator has configured watchd to prevent watching path `{raw}`. \
             None of the files listed in global config root_files are present and \
             enforce_root_files is set to true. root_files is defined by the `{config_label}` \
             config file and includes {}. One or more of these files must be present in order \
             to allow a watch. Try pulling and checking out a newer version of the project?",
            quoted_list(&restrict.root_files)
        )));
    }
    Ok(canonical)
}

fn quoted_list(names: &[String]) -> String {
    let quoted: Vec<String> = names.iter().map(|name| format!("`{name}`")).collect();
    match quoted.as_slice() {
        [] => String::new(),
        [only] => only.clone(),
        [first, second] => format!("{first} and {second}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::{RootRegistry, quoted_list, resolve_root};
    use crate::watchd::config::WatchdRestrictConfig;
    use crate::watchd::pause::PauseController;
    use crate::watchd::root::RootSettings;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn registry(restrict: WatchdRestrictConfig) -> RootRegistry {
        RootRegistry::new(
            Arc::new(PauseController::new()),
            RootSettings {
                settle: Duration::from_millis(10),
                batch_limit: 1024,
            },
            restrict,
            "/etc/watchd.toml".to_string(),
        )
    }

    #[test]
    fn rejects_relative_and_filesystem_root() {
        let restrict = WatchdRestrictConfig::default();
        let err = resolve_root("rel/path", &restrict, "cfg").expect_err("relative");
        assert!(err.to_string().contains("path \"rel/path\" must be absolute"));
        let err = resolve_root("/", &restrict, "cfg").expect_err("slash");
        assert!(err.to_string().contains("cannot watch \"/\""));
    }

    #[test]
    fn missing_directory_reports_os_error() {
        let tmp = tempdir().expect("tempdir");
        let missing = tmp.path().join("nope");
        let raw = missing.display().to_string();
        let err = resolve_root(&raw, &WatchdRestrictConfig::default(), "cfg").expect_err("missing");
        assert_eq!(err.kind(), "root_resolve");
        assert!(err.to_string().contains("No such file or directory"));
    }

    #[test]
    fn root_files_restriction_is_enforced() {
        let tmp = tempdir().expect("tempdir");
        let raw = tmp.path().display().to_string();
        let restrict = WatchdRestrictConfig {
            root_files: vec![".git".to_string(), ".foo".to_string()],
            enforce_root_files: true,
        };
        let err = resolve_root(&raw, &restrict, "/etc/watchd.toml").expect_err("restricted");
        let msg = err.to_string();
        assert!(msg.contains("includes `.git` and `.foo`"));
        assert!(msg.ends_with("Try pulling and checking out a newer version of the project?"));

        fs::write(tmp.path().join(".foo"), "").expect("write");
        resolve_root(&raw, &restrict, "/etc/watchd.toml").expect("allowed");
    }

    #[test]
    fn quoted_list_uses_serial_comma() {
        let names = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(quoted_list(&names(&["a"])), "`a`");
        assert_eq!(quoted_list(&names(&["a", "b", "c"])), "`a`, `b`, and `c`");
    }

    #[test]
    fn watch_is_idempotent_and_unwatch_forgets() {
        let tmp = tempdir().expect("tempdir");
        let raw = tmp.path().display().to_string();
        let roots = registry(WatchdRestrictConfig::default());
        let (first, created) = roots.watch(&raw).expect("watch");
        assert!(created);
        let (second, created_again) = roots.watch(&raw).expect("watch");
        assert!(!created_again);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(roots.list().len(), 1);

        roots.unwatch(&raw).expect("unwatch");
        assert_eq!(roots.get(&raw).expect_err("gone").kind(), "not_watched");
        roots.stop_all();
    }
}
