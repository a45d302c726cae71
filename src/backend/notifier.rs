use crossbeam_channel::Sender;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

/// What the kernel told us, reduced to what the IO thread needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChange {
    /// Something at this absolute path may have changed.
    Path(PathBuf),
    /// Notifications were lost or the backend asked for a full rescan.
    Rescan(String),
}

/// Live recursive watch over a root. Dropping it stops the watch.
pub struct NotifySource {
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for NotifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySource").finish_non_exhaustive()
    }
}

impl NotifySource {
    pub fn start(root: &Path, sink: Sender<RawChange>) -> notify::Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                for change in classify(res) {
                    // The IO thread is gone once the root stops.
                    let _ = sink.send(change);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(Self { _watcher: watcher })
    }
}

fn classify(res: notify::Result<Event>) -> Vec<RawChange> {
    match res {
        Ok(event) => {
            if event.need_rescan() {
                return vec![RawChange::Rescan("backend requested rescan".to_string())];
            }
            if matches!(event.kind, EventKind::Access(_)) {
                return Vec::new();
            }
            event.paths.into_iter().map(RawChange::Path).collect()
        }
        Err(err) => vec![RawChange::Rescan(format!("notification error: {err}"))],
    }
}
