use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::backend::walker::{EntryKind, WalkEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_ms: i64,
    pub exists: bool,
    /// Tick at which this entry was first observed.
    pub ctime: u64,
    /// Tick of the most recent observed change.
    pub otime: u64,
}

/// In-memory picture of a root, keyed by `/`-separated relative path.
///
/// Deleted entries are kept with `exists == false` so that `since` queries
/// and subscriptions can report the deletion.
#[derive(Debug, Default)]
pub struct View {
    ticks: u64,
    entries: BTreeMap<String, FileEntry>,
}

impl View {
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Advance the event log; every change applied afterwards carries the
    /// new tick.
    pub fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    pub fn get(&self, rel: &str) -> Option<&FileEntry> {
        self.entries.get(rel)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.entries.iter()
    }

    pub fn existing_len(&self) -> usize {
        self.entries.values().filter(|entry| entry.exists).count()
    }

    /// Record `entry` as present. Returns true if this changed the view.
    pub fn upsert(&mut self, entry: &WalkEntry) -> bool {
        let tick = self.ticks;
        match self.entries.entry(entry.rel_path.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(FileEntry {
                    kind: entry.kind,
                    size: entry.size,
                    mtime_ms: entry.mtime_ms,
                    exists: true,
                    ctime: tick,
                    otime: tick,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let unchanged = existing.exists
                    && existing.kind == entry.kind
                    && existing.size == entry.size
                    && existing.mtime_ms == entry.mtime_ms;
                if unchanged {
                    return false;
                }
                if !existing.exists {
                    existing.ctime = tick;
                }
                existing.kind = entry.kind;
                existing.size = entry.size;
                existing.mtime_ms = entry.mtime_ms;
                existing.exists = true;
                existing.otime = tick;
                true
            }
        }
    }

    /// Mark `rel` and everything beneath it as deleted. Returns how many
    /// entries flipped.
    pub fn mark_deleted(&mut self, rel: &str) -> usize {
        let tick = self.ticks;
        let child_prefix = format!("{rel}/");
        let mut flipped = 0;
        if let Some(entry) = self.entries.get_mut(rel)
            && entry.exists
        {
            entry.exists = false;
            entry.otime = tick;
            flipped += 1;
        }
        // Children sort contiguously after "rel/", but not directly after "rel".
        for (path, entry) in self.entries.range_mut(child_prefix.clone()..) {
            if !path.starts_with(&child_prefix) {
                break;
            }
            if entry.exists {
                entry.exists = false;
                entry.otime = tick;
                flipped += 1;
            }
        }
        flipped
    }

    /// Replace the view's contents with a fresh crawl result.
    ///
    /// Entries the crawl did not see are marked deleted; everything else is
    /// upserted. Returns the number of entries that changed.
    pub fn apply_crawl(&mut self, entries: &[WalkEntry]) -> usize {
        let seen: std::collections::HashSet<&str> =
            entries.iter().map(|entry| entry.rel_path.as_str()).collect();
        let tick = self.ticks;
        let mut changed = 0;
        for (path, entry) in self.entries.iter_mut() {
            if entry.exists && !seen.contains(path.as_str()) {
                entry.exists = false;
                entry.otime = tick;
                changed += 1;
            }
        }
        for entry in entries {
            if self.upsert(entry) {
                changed += 1;
            }
        }
        changed
    }
}
