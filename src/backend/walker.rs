use serde::Serialize;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Component, Path};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    #[serde(rename = "f")]
    File,
    #[serde(rename = "d")]
    Dir,
    #[serde(rename = "l")]
    Symlink,
    #[serde(rename = "?")]
    Other,
}

impl EntryKind {
    fn from_metadata(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_dir() {
            Self::Dir
        } else if file_type.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path relative to the walked root, `/`-separated.
    pub rel_path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_ms: i64,
}

impl WalkEntry {
    fn from_metadata(rel_path: String, meta: &Metadata) -> Self {
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            rel_path,
            kind: EntryKind::from_metadata(meta),
            size: meta.len(),
            mtime_ms,
        }
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.rel_path.rsplit('/').next().unwrap_or(&self.rel_path)
    }
}

/// `path` relative to `root` in `/`-separated form; `None` outside the root.
/// The root itself maps to the empty string.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Full recursive listing of `root`, not including the root itself.
pub fn walk(root: &Path) -> io::Result<Vec<WalkEntry>> {
    walk_from(root, root)
}

/// Listing of `dir` and everything under it, relative to `root`.
pub fn walk_subtree(root: &Path, dir: &Path) -> io::Result<Vec<WalkEntry>> {
    let mut out = Vec::new();
    if let Some(entry) = stat_entry(root, dir)? {
        out.push(entry);
    }
    out.extend(walk_from(root, dir)?);
    Ok(out)
}

fn walk_from(root: &Path, start: &Path) -> io::Result<Vec<WalkEntry>> {
    // Surface a missing or unreadable start directory as an error instead of
    // an empty listing.
    fs::read_dir(start)?;

    let mut out = Vec::new();
    for item in WalkDir::new(start).follow_links(false).min_depth(1) {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(err.into()),
            Err(err) => {
                tracing::debug!(%err, "skipping unreadable entry during crawl");
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                tracing::debug!(path = %entry.path().display(), %err, "entry vanished during crawl");
                continue;
            }
        };
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        out.push(WalkEntry::from_metadata(rel, &meta));
    }
    Ok(out)
}

/// `lstat` a single path. `Ok(None)` means it no longer exists.
pub fn stat_entry(root: &Path, path: &Path) -> io::Result<Option<WalkEntry>> {
    let Some(rel) = relative_path(root, path) else {
        return Ok(None);
    };
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(WalkEntry::from_metadata(rel, &meta))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
