use crate::watchd::paths::WatchdPaths;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

pub const DAEMON_LOCK_FILE: &str = "watchd.daemon.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockPayload {
    pub pid: u32,
    #[serde(default)]
    pub started_at_epoch_secs: u64,
    #[serde(default)]
    pub build_uuid: String,
    #[serde(default)]
    pub sock_path: String,
}

pub fn daemon_lock_path(paths: &WatchdPaths) -> PathBuf {
    paths.logs_dir.join(DAEMON_LOCK_FILE)
}

pub fn parse_daemon_lock_payload(raw: &str) -> Option<DaemonLockPayload> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(payload) = serde_json::from_str::<DaemonLockPayload>(trimmed) {
        return Some(payload);
    }

    // A bare pid line is still honoured so a hand-written lock can be stopped.
    let pid = trimmed.lines().next()?.trim().parse::<u32>().ok()?;
    Some(DaemonLockPayload {
        pid,
        started_at_epoch_secs: 0,
        build_uuid: String::new(),
        sock_path: String::new(),
    })
}

pub fn read_daemon_lock_payload(paths: &WatchdPaths) -> Result<Option<DaemonLockPayload>> {
    let lock_path = daemon_lock_path(paths);
    if !lock_path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(&lock_path)
        .with_context(|| format!("failed to read daemon lock {}", lock_path.display()))?;
    Ok(parse_daemon_lock_payload(&raw))
}

/// Whether some process currently holds the daemon lock.
pub fn daemon_lock_held(paths: &WatchdPaths) -> bool {
    let Ok(file) = OpenOptions::new().read(true).open(daemon_lock_path(paths)) else {
        return false;
    };
    match file.try_lock_shared() {
        Ok(()) => {
            let _ = file.unlock();
            false
        }
        Err(_) => true,
    }
}

/// Take the exclusive daemon lock and record who holds it.
///
/// The returned file must stay open for the lifetime of the daemon; dropping
/// it releases the lock.
pub fn acquire_daemon_lock(paths: &WatchdPaths) -> Result<File> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;

    let lock_path = daemon_lock_path(paths);
    let mut lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("failed to open daemon lock {}", lock_path.display()))?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            anyhow::bail!(
                "watchd daemon already running (lock: {})",
                lock_path.display()
            );
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to lock daemon file {}", lock_path.display()));
        }
    }

    let payload = DaemonLockPayload {
        pid: std::process::id(),
        started_at_epoch_secs: crate::watchd::util::process_start_epoch_secs(),
        build_uuid: env!("BUILD_UUID").to_string(),
        sock_path: paths.sock_path.display().to_string(),
    };
    lock_file
        .set_len(0)
        .with_context(|| format!("failed to truncate daemon lock {}", lock_path.display()))?;
    writeln!(&mut lock_file, "{}", serde_json::to_string(&payload)?)
        .with_context(|| format!("failed to write daemon lock {}", lock_path.display()))?;

    Ok(lock_file)
}
