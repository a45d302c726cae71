use anyhow::Result;
use serde_json::json;
use std::thread;
use std::time::{Duration, Instant};

use crate::commands::CommandReport;
use crate::watchd::client::DaemonClient;
use crate::watchd::daemon_lock::{daemon_lock_held, daemon_lock_path, read_daemon_lock_payload};
use crate::watchd::paths::resolve_paths;
use crate::watchd::util::pid_alive;

const STOP_TIMEOUT: Duration = Duration::from_secs(8);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("stop");
    let paths = resolve_paths()?;
    let lock_path = daemon_lock_path(&paths);
    report.detail(format!("daemon_lock={}", lock_path.display()));

    let payload = match read_daemon_lock_payload(&paths) {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            report.detail("watchd already stopped (lock payload missing)");
            return Ok(report);
        }
        Err(err) => {
            report.issue(format!(
                "failed to read daemon lock {}: {err:#}",
                lock_path.display()
            ));
            return Ok(report);
        }
    };
    let pid = payload.pid;
    report.detail(format!("daemon_pid={pid}"));

    if !pid_alive(pid) || !daemon_lock_held(&paths) {
        report.detail(format!("daemon pid {pid} is not running"));
        return Ok(report);
    }

    match DaemonClient::connect(&paths.sock_path)
        .and_then(|mut client| client.request(&json!(["shutdown-server"])))
    {
        Ok(_) => report.detail("shutdown requested"),
        Err(err) => {
            report.issue(format!("failed to request shutdown: {err:#}"));
            return Ok(report);
        }
    }

    let deadline = Instant::now() + STOP_TIMEOUT;
    while Instant::now() < deadline {
        // The lock is released on exit even while the pid is still a zombie.
        if !pid_alive(pid) || !daemon_lock_held(&paths) {
            report.detail(format!("stopped watchd pid={pid}"));
            return Ok(report);
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }

    report.issue(format!(
        "timed out waiting for daemon pid {pid} to stop after {}s",
        STOP_TIMEOUT.as_secs()
    ));
    Ok(report)
}
