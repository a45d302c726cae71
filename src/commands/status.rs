use anyhow::Result;
use serde_json::{Value, json};

use crate::commands::CommandReport;
use crate::watchd::client::DaemonClient;
use crate::watchd::daemon_lock::{daemon_lock_held, read_daemon_lock_payload};
use crate::watchd::paths::resolve_paths;
use crate::watchd::util::pid_alive;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!(
        "home_source={}",
        if paths.home_is_explicit { "WATCHD_HOME" } else { "default" }
    ));
    report.detail(format!("sock={}", paths.sock_path.display()));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));
    report.detail(format!("config={}", paths.config_file.display()));

    let payload = match read_daemon_lock_payload(&paths) {
        Ok(payload) => payload,
        Err(err) => {
            report.issue(format!("failed to read daemon lock: {err:#}"));
            return Ok(report);
        }
    };
    let Some(payload) = payload else {
        report.detail("daemon=stopped");
        return Ok(report);
    };

    report.detail(format!("daemon_pid={}", payload.pid));
    report.detail(format!("daemon_build={}", payload.build_uuid));
    report.detail(format!("started_at_epoch_secs={}", payload.started_at_epoch_secs));
    if !pid_alive(payload.pid) || !daemon_lock_held(&paths) {
        report.detail("daemon=stopped (stale lock)");
        return Ok(report);
    }
    report.detail("daemon=running");

    match DaemonClient::connect(&paths.sock_path)
        .and_then(|mut client| client.request(&json!(["watch-list"])))
    {
        Ok(response) => {
            let roots = response
                .get("roots")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            report.detail(format!("roots={}", roots.len()));
            for root in roots.iter().filter_map(Value::as_str) {
                report.detail(format!("root={root}"));
            }
        }
        Err(err) => report.issue(format!("daemon not answering: {err:#}")),
    }
    Ok(report)
}
