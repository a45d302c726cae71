pub mod clock;
pub mod debug;
pub mod query;
pub mod serve;
pub mod status;
pub mod stop;
pub mod watch;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::watchd::client::{DaemonClient, response_error};
use crate::watchd::paths::resolve_paths;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

/// Absolute form of a path given on the command line; the daemon only
/// accepts absolute roots.
pub fn absolute_root(raw: &Path) -> Result<String> {
    let absolute: PathBuf =
        std::path::absolute(raw).with_context(|| format!("failed to resolve {}", raw.display()))?;
    Ok(absolute.to_string_lossy().into_owned())
}

/// Send `request` to the running daemon. A daemon-side error becomes a report
/// issue and `None`.
pub fn daemon_request(report: &mut CommandReport, request: &Value) -> Result<Option<Value>> {
    let paths = resolve_paths()?;
    let mut client = DaemonClient::connect(&paths.sock_path)?;
    let response = client.request(request)?;
    if let Some((kind, message)) = response_error(&response) {
        report.issue(format!("{kind}: {message}"));
        return Ok(None);
    }
    Ok(Some(response))
}

/// Flatten a response object into `key=value` details.
pub fn detail_fields(report: &mut CommandReport, response: &Value) {
    let Some(obj) = response.as_object() else {
        report.detail(response.to_string());
        return;
    };
    for (key, value) in obj {
        if key == "version" {
            continue;
        }
        match value {
            Value::String(s) => report.detail(format!("{key}={s}")),
            other => report.detail(format!("{key}={other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandReport, detail_fields};
    use serde_json::json;

    #[test]
    fn issue_marks_report_failed() {
        let mut report = CommandReport::new("clock");
        assert!(report.ok);
        report.issue("timeout: timed out");
        assert!(!report.ok);
        assert_eq!(report.issues.len(), 1);
    }

    #[test]
    fn detail_fields_skip_version() {
        let mut report = CommandReport::new("clock");
        detail_fields(&mut report, &json!({"version": "0.1.0", "clock": "c:1:2:3:4", "n": 2}));
        assert_eq!(report.details, vec!["clock=c:1:2:3:4", "n=2"]);
    }
}
