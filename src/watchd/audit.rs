use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const MAX_AUDIT_LOG_SIZE: u64 = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at: String,
    pub action: String,
    pub root: Option<String>,
    pub message: String,
}

/// Append-only record of operator actions against the daemon.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            path: logs_dir.join("audit.log"),
        }
    }

    pub fn append(&self, action: &str, root: Option<&Path>, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let event = AuditEvent {
            at: chrono::Utc::now().to_rfc3339(),
            action: action.to_string(),
            root: root.map(|p| p.display().to_string()),
            message: message.to_string(),
        };

        let line = format!("{}\n", serde_json::to_string(&event)?);
        let _ = maybe_rotate_log(&self.path);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Audit failures never fail the request that triggered them.
    pub fn record(&self, action: &str, root: Option<&Path>, message: &str) {
        if let Err(err) = self.append(action, root, message) {
            tracing::warn!(
                code = "AUDIT_WRITE_FAILED",
                stage = "audit",
                action,
                err = %format!("{err:#}"),
                "failed to append audit event"
            );
        }
    }
}

fn maybe_rotate_log(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::metadata(path)
        && meta.len() >= MAX_AUDIT_LOG_SIZE
    {
        let backup = format!("{}.1", path.display());
        let _ = fs::rename(path, backup);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::AuditLog;
    use serde_json::Value;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn appends_json_lines() {
        let tmp = tempdir().expect("tempdir");
        let audit = AuditLog::new(&tmp.path().join("logs"));
        audit
            .append("debug-recrawl", Some(Path::new("/w/root")), "requested")
            .expect("append");
        audit.append("debug-pause-watchers", None, "paused").expect("append");

        let raw = fs::read_to_string(&audit.path).expect("read");
        let lines: Vec<Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["action"], "debug-recrawl");
        assert_eq!(lines[0]["root"], "/w/root");
        assert!(lines[1]["root"].is_null());
    }
}
