use anyhow::Result;
use serde_json::json;
use std::path::Path;

use crate::commands::{CommandReport, absolute_root, daemon_request, detail_fields};

fn simple(command: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new(command);
    if let Some(response) = daemon_request(&mut report, &json!([command]))? {
        detail_fields(&mut report, &response);
    }
    Ok(report)
}

fn with_root(command: &str, path: &Path) -> Result<CommandReport> {
    let mut report = CommandReport::new(command);
    let root = absolute_root(path)?;
    if let Some(response) = daemon_request(&mut report, &json!([command, root]))? {
        detail_fields(&mut report, &response);
    }
    Ok(report)
}

pub fn pause_watchers() -> Result<CommandReport> {
    simple("debug-pause-watchers")
}

pub fn unpause_watchers() -> Result<CommandReport> {
    simple("debug-unpause-watchers")
}

pub fn recrawl(path: &Path) -> Result<CommandReport> {
    with_root("debug-recrawl", path)
}

pub fn abort_cookies(path: &Path) -> Result<CommandReport> {
    with_root("debug-abort-cookies", path)
}
