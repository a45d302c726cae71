use anyhow::Result;
use serde_json::json;
use std::path::Path;

use crate::commands::{CommandReport, absolute_root, daemon_request, detail_fields};

pub fn run(path: &Path, sync_timeout_ms: u64) -> Result<CommandReport> {
    let mut report = CommandReport::new("clock");
    let root = absolute_root(path)?;
    let request = json!(["clock", root, { "sync_timeout": sync_timeout_ms }]);
    if let Some(response) = daemon_request(&mut report, &request)? {
        detail_fields(&mut report, &response);
    }
    Ok(report)
}
