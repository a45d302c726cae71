use anyhow::Result;
use serde_json::{Value, json};
use std::path::Path;

use crate::commands::{CommandReport, absolute_root, daemon_request, detail_fields};

pub fn run(path: &Path) -> Result<CommandReport> {
    let mut report = CommandReport::new("watch");
    let root = absolute_root(path)?;
    if let Some(response) = daemon_request(&mut report, &json!(["watch", root]))? {
        detail_fields(&mut report, &response);
    }
    Ok(report)
}

pub fn run_del(path: &Path) -> Result<CommandReport> {
    let mut report = CommandReport::new("watch-del");
    let root = absolute_root(path)?;
    if let Some(response) = daemon_request(&mut report, &json!(["watch-del", root]))? {
        detail_fields(&mut report, &response);
    }
    Ok(report)
}

pub fn run_list() -> Result<CommandReport> {
    let mut report = CommandReport::new("watch-list");
    if let Some(response) = daemon_request(&mut report, &json!(["watch-list"]))? {
        let roots = response.get("roots").and_then(Value::as_array);
        for root in roots.into_iter().flatten().filter_map(Value::as_str) {
            report.detail(format!("root={root}"));
        }
    }
    Ok(report)
}
