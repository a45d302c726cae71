use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::path::Path;

use crate::commands::{CommandReport, absolute_root, daemon_request};

pub fn run(path: &Path, spec: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("query");
    let root = absolute_root(path)?;
    let spec: Value = serde_json::from_str(spec).context("query spec must be valid json")?;
    let Some(response) = daemon_request(&mut report, &json!(["query", root, spec]))? else {
        return Ok(report);
    };

    if let Some(clock) = response.get("clock").and_then(Value::as_str) {
        report.detail(format!("clock={clock}"));
    }
    if let Some(fresh) = response.get("is_fresh_instance").and_then(Value::as_bool) {
        report.detail(format!("is_fresh_instance={fresh}"));
    }
    for file in response
        .get("files")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match file {
            Value::String(name) => report.detail(format!("file={name}")),
            other => report.detail(format!("file={other}")),
        }
    }
    Ok(report)
}
