use anyhow::Result;

use crate::commands::CommandReport;
use crate::watchd::config::load_config;
use crate::watchd::paths::resolve_paths;
use crate::watchd::server;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let config = load_config(&paths.config_file)?;
    tracing::info!(
        home = %paths.home.display(),
        config = %paths.config_file.display(),
        settle_ms = config.watcher.settle_ms,
        "starting watchd"
    );

    server::serve(&paths, &config)?;

    let mut report = CommandReport::new("serve");
    report.detail(format!("sock={}", paths.sock_path.display()));
    report.detail("daemon stopped");
    Ok(report)
}
