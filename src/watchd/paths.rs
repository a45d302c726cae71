use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct WatchdPaths {
    pub home: PathBuf,
    pub sock_path: PathBuf,
    pub logs_dir: PathBuf,
    pub config_file: PathBuf,
    pub home_is_explicit: bool,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

fn watchd_home_from_inputs(home: PathBuf, watchd_home_env: Option<&str>) -> (PathBuf, bool) {
    match watchd_home_env {
        Some(v) if !v.trim().is_empty() => (PathBuf::from(v.trim()), true),
        _ => (home.join(".watchd"), false),
    }
}

pub fn resolve_paths() -> Result<WatchdPaths> {
    let home = required_home_dir()?;
    let home_env = env::var("WATCHD_HOME").ok();
    let (watchd_home, is_explicit) = watchd_home_from_inputs(home, home_env.as_deref());

    let sock_path = env_or_default_path("WATCHD_SOCK", watchd_home.join("watchd.sock"));
    let logs_dir = env_or_default_path("WATCHD_LOGS_DIR", watchd_home.join("logs"));
    let config_file = env_or_default_path("WATCHD_CONFIG_PATH", watchd_home.join("watchd.toml"));

    Ok(WatchdPaths {
        home: watchd_home,
        sock_path,
        logs_dir,
        config_file,
        home_is_explicit: is_explicit,
    })
}
