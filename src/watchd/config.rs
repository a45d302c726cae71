use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_QUERY_SYNC_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdSyncConfig {
    pub default_query_sync_ms: u64,
}

impl Default for WatchdSyncConfig {
    fn default() -> Self {
        Self {
            default_query_sync_ms: DEFAULT_QUERY_SYNC_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdWatcherConfig {
    pub settle_ms: u64,
    pub batch_limit: usize,
}

impl Default for WatchdWatcherConfig {
    fn default() -> Self {
        Self {
            settle_ms: 20,
            batch_limit: 16_384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WatchdRestrictConfig {
    pub root_files: Vec<String>,
    pub enforce_root_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WatchdConfig {
    pub sync: WatchdSyncConfig,
    pub watcher: WatchdWatcherConfig,
    pub restrict: WatchdRestrictConfig,
    /// Where the file layer was read from; quoted in root restriction errors.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialWatchdConfig {
    sync: Option<PartialSyncConfig>,
    watcher: Option<PartialWatcherConfig>,
    restrict: Option<PartialRestrictConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSyncConfig {
    #[serde(alias = "sync_timeout_ms")]
    default_query_sync_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialWatcherConfig {
    settle_ms: Option<u64>,
    batch_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRestrictConfig {
    #[serde(alias = "root_restrict_files")]
    root_files: Option<Vec<String>>,
    enforce_root_files: Option<bool>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

fn validate(cfg: &WatchdConfig) -> Result<()> {
    if cfg.watcher.settle_ms == 0 {
        return Err(anyhow!("invalid watcher settle_ms: must be >= 1"));
    }
    if cfg.watcher.batch_limit == 0 {
        return Err(anyhow!("invalid watcher batch_limit: must be >= 1"));
    }
    if cfg.restrict.enforce_root_files && cfg.restrict.root_files.is_empty() {
        return Err(anyhow!(
            "invalid restrict config: enforce_root_files requires at least one root_files entry"
        ));
    }
    if cfg
        .restrict
        .root_files
        .iter()
        .any(|name| name.trim().is_empty() || name.contains('/'))
    {
        return Err(anyhow!(
            "invalid restrict config: root_files entries must be plain file names"
        ));
    }
    Ok(())
}

fn merge_file_config(base: &mut WatchdConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PartialWatchdConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse watchd config {}: {err}", path.display()))?;
    if let Some(sync) = parsed.sync
        && let Some(ms) = sync.default_query_sync_ms
    {
        base.sync.default_query_sync_ms = ms;
    }
    if let Some(watcher) = parsed.watcher {
        if let Some(settle_ms) = watcher.settle_ms {
            base.watcher.settle_ms = settle_ms;
        }
        if let Some(batch_limit) = watcher.batch_limit {
            base.watcher.batch_limit = batch_limit;
        }
    }
    if let Some(restrict) = parsed.restrict {
        if let Some(root_files) = restrict.root_files {
            base.restrict.root_files = root_files;
        }
        if let Some(enforce) = restrict.enforce_root_files {
            base.restrict.enforce_root_files = enforce;
        }
    }
    base.source_path = Some(path.to_path_buf());
    Ok(())
}

pub fn load_config(path: &Path) -> Result<WatchdConfig> {
    let mut cfg = WatchdConfig::default();
    merge_file_config(&mut cfg, path)?;

    cfg.sync.default_query_sync_ms =
        env_or_u64("WATCHD_QUERY_SYNC_MS", cfg.sync.default_query_sync_ms);
    cfg.watcher.settle_ms = env_or_u64("WATCHD_SETTLE_MS", cfg.watcher.settle_ms);
    cfg.watcher.batch_limit =
        env_or_u64("WATCHD_BATCH_LIMIT", cfg.watcher.batch_limit as u64) as usize;
    cfg.restrict.root_files = env_or_csv("WATCHD_ROOT_FILES", &cfg.restrict.root_files);
    cfg.restrict.enforce_root_files =
        env_or_bool("WATCHD_ENFORCE_ROOT_FILES", cfg.restrict.enforce_root_files);

    validate(&cfg)?;
    Ok(cfg)
}
