//! Engine context shared by the scheduler, the worker pool and the catalog
//! store. Built once per invocation and handed to each component.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::fsutil::shell_join;

pub const ENV_HOME: &str = "SBX_HOME";
pub const ENV_CATALOG: &str = "SBX_CATALOG";
pub const ENV_CATALOG_LOCK: &str = "SBX_CATALOG_LOCK";
pub const ENV_LOCK_TIMEOUT_MS: &str = "SBX_LOCK_TIMEOUT_MS";
pub const ENV_LOCK_RETRY_MS: &str = "SBX_LOCK_RETRY_MS";
pub const ENV_LOCK_STRATEGY: &str = "SBX_LOCK_STRATEGY";
pub const ENV_SKIP_CATALOG: &str = "SBX_SKIP_CATALOG";
pub const ENV_MAX_WORKERS: &str = "SBX_MAX_WORKERS";
pub const ENV_COMMAND_TIMEOUT_SECS: &str = "SBX_COMMAND_TIMEOUT_SECS";
pub const ENV_VERBOSE: &str = "SBX_VERBOSE_CONCURRENCY";
pub const ENV_DEBUG: &str = "SBX_DEBUG_CONCURRENCY";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(3);
/// A directory lock older than this, or whose owner is gone, is reclaimed.
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(10);
pub const CATALOG_FILE_NAME: &str = "sandboxes.json";
pub const LOCK_FILE_NAME: &str = "sandboxes.lock";
pub const CONFIG_FILE_NAME: &str = "sbx.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// OS advisory lock on the lock file (`flock` on unix, `LockFileEx` on
    /// windows). Released by the kernel when the holder dies.
    Flock,
    /// Atomic `mkdir` of `<lock_path>.d`, reclaimed once its owner is gone.
    Directory,
}

impl LockStrategy {
    pub fn platform_default() -> Self {
        LockStrategy::Flock
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockStrategy::Flock => "flock",
            LockStrategy::Directory => "directory",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "flock" => Ok(LockStrategy::Flock),
            "directory" | "dir" | "mkdir" => Ok(LockStrategy::Directory),
            other => Err(anyhow!(
                "unknown lock strategy '{}' (expected flock or directory)",
                other
            )),
        }
    }
}

/// Hands out diagnostic operation ids. Clones share the same sequence.
#[derive(Debug, Clone, Default)]
pub struct OperationCounter(Arc<AtomicU64>);

impl OperationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn issued(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub home_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub lock_path: PathBuf,
    pub lock_timeout: Duration,
    pub lock_retry_interval: Duration,
    pub lock_strategy: LockStrategy,
    pub catalog_enabled: bool,
    pub max_workers: Option<usize>,
    pub command_timeout: Option<Duration>,
    pub verbose: bool,
    pub debug: bool,
    pub tool_version: String,
    pub command_line: String,
    pub counter: OperationCounter,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    catalog_path: Option<PathBuf>,
    #[serde(default)]
    lock_path: Option<PathBuf>,
    #[serde(default)]
    lock_timeout_ms: Option<u64>,
    #[serde(default)]
    lock_retry_ms: Option<u64>,
    #[serde(default)]
    lock_strategy: Option<LockStrategy>,
    #[serde(default)]
    catalog_enabled: Option<bool>,
    #[serde(default)]
    max_workers: Option<usize>,
    #[serde(default)]
    command_timeout_secs: Option<u64>,
    #[serde(default)]
    verbose: Option<bool>,
    #[serde(default)]
    debug: Option<bool>,
}

impl EngineConfig {
    /// Defaults rooted at `home`: catalog and lock file both live there.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home_dir = home.into();
        Self {
            catalog_path: home_dir.join(CATALOG_FILE_NAME),
            lock_path: home_dir.join(LOCK_FILE_NAME),
            home_dir,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            lock_strategy: LockStrategy::platform_default(),
            catalog_enabled: true,
            max_workers: None,
            command_timeout: None,
            verbose: false,
            debug: false,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            command_line: shell_join(&std::env::args().collect::<Vec<_>>()),
            counter: OperationCounter::new(),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Defaults, then `<home>/sbx.json` if present, then the environment as
    /// seen through `lookup`.
    pub fn load_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = match non_empty(lookup(ENV_HOME)) {
            Some(home) => PathBuf::from(home),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("cannot determine home directory; set {}", ENV_HOME))?
                .join(".sbx"),
        };
        let mut config = Self::with_home(home);
        let file_path = config.home_dir.join(CONFIG_FILE_NAME);
        if file_path.exists() {
            config.apply_file(&file_path)?;
        }
        config.apply_env(lookup)?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        if let Some(p) = file.catalog_path {
            self.catalog_path = p;
        }
        if let Some(p) = file.lock_path {
            self.lock_path = p;
        }
        if let Some(ms) = file.lock_timeout_ms {
            self.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.lock_retry_ms {
            self.lock_retry_interval = Duration::from_millis(ms);
        }
        if let Some(s) = file.lock_strategy {
            self.lock_strategy = s;
        }
        if let Some(enabled) = file.catalog_enabled {
            self.catalog_enabled = enabled;
        }
        if file.max_workers.is_some() {
            self.max_workers = file.max_workers.filter(|n| *n > 0);
        }
        if let Some(secs) = file.command_timeout_secs {
            self.command_timeout = Some(Duration::from_secs(secs)).filter(|d| !d.is_zero());
        }
        if let Some(v) = file.verbose {
            self.verbose = v;
        }
        if let Some(d) = file.debug {
            self.debug = d;
        }
        Ok(())
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(p) = non_empty(lookup(ENV_CATALOG)) {
            self.catalog_path = PathBuf::from(p);
        }
        if let Some(p) = non_empty(lookup(ENV_CATALOG_LOCK)) {
            self.lock_path = PathBuf::from(p);
        }
        if let Some(ms) = parse_env_u64(&lookup, ENV_LOCK_TIMEOUT_MS)? {
            self.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env_u64(&lookup, ENV_LOCK_RETRY_MS)? {
            self.lock_retry_interval = Duration::from_millis(ms);
        }
        if let Some(s) = non_empty(lookup(ENV_LOCK_STRATEGY)) {
            self.lock_strategy =
                LockStrategy::parse(&s).with_context(|| format!("invalid {}", ENV_LOCK_STRATEGY))?;
        }
        if non_empty(lookup(ENV_SKIP_CATALOG)).is_some() {
            self.catalog_enabled = false;
        }
        if let Some(n) = parse_env_u64(&lookup, ENV_MAX_WORKERS)? {
            self.max_workers = Some(n as usize).filter(|n| *n > 0);
        }
        if let Some(secs) = parse_env_u64(&lookup, ENV_COMMAND_TIMEOUT_SECS)? {
            self.command_timeout = Some(Duration::from_secs(secs)).filter(|d| !d.is_zero());
        }
        if non_empty(lookup(ENV_VERBOSE)).is_some() {
            self.verbose = true;
        }
        if non_empty(lookup(ENV_DEBUG)).is_some() {
            self.debug = true;
        }
        Ok(())
    }

    /// Whether command output should be echoed to the console.
    pub fn echo_output(&self) -> bool {
        self.verbose || self.debug
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_env_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup(key)) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| anyhow!("{} must be a non-negative integer (got '{}'): {}", key, raw, e)),
        None => Ok(None),
    }
}
