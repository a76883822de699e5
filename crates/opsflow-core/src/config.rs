//! Configuration resolution for opsflow.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/opsflow/settings.json)
//! 3. Project config (.opsflow/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default pool size limit.
pub const DEFAULT_POOL_MAX_SIZE: usize = 10;

/// Default share of `max_size` created up front.
pub const DEFAULT_PREALLOCATED_FRACTION: f64 = 0.1;

/// Default limit on queued acquire requests.
pub const DEFAULT_POOL_MAX_QUEUE_SIZE: usize = 100;

/// Complete opsflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub interpreter: InterpreterSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            interpreter: InterpreterSettings::default(),
            storage: StorageSettings::default(),
            log_level: default_log_level(),
        }
    }
}

/// Raw pool sizing as written by the user.
///
/// Values are signed and optional so that out-of-range input can be detected
/// and replaced by defaults in [`PoolSettings::normalize`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_size: Option<i64>,
    pub preallocated_size: Option<i64>,
    pub max_queue_size: Option<i64>,
}

/// Normalised pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_size: usize,
    pub preallocated_size: usize,
    pub max_queue_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolSettings::default().normalize()
    }
}

impl PoolConfig {
    /// Build a normalised config from possibly out-of-range values.
    pub fn new(max_size: i64, preallocated_size: i64, max_queue_size: i64) -> Self {
        PoolSettings {
            max_size: Some(max_size),
            preallocated_size: Some(preallocated_size),
            max_queue_size: Some(max_queue_size),
        }
        .normalize()
    }
}

impl PoolSettings {
    /// Apply the fallback rules:
    ///
    /// - `max_size <= 0` or missing falls back to [`DEFAULT_POOL_MAX_SIZE`].
    /// - `preallocated_size` missing, negative or above `max_size` falls back
    ///   to `round(0.1 * max_size)`.
    /// - `max_queue_size` missing or negative falls back to
    ///   [`DEFAULT_POOL_MAX_QUEUE_SIZE`].
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn normalize(self) -> PoolConfig {
        let max_size = match self.max_size {
            Some(n) if n > 0 => n as usize,
            _ => DEFAULT_POOL_MAX_SIZE,
        };
        let fallback_prealloc = default_preallocated(max_size);
        let preallocated_size = match self.preallocated_size {
            Some(n) if n >= 0 && (n as usize) <= max_size => n as usize,
            _ => fallback_prealloc,
        };
        let max_queue_size = match self.max_queue_size {
            Some(n) if n >= 0 => n as usize,
            _ => DEFAULT_POOL_MAX_QUEUE_SIZE,
        };
        PoolConfig {
            max_size,
            preallocated_size,
            max_queue_size,
        }
    }
}

/// `round(0.1 * max_size)`, never above `max_size`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]
pub fn default_preallocated(max_size: usize) -> usize {
    let n = (max_size as f64 * DEFAULT_PREALLOCATED_FRACTION).round() as usize;
    n.min(max_size)
}

/// Which command protocol the interpreter speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectKind {
    #[default]
    PowerShell,
    Posix,
}

impl std::str::FromStr for DialectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "powershell" | "pwsh" => Ok(Self::PowerShell),
            "posix" | "sh" => Ok(Self::Posix),
            other => Err(Error::Config(format!("Unknown interpreter dialect: {other}"))),
        }
    }
}

/// External interpreter process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterSettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub dialect: DialectKind,
    /// Grace period for a hard kill to reap the process.
    pub terminate_timeout_secs: u64,
    /// Override for the end-of-invocation sentinel regex. Must define a
    /// `token` group and may define a `code` group.
    pub delimiter_pattern: Option<String>,
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pwsh"),
            args: vec![
                "-NoLogo".to_string(),
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-Command".to_string(),
                "-".to_string(),
            ],
            dialect: DialectKind::PowerShell,
            terminate_timeout_secs: 5,
            delimiter_pattern: None,
        }
    }
}

impl InterpreterSettings {
    /// Settings for a plain POSIX shell reading commands from stdin.
    pub fn posix_shell() -> Self {
        Self {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-s".to_string()],
            dialect: DialectKind::Posix,
            terminate_timeout_secs: 5,
            delimiter_pattern: None,
        }
    }
}

/// Where workflows, credentials and execution logs live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    pub database_path: Option<PathBuf>,
    pub workflows_dir: Option<PathBuf>,
    pub credentials_file: Option<PathBuf>,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".opsflow").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Default SQLite path for execution logs.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("executions.db"))
}

/// Default workflow catalog directory.
pub fn workflows_dir() -> Option<PathBuf> {
    config_dir().map(|p| p.join("workflows"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".opsflow"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/opsflow"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("opsflow"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.pool.max_size.is_some() {
        base.pool.max_size = overlay.pool.max_size;
    }
    if overlay.pool.preallocated_size.is_some() {
        base.pool.preallocated_size = overlay.pool.preallocated_size;
    }
    if overlay.pool.max_queue_size.is_some() {
        base.pool.max_queue_size = overlay.pool.max_queue_size;
    }

    base.interpreter = overlay.interpreter;

    if overlay.storage.database_path.is_some() {
        base.storage.database_path = overlay.storage.database_path;
    }
    if overlay.storage.workflows_dir.is_some() {
        base.storage.workflows_dir = overlay.storage.workflows_dir;
    }
    if overlay.storage.credentials_file.is_some() {
        base.storage.credentials_file = overlay.storage.credentials_file;
    }

    base.log_level = overlay.log_level;
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(n) = env_i64("OPSFLOW_POOL_MAX_SIZE") {
        config.pool.max_size = Some(n);
    }
    if let Some(n) = env_i64("OPSFLOW_POOL_PREALLOCATED_SIZE") {
        config.pool.preallocated_size = Some(n);
    }
    if let Some(n) = env_i64("OPSFLOW_POOL_MAX_QUEUE_SIZE") {
        config.pool.max_queue_size = Some(n);
    }
    if let Ok(val) = std::env::var("OPSFLOW_INTERPRETER") {
        config.interpreter.program = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("OPSFLOW_LOG_LEVEL") {
        config.log_level = val;
    }
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_documented_fallbacks() {
        let limits = PoolSettings::default().normalize();
        assert_eq!(limits.max_size, 10);
        assert_eq!(limits.preallocated_size, 1);
        assert_eq!(limits.max_queue_size, 100);
    }

    #[test]
    fn preallocated_above_max_falls_back_to_fraction() {
        let limits = PoolSettings {
            max_size: Some(30),
            preallocated_size: Some(31),
            max_queue_size: None,
        }
        .normalize();
        assert_eq!(limits.preallocated_size, 3);
    }

    #[test]
    fn negative_values_fall_back() {
        let limits = PoolSettings {
            max_size: Some(-4),
            preallocated_size: Some(-1),
            max_queue_size: Some(-7),
        }
        .normalize();
        assert_eq!(limits.max_size, 10);
        assert_eq!(limits.preallocated_size, 1);
        assert_eq!(limits.max_queue_size, 100);
    }

    #[test]
    fn zero_queue_is_kept() {
        let limits = PoolSettings {
            max_size: Some(3),
            preallocated_size: Some(0),
            max_queue_size: Some(0),
        }
        .normalize();
        assert_eq!(limits.preallocated_size, 0);
        assert_eq!(limits.max_queue_size, 0);
    }

    #[test]
    fn fraction_rounds() {
        assert_eq!(default_preallocated(5), 1);
        assert_eq!(default_preallocated(4), 0);
        assert_eq!(default_preallocated(25), 3);
    }

    #[test]
    fn project_file_overrides_pool_fields() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".opsflow");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("settings.json"),
            r#"{"pool": {"max_size": 4}, "log_level": "debug"}"#,
        )
        .unwrap();

        let mut base = Config::default();
        let overlay = load_config_file(&cfg_dir.join("settings.json")).unwrap();
        merge_config(&mut base, overlay);
        assert_eq!(base.pool.max_size, Some(4));
        assert_eq!(base.log_level, "debug");
    }

    #[test]
    fn dialect_parses_aliases() {
        assert_eq!("pwsh".parse::<DialectKind>().unwrap(), DialectKind::PowerShell);
        assert_eq!("sh".parse::<DialectKind>().unwrap(), DialectKind::Posix);
        assert!("cmd".parse::<DialectKind>().is_err());
    }
}
