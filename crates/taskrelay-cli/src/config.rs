//! Configuration file management for taskrelay.
//!
//! Provides a TOML-based config file at `~/.config/taskrelay/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use taskrelay_core::failure_detector::{self, FailureDetectorConfig};
use taskrelay_core::retry::{self, RetryConfig};
use taskrelay_core::scheduler::{self, SchedulerConfig};
use taskrelay_core::worker::{self, WorkerConfig};
use taskrelay_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

/// All engine knobs are optional in the file; an absent field falls back to
/// its env var, then its compile-time default, per [`TaskrelayConfig::resolve`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub polling_interval_ms: Option<u64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkerSection {
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RetrySection {
    pub default_max_retries: Option<i32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MonitoringSection {
    pub failure_detection_interval_ms: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the taskrelay config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/taskrelay` or
/// `~/.config/taskrelay`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("taskrelay");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("taskrelay")
}

/// Return the path to the taskrelay config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct TaskrelayConfig {
    pub db_config: DbConfig,
    pub scheduler_config: SchedulerConfig,
    pub scheduler_enabled: bool,
    pub worker_config: WorkerConfig,
    pub worker_enabled: bool,
    pub retry_config: RetryConfig,
    pub failure_detector_config: FailureDetectorConfig,
}

/// Env var > config file value > compile-time default, for one numeric knob.
fn resolve_u64(env_var: &str, file_value: Option<u64>, default: u64) -> u64 {
    std::env::var(env_var)
        .ok()
        .and_then(|v| v.parse().ok())
        .or(file_value)
        .unwrap_or(default)
}

fn resolve_i32(env_var: &str, file_value: Option<i32>, default: i32) -> i32 {
    std::env::var(env_var)
        .ok()
        .and_then(|v| v.parse().ok())
        .or(file_value)
        .unwrap_or(default)
}

fn resolve_bool(env_var: &str, file_value: Option<bool>, default: bool) -> bool {
    std::env::var(env_var)
        .ok()
        .and_then(|v| v.parse().ok())
        .or(file_value)
        .unwrap_or(default)
}

impl TaskrelayConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    /// (the `database.url` knob additionally accepts a CLI flag; the engine
    /// knobs below have no CLI flag, only env var / file / default.)
    ///
    /// DB URL: `cli_db_url` > `TASKRELAY_DATABASE_URL` env > `config_file.database.url`
    /// > `DbConfig::DEFAULT_URL`.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("TASKRELAY_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let scheduler_file = file_config.as_ref().map(|c| &c.scheduler);
        let worker_file = file_config.as_ref().map(|c| &c.worker);
        let retry_file = file_config.as_ref().map(|c| &c.retry);
        let monitoring_file = file_config.as_ref().map(|c| &c.monitoring);

        let heartbeat_timeout_ms = resolve_u64(
            "TASKRELAY_WORKER_HEARTBEAT_TIMEOUT_MS",
            worker_file.and_then(|w| w.heartbeat_timeout_ms),
            failure_detector::DEFAULT_HEARTBEAT_TIMEOUT_MS,
        );

        Ok(Self {
            db_config: DbConfig::new(db_url),
            scheduler_config: SchedulerConfig {
                tick_interval_ms: resolve_u64(
                    "TASKRELAY_SCHEDULER_POLLING_INTERVAL_MS",
                    scheduler_file.and_then(|s| s.polling_interval_ms),
                    scheduler::DEFAULT_TICK_INTERVAL_MS,
                ),
            },
            scheduler_enabled: resolve_bool(
                "TASKRELAY_SCHEDULER_ENABLED",
                scheduler_file.and_then(|s| s.enabled),
                true,
            ),
            worker_config: WorkerConfig {
                heartbeat_interval_ms: resolve_u64(
                    "TASKRELAY_WORKER_HEARTBEAT_INTERVAL_MS",
                    worker_file.and_then(|w| w.heartbeat_interval_ms),
                    worker::DEFAULT_HEARTBEAT_INTERVAL_MS,
                ),
                processing_interval_ms: worker::DEFAULT_PROCESSING_INTERVAL_MS,
            },
            worker_enabled: resolve_bool(
                "TASKRELAY_WORKER_ENABLED",
                worker_file.and_then(|w| w.enabled),
                true,
            ),
            retry_config: RetryConfig {
                default_max_retries: resolve_i32(
                    "TASKRELAY_RETRY_DEFAULT_MAX_RETRIES",
                    retry_file.and_then(|r| r.default_max_retries),
                    retry::DEFAULT_MAX_RETRIES,
                ),
                base_delay_ms: resolve_u64(
                    "TASKRELAY_RETRY_BASE_DELAY_MS",
                    retry_file.and_then(|r| r.base_delay_ms),
                    retry::DEFAULT_BASE_DELAY_MS,
                ),
                max_delay_ms: resolve_u64(
                    "TASKRELAY_RETRY_MAX_DELAY_MS",
                    retry_file.and_then(|r| r.max_delay_ms),
                    retry::DEFAULT_MAX_DELAY_MS,
                ),
            },
            failure_detector_config: FailureDetectorConfig {
                detection_interval_ms: resolve_u64(
                    "TASKRELAY_MONITORING_FAILURE_DETECTION_INTERVAL_MS",
                    monitoring_file.and_then(|m| m.failure_detection_interval_ms),
                    failure_detector::DEFAULT_DETECTION_INTERVAL_MS,
                ),
                heartbeat_timeout_ms: heartbeat_timeout_ms as i64,
                cleanup_after_ms: failure_detector::DEFAULT_CLEANUP_AFTER_MS,
            },
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("taskrelay");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            scheduler: SchedulerSection::default(),
            worker: WorkerSection::default(),
            retry: RetrySection::default(),
            monitoring: MonitoringSection::default(),
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_env() {
        let _lock = lock_env();

        unsafe { std::env::set_var("TASKRELAY_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = TaskrelayConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("TASKRELAY_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();

        unsafe { std::env::set_var("TASKRELAY_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = TaskrelayConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("TASKRELAY_DATABASE_URL") };
    }

    #[test]
    fn resolve_defaults_db_url_when_nothing_set() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("TASKRELAY_DATABASE_URL") };
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("HOME", tmp.path()) };
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };

        let config = TaskrelayConfig::resolve(None).unwrap();

        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
    }

    #[test]
    fn resolve_reads_config_file_when_no_cli_or_env() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("TASKRELAY_DATABASE_URL") };
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("HOME", tmp.path()) };
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };

        let dir = tmp.path().join(".config").join("taskrelay");
        std::fs::create_dir_all(&dir).unwrap();
        let file_config = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://fromfile:5432/filedb".to_string(),
            },
            scheduler: SchedulerSection::default(),
            worker: WorkerSection::default(),
            retry: RetrySection::default(),
            monitoring: MonitoringSection::default(),
        };
        std::fs::write(
            dir.join("config.toml"),
            toml::to_string_pretty(&file_config).unwrap(),
        )
        .unwrap();

        let config = TaskrelayConfig::resolve(None).unwrap();

        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        assert_eq!(config.db_config.database_url, "postgresql://fromfile:5432/filedb");
    }

    #[test]
    fn resolve_applies_engine_env_var_overrides() {
        let _lock = lock_env();

        unsafe { std::env::set_var("TASKRELAY_SCHEDULER_POLLING_INTERVAL_MS", "250") };
        unsafe { std::env::set_var("TASKRELAY_WORKER_ENABLED", "false") };

        let config = TaskrelayConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.scheduler_config.tick_interval_ms, 250);
        assert!(!config.worker_enabled);

        unsafe { std::env::remove_var("TASKRELAY_SCHEDULER_POLLING_INTERVAL_MS") };
        unsafe { std::env::remove_var("TASKRELAY_WORKER_ENABLED") };
    }

    #[test]
    fn resolve_falls_back_to_engine_defaults() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("TASKRELAY_SCHEDULER_POLLING_INTERVAL_MS") };
        unsafe { std::env::remove_var("TASKRELAY_WORKER_ENABLED") };
        unsafe { std::env::remove_var("TASKRELAY_RETRY_DEFAULT_MAX_RETRIES") };

        let config = TaskrelayConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.scheduler_config.tick_interval_ms, scheduler::DEFAULT_TICK_INTERVAL_MS);
        assert!(config.scheduler_enabled);
        assert!(config.worker_enabled);
        assert_eq!(config.retry_config.default_max_retries, retry::DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("taskrelay/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
