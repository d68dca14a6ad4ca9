//! Configuration for the Themis judge
//!
//! Loaded from environment variables (and an optional `.env` file) at
//! startup. Every value has a default in [`crate::constants`] except the
//! database URL, which only the binary requires.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use themis_common::Language;

use crate::constants::*;

/// Themis configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment (development, staging, production)
    pub environment: String,

    /// PostgreSQL connection URL
    pub database_url: Option<String>,

    /// Maximum connections in the database pool
    pub database_max_connections: u32,

    /// Apply the bundled SQL migrations on startup
    pub run_migrations: bool,

    /// Prometheus metrics port
    pub metrics_port: u16,

    /// Emit JSON log lines instead of the human readable format
    pub json_logs: bool,

    pub scheduler: SchedulerConfig,

    pub intake: IntakeConfig,

    pub sandbox: SandboxConfig,
}

/// Worker pool and retry configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent judging workers
    pub worker_count: usize,

    /// Maximum number of queued submissions
    pub queue_capacity: usize,

    /// Drain the contest lane before the practice lane
    pub prioritize_contests: bool,

    /// Retries for infrastructure failures before JUDGE_ERROR
    pub max_retries: u32,

    pub retry_base_delay_ms: u64,

    pub retry_max_delay_ms: u64,

    /// Stop running test cases after the first non-accepted one
    pub stop_on_first_failure: bool,

    /// Pending-submission poll interval used by the binary
    pub pending_poll_interval_ms: u64,

    /// RUNNING submissions older than this are failed on startup
    pub stale_running_after_secs: u64,

    /// Interval of the unapplied-statistics sweep used by the binary
    pub stats_sweep_interval_secs: u64,
}

/// Intake validation configuration
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Maximum source size in bytes
    pub max_code_bytes: usize,

    /// Languages accepted at intake
    pub enabled_languages: Vec<Language>,
}

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory under which private build and run directories are created
    pub root: PathBuf,

    /// Wall-clock limit of the compile step in milliseconds
    pub compile_time_limit_ms: u64,

    /// Memory limit of the compile step in MB
    pub compile_memory_limit_mb: u64,

    /// Captured stdout limit in bytes
    pub output_limit_bytes: u64,

    /// Peak memory sampling interval in milliseconds
    pub memory_poll_interval_ms: u64,

    /// Run every program in a fresh network namespace
    pub isolate_network: bool,

    /// Run every build and program inside a private read-only root with
    /// its own mount and PID namespaces
    pub isolate_filesystem: bool,

    /// First uid of the pool programs run as when the judge is root
    pub uid_base: u32,

    /// Size of the uid pool
    pub uid_count: u32,

    /// RLIMIT_NPROC of a program running under a pooled uid
    pub max_processes: u64,

    /// RLIMIT_AS as a multiple of the memory limit
    pub address_space_multiplier: u64,

    /// Clamp for problem time limits
    pub max_time_limit_ms: u64,

    /// Clamp for problem memory limits
    pub max_memory_limit_mb: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            prioritize_contests: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            stop_on_first_failure: true,
            pending_poll_interval_ms: DEFAULT_PENDING_POLL_INTERVAL_MS,
            stale_running_after_secs: DEFAULT_STALE_RUNNING_AFTER_SECS,
            stats_sweep_interval_secs: DEFAULT_STATS_SWEEP_INTERVAL_SECS,
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_code_bytes: DEFAULT_MAX_CODE_BYTES,
            enabled_languages: Language::ALL.to_vec(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: env::temp_dir().join("themis"),
            compile_time_limit_ms: DEFAULT_COMPILE_TIME_LIMIT_MS,
            compile_memory_limit_mb: DEFAULT_COMPILE_MEMORY_LIMIT_MB,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            memory_poll_interval_ms: DEFAULT_MEMORY_POLL_INTERVAL_MS,
            isolate_network: true,
            isolate_filesystem: true,
            uid_base: DEFAULT_SANDBOX_UID_BASE,
            uid_count: DEFAULT_SANDBOX_UID_COUNT,
            max_processes: DEFAULT_MAX_PROCESSES,
            address_space_multiplier: DEFAULT_ADDRESS_SPACE_MULTIPLIER,
            max_time_limit_ms: DEFAULT_MAX_TIME_LIMIT_MS,
            max_memory_limit_mb: DEFAULT_MAX_MEMORY_LIMIT_MB,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let scheduler_defaults = SchedulerConfig::default();
        let sandbox_defaults = SandboxConfig::default();

        let scheduler = SchedulerConfig {
            worker_count: vars.parse("WORKER_COUNT", scheduler_defaults.worker_count)?,
            queue_capacity: vars.parse("QUEUE_CAPACITY", scheduler_defaults.queue_capacity)?,
            prioritize_contests: vars.flag("PRIORITIZE_CONTESTS", true)?,
            max_retries: vars.parse("MAX_RETRIES", scheduler_defaults.max_retries)?,
            retry_base_delay_ms: vars
                .parse("RETRY_BASE_DELAY_MS", scheduler_defaults.retry_base_delay_ms)?,
            retry_max_delay_ms: vars
                .parse("RETRY_MAX_DELAY_MS", scheduler_defaults.retry_max_delay_ms)?,
            stop_on_first_failure: vars.flag("STOP_ON_FIRST_FAILURE", true)?,
            pending_poll_interval_ms: vars.parse(
                "PENDING_POLL_INTERVAL_MS",
                scheduler_defaults.pending_poll_interval_ms,
            )?,
            stale_running_after_secs: vars.parse(
                "STALE_RUNNING_AFTER_SECS",
                scheduler_defaults.stale_running_after_secs,
            )?,
            stats_sweep_interval_secs: vars.parse(
                "STATS_SWEEP_INTERVAL_SECS",
                scheduler_defaults.stats_sweep_interval_secs,
            )?,
        };
        if scheduler.worker_count == 0 {
            return Err(ConfigError::InvalidValue("WORKER_COUNT".to_string()));
        }
        if scheduler.pending_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("PENDING_POLL_INTERVAL_MS".to_string()));
        }
        if scheduler.stats_sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("STATS_SWEEP_INTERVAL_SECS".to_string()));
        }

        let enabled_languages = match vars.get("ENABLED_LANGUAGES") {
            Some(list) => list
                .split(',')
                .filter(|item| !item.trim().is_empty())
                .map(|item| {
                    item.parse::<Language>()
                        .map_err(|_| ConfigError::InvalidValue("ENABLED_LANGUAGES".to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Language::ALL.to_vec(),
        };

        let intake = IntakeConfig {
            max_code_bytes: vars.parse("MAX_CODE_BYTES", DEFAULT_MAX_CODE_BYTES)?,
            enabled_languages,
        };

        let sandbox = SandboxConfig {
            root: vars
                .get("SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(sandbox_defaults.root),
            compile_time_limit_ms: vars
                .parse("COMPILE_TIME_LIMIT_MS", sandbox_defaults.compile_time_limit_ms)?,
            compile_memory_limit_mb: vars
                .parse("COMPILE_MEMORY_LIMIT_MB", sandbox_defaults.compile_memory_limit_mb)?,
            output_limit_bytes: vars
                .parse("OUTPUT_LIMIT_BYTES", sandbox_defaults.output_limit_bytes)?,
            memory_poll_interval_ms: vars
                .parse("MEMORY_POLL_INTERVAL_MS", sandbox_defaults.memory_poll_interval_ms)?,
            isolate_network: vars.flag("ISOLATE_NETWORK", true)?,
            isolate_filesystem: vars.flag("ISOLATE_FILESYSTEM", true)?,
            uid_base: vars.parse("SANDBOX_UID_BASE", sandbox_defaults.uid_base)?,
            uid_count: vars.parse("SANDBOX_UID_COUNT", sandbox_defaults.uid_count)?,
            max_processes: vars.parse("MAX_PROCESSES", sandbox_defaults.max_processes)?,
            address_space_multiplier: vars.parse(
                "ADDRESS_SPACE_MULTIPLIER",
                sandbox_defaults.address_space_multiplier,
            )?,
            max_time_limit_ms: vars
                .parse("MAX_TIME_LIMIT_MS", sandbox_defaults.max_time_limit_ms)?,
            max_memory_limit_mb: vars
                .parse("MAX_MEMORY_LIMIT_MB", sandbox_defaults.max_memory_limit_mb)?,
        };
        // uid 0 would hand programs root
        if sandbox.uid_base == 0 {
            return Err(ConfigError::InvalidValue("SANDBOX_UID_BASE".to_string()));
        }
        if sandbox.uid_count == 0 || sandbox.uid_base.checked_add(sandbox.uid_count).is_none() {
            return Err(ConfigError::InvalidValue("SANDBOX_UID_COUNT".to_string()));
        }

        Ok(Self {
            environment: vars
                .get("ENVIRONMENT")
                .unwrap_or_else(|| "development".to_string()),
            database_url: vars.get("DATABASE_URL"),
            database_max_connections: vars
                .parse("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS)?,
            run_migrations: vars.flag("RUN_MIGRATIONS", true)?,
            metrics_port: vars.parse("METRICS_PORT", DEFAULT_METRICS_PORT)?,
            json_logs: vars
                .get("LOG_FORMAT")
                .is_some_and(|format| format.eq_ignore_ascii_case("json")),
            scheduler,
            intake,
            sandbox,
        })
    }

    /// The database URL, required by the binary.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("DATABASE_URL".to_string()))
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string())),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|raw| raw.trim().to_ascii_lowercase()) {
            Some(raw) => match raw.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue(key.to_string())),
            },
            None => Ok(default),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}
