// Layered configuration: defaults file, local override file, environment.

use chrono::NaiveTime;
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub settlement: SettlementConfig,
    pub alerts: AlertConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the scheduler looks for due jobs.
    pub tick_interval_seconds: u64,
    /// How often the stale-lease sweep runs.
    pub sweep_interval_seconds: u64,
    /// A running job whose heartbeat is older than this is presumed dead.
    pub stale_after_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Concurrent runs allowed per batch job kind.
    pub batch_concurrency: u32,
    pub heartbeat_interval_seconds: u64,
    pub retry_base_delay_seconds: u64,
    pub retry_max_delay_seconds: u64,
    pub retry_jitter_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// IANA timezone the settlement day is anchored to.
    pub timezone: String,
    /// Local wall-clock window boundaries, "%H:%M", strictly increasing.
    pub window_boundaries: Vec<String>,
    /// Cover threshold per payment cycle, in minor currency units.
    pub threshold_minor: i64,
    pub cash_account: String,
    pub premium_income_account: String,
}

impl SettlementConfig {
    pub fn boundaries(&self) -> Result<Vec<NaiveTime>, String> {
        self.window_boundaries
            .iter()
            .map(|s| {
                NaiveTime::parse_from_str(s, "%H:%M")
                    .map_err(|e| format!("Invalid window boundary '{}': {}", s, e))
            })
            .collect()
    }

    pub fn tz(&self) -> Result<Tz, String> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| format!("Invalid timezone '{}'", self.timezone))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// When set, alerts are POSTed here in addition to the log stream.
    pub webhook_url: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → local → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local configuration, not committed to git
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject configurations the services cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.scheduler.tick_interval_seconds == 0 {
            return Err("Scheduler tick_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.sweep_interval_seconds == 0 {
            return Err("Scheduler sweep_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.stale_after_seconds == 0 {
            return Err("Scheduler stale_after_seconds must be greater than 0".to_string());
        }

        if self.executor.batch_concurrency == 0 {
            return Err("Executor batch_concurrency must be greater than 0".to_string());
        }
        if self.executor.heartbeat_interval_seconds >= self.scheduler.stale_after_seconds {
            return Err(
                "Executor heartbeat_interval_seconds must be less than scheduler stale_after_seconds"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.executor.retry_jitter_factor) {
            return Err("Executor retry_jitter_factor must be between 0.0 and 1.0".to_string());
        }

        if self.settlement.threshold_minor <= 0 {
            return Err("Settlement threshold_minor must be greater than 0".to_string());
        }
        let boundaries = self.settlement.boundaries()?;
        if boundaries.is_empty() {
            return Err("Settlement window_boundaries cannot be empty".to_string());
        }
        if !boundaries.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err("Settlement window_boundaries must be strictly increasing".to_string());
        }
        self.settlement.tz()?;
        if self.settlement.cash_account.is_empty()
            || self.settlement.premium_income_account.is_empty()
        {
            return Err("Settlement ledger accounts cannot be empty".to_string());
        }

        if matches!(self.alerts.webhook_url.as_deref(), Some("")) {
            return Err("Alert webhook_url cannot be an empty string".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/boda_cover".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            scheduler: SchedulerConfig {
                tick_interval_seconds: 5,
                sweep_interval_seconds: 60,
                stale_after_seconds: 300,
            },
            executor: ExecutorConfig {
                batch_concurrency: 2,
                heartbeat_interval_seconds: 30,
                retry_base_delay_seconds: 5,
                retry_max_delay_seconds: 1800,
                retry_jitter_factor: 0.1,
            },
            settlement: SettlementConfig {
                timezone: "Africa/Nairobi".to_string(),
                window_boundaries: vec![
                    "08:00".to_string(),
                    "14:00".to_string(),
                    "20:00".to_string(),
                ],
                threshold_minor: 10_000,
                cash_account: "1001".to_string(),
                premium_income_account: "4001".to_string(),
            },
            alerts: AlertConfig {
                webhook_url: None,
                timeout_seconds: 10,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}
