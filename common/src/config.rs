// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use crate::retry::ExponentialBackoff;
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub scheduler: SchedulerSettings,
    pub store: StoreConfig,
    pub nats: NatsConfig,
    pub runtime: RuntimeConfig,
    pub retry: RetryConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// How often time triggers are evaluated and held schedules re-checked
    pub poll_interval_seconds: u64,
    /// Number of shard workers processing schedules in parallel
    pub worker_count: usize,
    /// Bounded queue size per shard worker
    pub queue_capacity: usize,
    /// Compare-and-set retries before a notification is dropped for a schedule
    pub max_cas_attempts: u32,
    /// A launch claim older than this is considered abandoned
    pub claim_ttl_seconds: u64,
    /// Upper bound on cron fires generated per time trigger per tick
    #[serde(default = "default_max_fires_per_tick")]
    pub max_fires_per_tick: usize,
}

fn default_max_fires_per_tick() -> usize {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database: DatabaseConfig,
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

fn default_run_migrations() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_enabled")]
    pub enabled: bool,
    pub url: String,
    pub stream_name: String,
    /// Subject filter for notifications, e.g. `notifications.>`
    pub subject: String,
    pub consumer_name: String,
}

fn default_nats_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Every launch attempt timing out plus the longest backoff between them
    pub fn worst_case_launch(&self) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        Duration::from_secs(self.runtime.timeout_seconds.saturating_mul(u64::from(attempts)))
            + ExponentialBackoff::from_config(&self.retry).max_total_delay()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.poll_interval_seconds == 0 {
            return Err("Scheduler poll_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.worker_count == 0 {
            return Err("Scheduler worker_count must be greater than 0".to_string());
        }
        if self.scheduler.queue_capacity == 0 {
            return Err("Scheduler queue_capacity must be greater than 0".to_string());
        }
        if self.scheduler.max_cas_attempts == 0 {
            return Err("Scheduler max_cas_attempts must be greater than 0".to_string());
        }
        if self.scheduler.max_fires_per_tick == 0 {
            return Err("Scheduler max_fires_per_tick must be greater than 0".to_string());
        }

        if self.store.backend == StoreBackend::Postgres {
            if self.store.database.url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if self.store.database.max_connections == 0 {
                return Err("Database max_connections must be greater than 0".to_string());
            }
        }

        if self.nats.enabled {
            if self.nats.url.is_empty() {
                return Err("NATS URL cannot be empty".to_string());
            }
            if self.nats.stream_name.is_empty() {
                return Err("NATS stream_name cannot be empty".to_string());
            }
            if self.nats.subject.is_empty() {
                return Err("NATS subject cannot be empty".to_string());
            }
        }

        if self.runtime.base_url.is_empty() {
            return Err("Runtime base_url cannot be empty".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("Retry max_attempts must be greater than 0".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("Retry base_delay_ms cannot exceed max_delay_ms".to_string());
        }

        // A launch still retrying when its claim expires would be started again
        let worst_case_launch = self.worst_case_launch();
        if Duration::from_secs(self.scheduler.claim_ttl_seconds) <= worst_case_launch {
            return Err(format!(
                "Scheduler claim_ttl_seconds ({}) must exceed the longest launch with retries ({}s)",
                self.scheduler.claim_ttl_seconds,
                worst_case_launch.as_secs_f64().ceil()
            ));
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings {
                poll_interval_seconds: 10,
                worker_count: 8,
                queue_capacity: 1024,
                max_cas_attempts: 5,
                claim_ttl_seconds: 300,
                max_fires_per_tick: default_max_fires_per_tick(),
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                database: DatabaseConfig {
                    url: "postgresql://localhost/program_scheduler".to_string(),
                    max_connections: 10,
                    min_connections: 2,
                    connect_timeout_seconds: 30,
                },
                run_migrations: true,
            },
            nats: NatsConfig {
                enabled: true,
                url: "nats://localhost:4222".to_string(),
                stream_name: "notifications".to_string(),
                subject: "notifications.>".to_string(),
                consumer_name: "program_scheduler".to_string(),
            },
            runtime: RuntimeConfig {
                base_url: "http://localhost:11015".to_string(),
                timeout_seconds: 30,
            },
            retry: RetryConfig {
                base_delay_ms: 1000,
                max_delay_ms: 60_000,
                max_attempts: 5,
                jitter: true,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}
