//! Worker process configuration, read from the environment.

use std::time::Duration;

use actors::DispatcherConfig;
use broker::BrokerConfig;
use job_core::{DEFAULT_CRON_OFFSET_SECS, DependencyPolicy};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}={value}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Deployment environment, `production` enables the cron catalogue.
    pub environment: String,
    pub broker: BrokerConfig,
    pub dispatcher: DispatcherConfig,
    pub cron_enabled: bool,
    pub cron_offset_secs: i32,
    /// Enqueue the refresh chain once at startup.
    pub run_refresh_chain: bool,
}

impl AppConfig {
    /// Build the config from `.env` and the process environment.
    ///
    /// - `ENV` (default: `development`)
    /// - `BROKER_URL` (default: `mem://`), `BROKER_NAMESPACE`, `BROKER_DATABASE`
    /// - `WORKER_ID` (default: a fresh `worker-<ulid>`), `WORKER_CONCURRENCY`
    /// - `WORKER_LEASE_SECS` (default: 30), after which a silent worker's
    ///   running jobs are failed
    /// - `SWEEP_INTERVAL_MS`, `JOB_TIMEOUT_SECS` (`0` disables the timeout)
    /// - `DEPENDENCY_POLICY` (`run_after_any` | `abort_on_failure`)
    /// - `CRON_UTC_OFFSET_HOURS` (default: `-5`)
    /// - `CRON_ENABLED` (default: true only when `ENV=production`)
    /// - `RUN_REFRESH_CHAIN` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let environment = var("ENV").unwrap_or_else(|| "development".to_string());

        let endpoint = var("BROKER_URL").unwrap_or_else(|| "mem://".into());
        let mut broker = BrokerConfig::endpoint(endpoint);
        if let Some(namespace) = var("BROKER_NAMESPACE") {
            broker = broker.with_namespace(namespace);
        }
        if let Some(database) = var("BROKER_DATABASE") {
            broker = broker.with_database(database);
        }

        let mut dispatcher = match var("WORKER_ID") {
            Some(worker_id) => DispatcherConfig::new(worker_id),
            None => DispatcherConfig::default(),
        };
        if let Some(concurrency) = parse::<usize>(&var, "WORKER_CONCURRENCY")? {
            dispatcher = dispatcher.with_concurrency(concurrency);
        }
        if let Some(ms) = parse::<u64>(&var, "SWEEP_INTERVAL_MS")? {
            dispatcher = dispatcher.with_tick_interval(Duration::from_millis(ms.max(1)));
        }
        if let Some(secs) = parse::<u64>(&var, "JOB_TIMEOUT_SECS")? {
            let timeout = (secs > 0).then(|| Duration::from_secs(secs));
            dispatcher = dispatcher.with_execution_timeout(timeout);
        }
        if let Some(policy) = parse::<DependencyPolicy>(&var, "DEPENDENCY_POLICY")? {
            dispatcher = dispatcher.with_dependency_policy(policy);
        }
        if let Some(secs) = parse::<u64>(&var, "WORKER_LEASE_SECS")? {
            let lease = Duration::from_secs(secs);
            if lease <= dispatcher.tick_interval {
                return Err(ConfigError::Invalid {
                    key: "WORKER_LEASE_SECS",
                    value: secs.to_string(),
                    reason: "must be longer than the sweep interval".into(),
                });
            }
            dispatcher = dispatcher.with_lease(lease);
        }

        let cron_offset_secs = match parse::<i32>(&var, "CRON_UTC_OFFSET_HOURS")? {
            Some(hours) if (-23..=23).contains(&hours) => hours * 3600,
            Some(hours) => {
                return Err(ConfigError::Invalid {
                    key: "CRON_UTC_OFFSET_HOURS",
                    value: hours.to_string(),
                    reason: "must be between -23 and 23".into(),
                });
            }
            None => DEFAULT_CRON_OFFSET_SECS,
        };

        let cron_enabled =
            parse_flag(&var, "CRON_ENABLED")?.unwrap_or(environment == "production");
        let run_refresh_chain = parse_flag(&var, "RUN_REFRESH_CHAIN")?.unwrap_or(false);

        Ok(Self {
            environment,
            broker,
            dispatcher,
            cron_enabled,
            cron_offset_secs,
            run_refresh_chain,
        })
    }
}

fn parse<T>(
    var: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|value| {
            value.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_flag(
    var: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    var(key)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected true or false".into(),
            }),
        })
        .transpose()
}
