use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::utils::logging::LogLevel;

const ENV_PREFIX: &str = "SITEBUDGET_";

/// Configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{0} is required by the selected store")]
    Missing(String),
}

/// Result type for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Where site policies are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    File,
    Redis,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreKind::Memory),
            "file" | "json" => Ok(StoreKind::File),
            "redis" => Ok(StoreKind::Redis),
            other => Err(format!("unknown store {:?}, expected memory, file or redis", other)),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub store: StoreKind,
    pub data_dir: PathBuf,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    /// Write enforcement rules to this file instead of keeping them in memory
    pub rules_file: Option<PathBuf>,
    pub block_page: String,
    pub checkpoint_secs: u64,
    pub log_level: LogLevel,
    pub log_file: Option<String>,
    pub metrics: bool,
    pub metrics_report_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            store: StoreKind::File,
            data_dir: PathBuf::from("./data"),
            redis_url: None,
            redis_prefix: "sitebudget".to_string(),
            rules_file: None,
            block_page: "/blocked.html".to_string(),
            checkpoint_secs: 10,
            log_level: LogLevel::Info,
            log_file: None,
            metrics: true,
            metrics_report_secs: 0,
        }
    }
}

impl AppConfig {
    /// Load from `SITEBUDGET_*` variables, reading `.env` first if present
    pub fn from_env() -> ConfigResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(v) = get("BIND_ADDR") {
            config.bind_addr = parse_value("BIND_ADDR", &v)?;
        }
        if let Some(v) = get("STORE") {
            config.store = v.parse().map_err(|reason| invalid("STORE", &v, reason))?;
        }
        if let Some(v) = get("DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        config.redis_url = get("REDIS_URL");
        if let Some(v) = get("REDIS_PREFIX") {
            config.redis_prefix = v;
        }
        config.rules_file = get("RULES_FILE").map(PathBuf::from);
        if let Some(v) = get("BLOCK_PAGE") {
            config.block_page = v;
        }
        if let Some(v) = get("CHECKPOINT_SECS") {
            config.checkpoint_secs = parse_value("CHECKPOINT_SECS", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.log_level = v.parse().map_err(|e: crate::utils::logging::LogError| {
                invalid("LOG_LEVEL", &v, e.to_string())
            })?;
        }
        config.log_file = get("LOG_FILE");
        if let Some(v) = get("METRICS") {
            config.metrics = parse_bool("METRICS", &v)?;
        }
        if let Some(v) = get("METRICS_REPORT_SECS") {
            config.metrics_report_secs = parse_value("METRICS_REPORT_SECS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.store == StoreKind::Redis && self.redis_url.is_none() {
            return Err(ConfigError::Missing(format!("{}REDIS_URL", ENV_PREFIX)));
        }
        if self.checkpoint_secs == 0 {
            return Err(invalid("CHECKPOINT_SECS", "0", "must be at least 1".to_string()));
        }
        if !self.block_page.starts_with('/') {
            return Err(invalid("BLOCK_PAGE", &self.block_page, "must start with '/'".to_string()));
        }
        Ok(())
    }

    /// Location of the JSON site registry
    pub fn sites_file(&self) -> PathBuf {
        self.data_dir.join("sites.json")
    }

    pub fn checkpoint_every(&self) -> Duration {
        Duration::from_secs(self.checkpoint_secs)
    }
}

fn invalid(key: &str, value: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{}{}", ENV_PREFIX, key),
        value: value.to_string(),
        reason,
    }
}

fn parse_value<T>(key: &str, value: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(key, value, e.to_string()))
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("SITEBUDGET_{}", k), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(AppConfig::from_lookup(lookup(&[])).unwrap(), AppConfig::default());
    }

    #[test]
    fn values_override_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "0.0.0.0:9000"),
            ("STORE", "memory"),
            ("CHECKPOINT_SECS", "5"),
            ("LOG_LEVEL", "debug"),
            ("METRICS", "off"),
            ("RULES_FILE", "/tmp/rules.json"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.checkpoint_every(), Duration::from_secs(5));
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(!config.metrics);
        assert_eq!(config.rules_file, Some(PathBuf::from("/tmp/rules.json")));
    }

    #[test]
    fn redis_store_needs_url() {
        let err = AppConfig::from_lookup(lookup(&[("STORE", "redis")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SITEBUDGET_REDIS_URL".to_string()));

        let ok = AppConfig::from_lookup(lookup(&[("STORE", "redis"), ("REDIS_URL", "redis://127.0.0.1/")]));
        assert!(ok.is_ok());
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = AppConfig::from_lookup(lookup(&[("CHECKPOINT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "SITEBUDGET_CHECKPOINT_SECS"));
        assert!(AppConfig::from_lookup(lookup(&[("CHECKPOINT_SECS", "0")])).is_err());
    }
}
