use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::export::ExporterConfig;
use crate::instrument::TargetSpec;
use tracewire_proto::types::AttrValue;

/// Global configuration key-value store.
///
/// Holds the effective settings of the running agent so diagnostics can
/// read back what the agent actually initialized with. Uses `RwLock`
/// so concurrent readers do not contend.
pub static CONFIG_STORE: Lazy<RwLock<BTreeMap<String, AttrValue>>> =
    Lazy::new(|| RwLock::new(BTreeMap::new()));

/// Get a configuration value.
pub fn get(key: &str) -> Option<AttrValue> {
    CONFIG_STORE.read().unwrap().get(key).cloned()
}

/// Set a configuration value.
pub fn set<T: Into<AttrValue>>(key: &str, value: T) {
    CONFIG_STORE
        .write()
        .unwrap()
        .insert(key.to_string(), value.into());
}

/// Get a configuration value as string.
pub fn get_str(key: &str) -> Option<String> {
    get(key).map(|value| value.to_string())
}

/// Remove a configuration value.
pub fn remove(key: &str) -> Option<AttrValue> {
    CONFIG_STORE.write().unwrap().remove(key)
}

/// Check if a key exists.
pub fn contains_key(key: &str) -> bool {
    CONFIG_STORE.read().unwrap().contains_key(key)
}

/// Get all configuration keys.
pub fn keys() -> Vec<String> {
    CONFIG_STORE.read().unwrap().keys().cloned().collect()
}

/// Clear all configuration.
pub fn clear() {
    CONFIG_STORE.write().unwrap().clear();
}

/// Get the number of configuration entries.
pub fn len() -> usize {
    CONFIG_STORE.read().unwrap().len()
}

/// Check if the configuration store is empty.
pub fn is_empty() -> bool {
    CONFIG_STORE.read().unwrap().is_empty()
}

const ENV_COLLECTOR: &str = "TRACEWIRE_COLLECTOR";
const ENV_BUFFER_CAPACITY: &str = "TRACEWIRE_BUFFER_CAPACITY";
const ENV_BATCH_SIZE: &str = "TRACEWIRE_BATCH_SIZE";
const ENV_FLUSH_INTERVAL_MS: &str = "TRACEWIRE_FLUSH_INTERVAL_MS";
const ENV_RETRY_LIMIT: &str = "TRACEWIRE_RETRY_LIMIT";
const ENV_RETRY_BACKOFF_MS: &str = "TRACEWIRE_RETRY_BACKOFF_MS";
const ENV_SHUTDOWN_TIMEOUT_MS: &str = "TRACEWIRE_SHUTDOWN_TIMEOUT_MS";
const ENV_TARGETS: &str = "TRACEWIRE_TARGETS";

/// Agent settings, deserializable from JSON and loadable from
/// `TRACEWIRE_*` environment variables. Malformed values fall back to
/// the defaults with a warning; configuration must never abort the
/// host application.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    /// Collector address for the TCP transport, e.g. `"127.0.0.1:4318"`.
    /// `None` leaves the agent exporting to an in-process buffer only.
    pub collector_addr: Option<String>,
    pub buffer_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Instrumentation registration list: which declared targets to
    /// trace, with optional overrides.
    pub targets: Vec<TargetSpec>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let exporter = ExporterConfig::default();
        AgentSettings {
            collector_addr: None,
            buffer_capacity: exporter.capacity,
            batch_size: exporter.batch_size,
            flush_interval_ms: exporter.flush_interval.as_millis() as u64,
            retry_limit: exporter.retry_limit,
            retry_backoff_ms: exporter.retry_backoff.as_millis() as u64,
            shutdown_timeout_ms: exporter.shutdown_timeout.as_millis() as u64,
            targets: Vec::new(),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("ignoring {key}={raw}: not a valid value");
                fallback
            }
        },
        Err(_) => fallback,
    }
}

impl AgentSettings {
    /// Load settings from the environment, starting from the defaults.
    ///
    /// The target list comes from `TRACEWIRE_TARGETS` as a JSON array
    /// of target specs; a parse failure logs and leaves the list empty
    /// rather than failing initialization.
    pub fn from_env() -> Self {
        let mut settings = AgentSettings::default();

        if let Ok(addr) = std::env::var(ENV_COLLECTOR) {
            if !addr.is_empty() {
                settings.collector_addr = Some(addr);
            }
        }
        settings.buffer_capacity = env_parsed(ENV_BUFFER_CAPACITY, settings.buffer_capacity);
        settings.batch_size = env_parsed(ENV_BATCH_SIZE, settings.batch_size);
        settings.flush_interval_ms = env_parsed(ENV_FLUSH_INTERVAL_MS, settings.flush_interval_ms);
        settings.retry_limit = env_parsed(ENV_RETRY_LIMIT, settings.retry_limit);
        settings.retry_backoff_ms = env_parsed(ENV_RETRY_BACKOFF_MS, settings.retry_backoff_ms);
        settings.shutdown_timeout_ms =
            env_parsed(ENV_SHUTDOWN_TIMEOUT_MS, settings.shutdown_timeout_ms);

        if let Ok(raw) = std::env::var(ENV_TARGETS) {
            match serde_json::from_str::<Vec<TargetSpec>>(&raw) {
                Ok(targets) => settings.targets = targets,
                Err(e) => log::warn!("ignoring {ENV_TARGETS}: {e}"),
            }
        }

        settings
    }

    pub fn exporter_config(&self) -> ExporterConfig {
        ExporterConfig {
            capacity: self.buffer_capacity,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            retry_limit: self.retry_limit,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    /// Record the effective settings into the [`CONFIG_STORE`].
    pub fn record(&self) {
        set(
            "exporter.collector",
            self.collector_addr.as_deref().unwrap_or("none"),
        );
        set("exporter.capacity", self.buffer_capacity as i64);
        set("exporter.batch_size", self.batch_size as i64);
        set("exporter.flush_interval_ms", self.flush_interval_ms as i64);
        set("exporter.retry_limit", self.retry_limit as i64);
        set("exporter.retry_backoff_ms", self.retry_backoff_ms as i64);
        set(
            "exporter.shutdown_timeout_ms",
            self.shutdown_timeout_ms as i64,
        );
        set("instrument.targets", self.targets.len() as i64);
    }
}
