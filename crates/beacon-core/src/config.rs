//! beacon.toml configuration parser.
//!
//! Only `[service]` and `[node]` are required; every other section falls
//! back to defaults. Call [`BeaconConfig::validate`] (done by
//! [`BeaconConfig::from_file`]) before handing the config to any subsystem.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::types::NodeMetadata;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconConfig {
    pub service: ServiceConfig,
    pub node: NodeConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub shard: BTreeMap<String, String>,
}

/// How the staleness window is derived from the check interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessMode {
    /// window = interval × factor
    #[default]
    Multiply,
    /// window = interval + factor seconds
    Add,
}

impl StalenessMode {
    /// `None` when the window does not fit in a `Duration`.
    pub fn window(self, interval: Duration, factor: u32) -> Option<Duration> {
        match self {
            StalenessMode::Multiply => interval.checked_mul(factor),
            StalenessMode::Add => interval.checked_add(Duration::from_secs(u64::from(factor))),
        }
    }
}

/// Upper bound for every configured period, in seconds.
pub const MAX_PERIOD_SECS: u64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_staleness_factor")]
    pub staleness_factor: u32,
    #[serde(default)]
    pub staleness_mode: StalenessMode,
    /// Execution budget for a single probe invocation.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
    /// Hold the node unhealthy for this long after start.
    #[serde(default)]
    pub initial_delay_secs: u64,
    /// Hold the node unhealthy until the host marks its server started.
    #[serde(default)]
    pub wait_for_server_start: bool,
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Saturates; [`BeaconConfig::validate`] rejects configs where it would.
    pub fn staleness_window(&self) -> Duration {
        self.staleness_mode
            .window(self.check_interval(), self.staleness_factor)
            .unwrap_or(Duration::MAX)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            staleness_factor: default_staleness_factor(),
            staleness_mode: StalenessMode::default(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_concurrent_probes: default_max_concurrent_probes(),
            initial_delay_secs: 0,
            wait_for_server_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_true")]
    pub initial_status: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            initial_status: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay between retries; doubled per attempt.
    #[serde(default = "default_connection_retry_interval_ms")]
    pub connection_retry_interval_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound on the best-effort withdrawal at shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// A session not heard from for this long is expired by the store,
    /// taking its ephemeral nodes with it.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.connection_retry_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            connection_retry_interval_ms: default_connection_retry_interval_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Only cache nodes advertising this environment.
    pub environment: Option<String>,
    /// Drop records whose last refresh is older than this.
    pub max_node_age_ms: Option<u64>,
    /// Full re-read of the namespace even without notifications.
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: u64,
    /// Services watched from start, besides this node's own. Only watched
    /// services are answered by the admin API.
    #[serde(default)]
    pub services: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            environment: None,
            max_node_age_ms: None,
            resync_interval_ms: default_resync_interval_ms(),
            services: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

fn default_namespace() -> String {
    "beacon".to_string()
}

fn default_environment() -> String {
    "default".to_string()
}

fn default_check_interval_secs() -> u64 {
    15
}

fn default_staleness_factor() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_max_concurrent_probes() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_connection_retry_interval_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    3_000
}

fn default_session_timeout_ms() -> u64 {
    40_000
}

fn default_resync_interval_ms() -> u64 {
    30_000
}

fn default_admin_listen() -> String {
    "0.0.0.0:8081".to_string()
}

impl BeaconConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate config text.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: BeaconConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Reject values that would make the health loop or the store
    /// interaction meaningless.
    pub fn validate(&self) -> ConfigResult<()> {
        check_segment("service.name", &self.service.name)?;
        check_segment("service.namespace", &self.service.namespace)?;

        if self.node.host.trim().is_empty() {
            return Err(invalid("node.host", "must not be empty"));
        }
        if self.node.host.contains('/') {
            return Err(invalid("node.host", "must not contain '/'"));
        }
        if self.node.port == 0 {
            return Err(invalid("node.port", "must be non-zero"));
        }

        let health = &self.health;
        check_period("health.check_interval_secs", health.check_interval_secs)?;
        if health.staleness_factor == 0 {
            return Err(invalid("health.staleness_factor", "must be > 0"));
        }
        if health
            .staleness_mode
            .window(health.check_interval(), health.staleness_factor)
            .is_none()
        {
            return Err(invalid("health.staleness_factor", "staleness window overflows"));
        }
        if health.initial_delay_secs > MAX_PERIOD_SECS {
            return Err(invalid(
                "health.initial_delay_secs",
                format!("must be <= {MAX_PERIOD_SECS}"),
            ));
        }
        if health.probe_timeout_ms == 0 {
            return Err(invalid("health.probe_timeout_ms", "must be > 0"));
        }
        if health.max_concurrent_probes == 0 {
            return Err(invalid("health.max_concurrent_probes", "must be > 0"));
        }

        if self.store.operation_timeout_ms == 0 {
            return Err(invalid("store.operation_timeout_ms", "must be > 0"));
        }
        if self.store.retry_attempts == 0 {
            return Err(invalid("store.retry_attempts", "must be > 0"));
        }
        check_period_ms("store.session_timeout_ms", self.store.session_timeout_ms)?;
        if self.store.session_timeout() <= health.check_interval() {
            return Err(invalid(
                "store.session_timeout_ms",
                "must exceed health.check_interval_secs",
            ));
        }

        check_period_ms("discovery.resync_interval_ms", self.discovery.resync_interval_ms)?;
        if self.discovery.resync_interval_ms >= self.store.session_timeout_ms {
            return Err(invalid(
                "discovery.resync_interval_ms",
                "must be below store.session_timeout_ms",
            ));
        }
        for service in &self.discovery.services {
            check_segment("discovery.services", service)?;
        }

        Ok(())
    }

    /// Metadata this node advertises.
    pub fn node_metadata(&self) -> NodeMetadata {
        NodeMetadata {
            host: self.node.host.clone(),
            port: self.node.port,
            environment: self.service.environment.clone(),
            shard: self.node.shard.clone(),
        }
    }

    /// Minimal config for the given service and address.
    pub fn scaffold(service: &str, host: &str, port: u16) -> Self {
        BeaconConfig {
            service: ServiceConfig {
                name: service.to_string(),
                namespace: default_namespace(),
                environment: default_environment(),
            },
            node: NodeConfig {
                host: host.to_string(),
                port,
                shard: BTreeMap::new(),
            },
            health: HealthConfig::default(),
            rotation: RotationConfig::default(),
            store: StoreConfig::default(),
            discovery: DiscoveryConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

fn check_period(field: &'static str, secs: u64) -> ConfigResult<()> {
    if secs == 0 || secs > MAX_PERIOD_SECS {
        return Err(invalid(field, format!("must be in 1..={MAX_PERIOD_SECS}")));
    }
    Ok(())
}

fn check_period_ms(field: &'static str, ms: u64) -> ConfigResult<()> {
    if ms == 0 || ms > MAX_PERIOD_SECS * 1_000 {
        return Err(invalid(
            field,
            format!("must be in 1..={}", MAX_PERIOD_SECS * 1_000),
        ));
    }
    Ok(())
}

fn check_segment(field: &'static str, value: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if value.contains('/') {
        return Err(invalid(field, "must not contain '/'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[service]
name = "TestService"

[node]
host = "TestHost"
port = 8021
"#;

    #[test]
    fn parse_minimal_applies_defaults() {
        let config = BeaconConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.service.namespace, "beacon");
        assert_eq!(config.health.check_interval_secs, 15);
        assert_eq!(config.health.staleness_factor, 3);
        assert!(config.rotation.initial_status);
        assert!(!config.health.wait_for_server_start);
        assert_eq!(config.discovery.resync_interval_ms, 30_000);
        assert_eq!(config.store.session_timeout(), Duration::from_secs(40));
        assert!(config.discovery.services.is_empty());
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
[service]
name = "TestService"
namespace = "test"
environment = "testing"

[node]
host = "TestHost"
port = 8021
shard = { region = "eu" }

[health]
check_interval_secs = 2
staleness_factor = 2
staleness_mode = "add"

[rotation]
initial_status = false

[store]
connection_retry_interval_ms = 5000

[discovery]
environment = "testing"
max_node_age_ms = 60000
"#;
        let config = BeaconConfig::parse(toml_str).unwrap();
        assert_eq!(config.health.staleness_mode, StalenessMode::Add);
        assert_eq!(config.health.staleness_window(), Duration::from_secs(4));
        assert!(!config.rotation.initial_status);
        assert_eq!(config.store.retry_interval(), Duration::from_secs(5));
        assert_eq!(config.discovery.environment.as_deref(), Some("testing"));

        let meta = config.node_metadata();
        assert_eq!(meta.environment, "testing");
        assert_eq!(meta.shard.get("region").unwrap(), "eu");
    }

    #[test]
    fn staleness_window_multiplies_by_default() {
        let health = HealthConfig {
            check_interval_secs: 2,
            staleness_factor: 3,
            ..HealthConfig::default()
        };
        assert_eq!(health.staleness_window(), Duration::from_secs(6));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = BeaconConfig::scaffold("svc", "h", 80);
        config.health.check_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "health.check_interval_secs",
                ..
            }
        ));
    }

    #[test]
    fn zero_staleness_factor_is_rejected() {
        let mut config = BeaconConfig::scaffold("svc", "h", 80);
        config.health.staleness_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn huge_check_interval_is_rejected_not_panicking() {
        let mut config = BeaconConfig::scaffold("svc", "h", 80);
        config.health.check_interval_secs = u64::MAX / 2;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "health.check_interval_secs",
                ..
            }
        ));
        // Accessors saturate instead of panicking on unvalidated input.
        assert_eq!(config.health.staleness_window(), Duration::MAX);
    }

    #[test]
    fn staleness_window_overflow_is_detected() {
        assert_eq!(
            StalenessMode::Multiply.window(Duration::from_secs(u64::MAX / 2), 3),
            None
        );
        assert_eq!(
            StalenessMode::Add.window(Duration::MAX, 1),
            None
        );
        assert_eq!(
            StalenessMode::Multiply.window(Duration::from_secs(MAX_PERIOD_SECS), u32::MAX),
            Some(Duration::from_secs(MAX_PERIOD_SECS * u64::from(u32::MAX)))
        );
    }

    #[test]
    fn session_timeout_must_outlast_refresh_and_resync() {
        let mut config = BeaconConfig::scaffold("svc", "h", 80);
        config.store.session_timeout_ms = 15_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "store.session_timeout_ms",
                ..
            })
        ));

        config.store.session_timeout_ms = 20_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "discovery.resync_interval_ms",
                ..
            })
        ));

        config.discovery.resync_interval_ms = 10_000;
        config.validate().unwrap();
    }

    #[test]
    fn watched_services_must_be_path_segments() {
        let mut config = BeaconConfig::scaffold("svc", "h", 80);
        config.discovery.services = vec!["billing".to_string(), "a/b".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "discovery.services",
                ..
            })
        ));
    }

    #[test]
    fn service_name_with_slash_is_rejected() {
        let config = BeaconConfig::scaffold("a/b", "h", 80);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let config = BeaconConfig::scaffold("svc", "h", 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn scaffold_round_trips_through_toml() {
        let config = BeaconConfig::scaffold("my-api", "10.0.0.1", 8080);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("my-api"));
        let parsed = BeaconConfig::parse(&toml_str).unwrap();
        assert_eq!(parsed.node.port, 8080);
    }

    #[test]
    fn from_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = BeaconConfig::from_file(&path).unwrap();
        assert_eq!(config.node.host, "TestHost");

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            BeaconConfig::from_file(&missing),
            Err(ConfigError::Read(_))
        ));
    }
}
