use crate::backend::PoolConfig;
use crate::coordinator::CoordinatorOptions;
use crate::core::{ProxyError, Result};
use crate::scheduler::{SchedulerOptions, ScorerConfig, WriteQuorum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name [`ProxyConfig::load_dir`] looks for.
pub const PROXY_CONFIG_FILE: &str = "proxy.yaml";

/// Proxy configuration
///
/// Every field is optional in the YAML file; missing ones take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address of the client front end
    pub hostname: String,

    /// Client front-end port
    pub port: u16,

    /// Admin HTTP port
    pub web_port: u16,

    /// Replication factor
    pub n: usize,

    pub max_key_len: usize,

    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    /// Upper bound of a retiring scheduler's drain
    pub drain_timeout_ms: u64,

    /// Retire delay as a multiple of `read_timeout_ms`
    pub retire_delay_factor: u32,

    pub write_quorum: WriteQuorum,

    /// In-flight operations admitted per scheduler
    pub max_inflight: usize,

    pub pool_max_connections: usize,
    pub pool_idle_timeout_ms: u64,

    /// Largest value a node reply may announce
    pub max_value_size: usize,

    /// Weight of past outcomes in the health score
    pub score_decay: f64,
    pub latency_reference_ms: u64,
    pub unhealthy_threshold: f64,

    /// Wall-clock half-life of a node's outcome history
    pub score_half_life_ms: u64,

    /// Route description, relative to the config directory unless absolute
    pub route_file: PathBuf,

    /// Poll the route file this often; 0 disables polling
    pub route_poll_interval_ms: u64,

    /// Whether the admin surface may trigger reloads
    pub allow_reload: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 7905,
            web_port: 7908,
            n: 3,
            max_key_len: 250,
            read_timeout_ms: 2000,
            write_timeout_ms: 2000,
            connect_timeout_ms: 300,
            drain_timeout_ms: 10_000,
            retire_delay_factor: 5,
            write_quorum: WriteQuorum::All,
            max_inflight: 4096,
            pool_max_connections: 16,
            pool_idle_timeout_ms: 60_000,
            max_value_size: 1024 * 1024,
            score_decay: 0.9,
            latency_reference_ms: 50,
            unhealthy_threshold: 0.2,
            score_half_life_ms: 10_000,
            route_file: PathBuf::from("route.yaml"),
            route_poll_interval_ms: 0,
            allow_reload: true,
        }
    }
}

impl ProxyConfig {
    /// Parses YAML text; validation is left to the caller.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|err| ProxyError::Config(err.to_string()))
    }

    /// Loads and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| ProxyError::Config(format!("{}: {}", path.display(), err)))?;
        let config = Self::from_yaml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `proxy.yaml` from a config directory.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load(dir.as_ref().join(PROXY_CONFIG_FILE))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|err| ProxyError::Config(err.to_string()))
    }

    /// Set the listen hostname
    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    /// Set the client port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the admin port
    pub fn web_port(mut self, port: u16) -> Self {
        self.web_port = port;
        self
    }

    /// Set the replication factor
    pub fn replicas(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    pub fn max_key_len(mut self, max: usize) -> Self {
        self.max_key_len = max;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retire_delay_factor(mut self, factor: u32) -> Self {
        self.retire_delay_factor = factor;
        self
    }

    pub fn write_quorum(mut self, quorum: WriteQuorum) -> Self {
        self.write_quorum = quorum;
        self
    }

    pub fn max_inflight(mut self, max: usize) -> Self {
        self.max_inflight = max;
        self
    }

    pub fn pool_max_connections(mut self, max: usize) -> Self {
        self.pool_max_connections = max;
        self
    }

    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_value_size(mut self, max: usize) -> Self {
        self.max_value_size = max;
        self
    }

    pub fn score_half_life(mut self, half_life: Duration) -> Self {
        self.score_half_life_ms = half_life.as_millis() as u64;
        self
    }

    pub fn score_decay(mut self, decay: f64) -> Self {
        self.score_decay = decay;
        self
    }

    pub fn latency_reference(mut self, latency: Duration) -> Self {
        self.latency_reference_ms = latency.as_millis() as u64;
        self
    }

    pub fn unhealthy_threshold(mut self, threshold: f64) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    pub fn route_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.route_file = path.into();
        self
    }

    pub fn route_poll_interval(mut self, interval: Duration) -> Self {
        self.route_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn allow_reload(mut self, allow: bool) -> Self {
        self.allow_reload = allow;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(ProxyError::Config("hostname cannot be empty".to_string()));
        }
        if self.n == 0 {
            return Err(ProxyError::Config("n must be >= 1".to_string()));
        }
        if self.max_key_len == 0 {
            return Err(ProxyError::Config("max_key_len must be > 0".to_string()));
        }
        for (name, value) in [
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("drain_timeout_ms", self.drain_timeout_ms),
            ("latency_reference_ms", self.latency_reference_ms),
            ("score_half_life_ms", self.score_half_life_ms),
        ] {
            if value == 0 {
                return Err(ProxyError::Config(format!("{} must be > 0", name)));
            }
        }
        if !(self.score_decay > 0.0 && self.score_decay < 1.0) {
            return Err(ProxyError::Config(format!(
                "score_decay must be in (0, 1), got {}",
                self.score_decay
            )));
        }
        if !(0.0..=1.0).contains(&self.unhealthy_threshold) {
            return Err(ProxyError::Config(format!(
                "unhealthy_threshold must be in [0, 1], got {}",
                self.unhealthy_threshold
            )));
        }
        if let WriteQuorum::AtLeast(w) = self.write_quorum {
            if w == 0 || w > self.n {
                return Err(ProxyError::Config(format!(
                    "write_quorum at_least must be in 1..={}, got {}",
                    self.n, w
                )));
            }
        }
        if self.max_inflight == 0 {
            return Err(ProxyError::Config("max_inflight must be > 0".to_string()));
        }
        if self.max_value_size == 0 {
            return Err(ProxyError::Config("max_value_size must be > 0".to_string()));
        }
        if self.pool_max_connections == 0 {
            return Err(ProxyError::Config(
                "pool_max_connections must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Route file path resolved against `config_dir`.
    pub fn route_path(&self, config_dir: &Path) -> PathBuf {
        if self.route_file.is_absolute() {
            self.route_file.clone()
        } else {
            config_dir.join(&self.route_file)
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn web_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.web_port)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.route_poll_interval_ms > 0).then(|| Duration::from_millis(self.route_poll_interval_ms))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .max_connections(self.pool_max_connections)
            .idle_timeout(Duration::from_millis(self.pool_idle_timeout_ms))
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .max_value_size(self.max_value_size)
            .checkout_timeout(Duration::from_millis(self.read_timeout_ms.max(self.write_timeout_ms)))
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions::default()
            .read_timeout(Duration::from_millis(self.read_timeout_ms))
            .write_timeout(Duration::from_millis(self.write_timeout_ms))
            .drain_timeout(Duration::from_millis(self.drain_timeout_ms))
            .write_quorum(self.write_quorum)
            .max_inflight(self.max_inflight)
            .max_key_len(self.max_key_len)
            .scorer(ScorerConfig {
                decay: self.score_decay,
                latency_reference: Duration::from_millis(self.latency_reference_ms),
                unhealthy_threshold: self.unhealthy_threshold,
                recovery_half_life: Duration::from_millis(self.score_half_life_ms),
            })
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        let retire_delay = Duration::from_millis(self.read_timeout_ms)
            .saturating_mul(self.retire_delay_factor);
        CoordinatorOptions::default()
            .replicas(self.n)
            .scheduler(self.scheduler_options())
            .retire_delay(retire_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = ProxyConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.listen_addr(), "127.0.0.1:7905");
        assert!(config.validate().is_ok());
        assert!(config.poll_interval().is_none());
    }

    #[test]
    fn test_partial_document_keeps_other_defaults() {
        let config = ProxyConfig::from_yaml("port: 8000\nwrite_quorum: first_success\n").unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.write_quorum, WriteQuorum::FirstSuccess);
        assert_eq!(config.n, 3);
    }

    #[test]
    fn test_validation_rules() {
        assert!(ProxyConfig::default().replicas(0).validate().is_err());
        assert!(ProxyConfig::default().score_decay(1.0).validate().is_err());
        assert!(ProxyConfig::default().score_decay(0.0).validate().is_err());
        assert!(ProxyConfig::default().max_inflight(0).validate().is_err());
        assert!(ProxyConfig::default().max_value_size(0).validate().is_err());
        assert!(
            ProxyConfig::default()
                .score_half_life(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            ProxyConfig::default()
                .read_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            ProxyConfig::default()
                .write_quorum(WriteQuorum::AtLeast(4))
                .validate()
                .is_err()
        );
        assert!(
            ProxyConfig::default()
                .write_quorum(WriteQuorum::AtLeast(2))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_derived_options() {
        let config = ProxyConfig::default().read_timeout(Duration::from_millis(100));
        let options = config.coordinator_options();
        assert_eq!(options.replicas, 3);
        assert_eq!(options.retire_delay, Duration::from_millis(500));
        assert_eq!(options.scheduler.read_timeout, Duration::from_millis(100));
        assert_eq!(config.pool_config().max_connections, 16);
        assert_eq!(config.pool_config().max_value_size, 1024 * 1024);
        assert_eq!(
            options.scheduler.scorer.recovery_half_life,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_route_path_resolution() {
        let config = ProxyConfig::default();
        assert_eq!(
            config.route_path(Path::new("/etc/kvproxy")),
            PathBuf::from("/etc/kvproxy/route.yaml")
        );
        let config = config.route_file("/srv/route.yaml");
        assert_eq!(config.route_path(Path::new("/etc/kvproxy")), PathBuf::from("/srv/route.yaml"));
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        assert!(matches!(
            ProxyConfig::from_yaml("port: [not a port"),
            Err(ProxyError::Config(_))
        ));
    }
}
