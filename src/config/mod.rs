mod cli;

pub use cli::{Cli, Command, ControllerArgs, NodeArgs, SharedArgs};

use crate::backend::api::ApiSettings;
use crate::error::{Error, Result};
use crate::health::{HealthLabels, LabelPair};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub csi: CsiConfig,
    pub labels: LabelsConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path prefix of the device API on every backend node.
    pub api_path: String,
    pub user: String,
    pub password: String,
    /// Pool holding the per-node url attributes.
    pub pool: String,
    /// Ceph client used for blacklist commands.
    pub client_id: String,
    pub request_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub url_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsiConfig {
    pub endpoint: String,
    pub driver_name: String,
    pub node_name: String,
    /// Interface whose address is recorded as the node's storage ip.
    pub storage_interface: String,
    /// 0 leaves the limit to the orchestrator.
    pub max_volumes_per_node: i64,
}

/// Labels as `key=value` strings; `eligibility` may contain `%N`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelsConfig {
    pub eligibility: String,
    pub readiness: String,
    pub maintenance: String,
    pub fenced: String,
    pub ha_managed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Empty disables the metrics listener.
    pub addr: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_path: String::new(),
            user: String::new(),
            password: String::new(),
            pool: String::new(),
            client_id: "admin".to_string(),
            request_timeout_secs: 10,
            command_timeout_secs: 30,
            url_cache_ttl_secs: 300,
        }
    }
}

impl Default for CsiConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:///csi/csi.sock".to_string(),
            driver_name: "alcub.csi.es.io".to_string(),
            node_name: String::new(),
            storage_interface: String::new(),
            max_volumes_per_node: 0,
        }
    }
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            eligibility: "alcubierre-%N=enable".to_string(),
            readiness: "csi-alcub=enable".to_string(),
            maintenance: "alcub.csi.io/maintenance=true".to_string(),
            fenced: "csi-alcub-maintain=true".to_string(),
            ha_managed: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { addr: "0.0.0.0:9180".to_string() }
    }
}

impl Config {
    /// Defaults, then the optional file at `path`, then `ALCUB__SECTION__KEY`
    /// environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("ALCUB").separator("__"))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.try_deserialize().map_err(|e| Error::Config(e.to_string()))
    }

    pub fn health_labels(&self) -> Result<HealthLabels> {
        Ok(HealthLabels {
            eligibility: self.labels.eligibility.parse()?,
            readiness: self.labels.readiness.parse()?,
            maintenance: self.labels.maintenance.parse()?,
            fenced: self.labels.fenced.parse()?,
            ha_managed: self
                .labels
                .ha_managed
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(str::parse::<LabelPair>)
                .transpose()?,
        })
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            api_path: self.backend.api_path.clone(),
            user: self.backend.user.clone(),
            password: self.backend.password.clone(),
            request_timeout: Duration::from_secs(self.backend.request_timeout_secs),
            url_cache_ttl: Duration::from_secs(self.backend.url_cache_ttl_secs),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.command_timeout_secs)
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        if self.metrics.addr.is_empty() {
            return Ok(None);
        }
        self.metrics
            .addr
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("metrics.addr {:?}: {}", self.metrics.addr, e)))
    }

    fn validate_common(&self) -> Result<()> {
        require("backend.api_path", &self.backend.api_path)?;
        require("backend.pool", &self.backend.pool)?;
        require("csi.endpoint", &self.csi.endpoint)?;
        require("csi.driver_name", &self.csi.driver_name)?;
        self.health_labels()?;
        self.metrics_addr()?;
        Ok(())
    }

    pub fn validate_controller(&self) -> Result<()> {
        self.validate_common()
    }

    pub fn validate_node(&self) -> Result<()> {
        self.validate_common()?;
        require("csi.node_name", &self.csi.node_name)?;
        require("csi.storage_interface", &self.csi.storage_interface)?;
        if self.csi.max_volumes_per_node < 0 {
            return Err(Error::Config("csi.max_volumes_per_node must not be negative".to_string()));
        }
        Ok(())
    }
}

fn require(key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{} is required", key)));
    }
    Ok(())
}

/// First IPv4 address of `interface`, falling back to IPv6.
pub fn interface_ip(interface: &str) -> Result<IpAddr> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Config(format!("listing interfaces: {}", e)))?;
    let mut v6 = None;
    for ifaddr in addrs.filter(|a| a.interface_name == interface) {
        let Some(address) = ifaddr.address else { continue };
        if let Some(sin) = address.as_sockaddr_in() {
            return Ok(IpAddr::V4(sin.ip()));
        }
        if let Some(sin6) = address.as_sockaddr_in6() {
            v6.get_or_insert(IpAddr::V6(sin6.ip()));
        }
    }
    v6.ok_or_else(|| Error::Config(format!("interface {:?} has no ip address", interface)))
}
