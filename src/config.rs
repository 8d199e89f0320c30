//! Agent configuration file (YAML), flat form only.
//!
//! Resolves the Open Question in spec.md §9: only the flat form is
//! accepted, never the `general:`-wrapped legacy variant.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "http-host")]
    pub http_host: String,
    #[serde(rename = "api-key")]
    pub api_key: String,
    #[serde(rename = "app-key")]
    pub app_key: String,
    pub environment: String,

    #[serde(with = "humantime_serde")]
    pub sleep: Duration,
    #[serde(rename = "top-n-sleep", with = "humantime_serde")]
    pub top_n_sleep: Duration,
    #[serde(rename = "monitored-sleep", with = "humantime_serde")]
    pub monitored_sleep: Duration,

    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(rename = "log-file")]
    pub log_file: String,
    #[serde(rename = "log-level", default = "default_log_level")]
    pub log_level: String,

    #[serde(rename = "config-service")]
    pub config_service: String,

    #[serde(rename = "top-n-processes", default = "default_top_n")]
    pub top_n_processes: usize,

    #[serde(rename = "datastore-dir")]
    pub datastore_dir: String,

    #[serde(rename = "websocket-ping", with = "humantime_serde")]
    pub websocket_ping: Duration,
    #[serde(rename = "config-websocket")]
    pub config_websocket: String,

    #[serde(default)]
    pub percentiles: Vec<f64>,

    #[serde(rename = "flush-interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    #[serde(rename = "udp-addr", default)]
    pub udp_addr: Option<String>,

    #[serde(rename = "plugins-dir")]
    pub plugins_dir: String,
    #[serde(rename = "custom-plugins-dir")]
    pub custom_plugins_dir: String,

    #[serde(rename = "enable-auto-update", default)]
    pub enable_auto_update: bool,

    #[serde(rename = "local-command-port", default = "default_local_command_port")]
    pub local_command_port: u16,

    #[serde(default = "default_true")]
    pub hostname_from_os: bool,
    /// Required when `hostname_from_os` is false; ignored otherwise.
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("hostname_from_os is false but no hostname was configured")]
pub struct MissingHostnameError;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_top_n() -> usize {
    10
}

fn default_local_command_port() -> u16 {
    8745
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Tenant tag used as the store's `db` key: `app_key+environment`.
    pub fn database(&self) -> String {
        format!("{}+{}", self.app_key, self.environment)
    }

    /// Resolves the host prefix used on every locally produced metric.
    pub fn resolve_hostname(&self) -> anyhow::Result<String> {
        if self.hostname_from_os {
            Ok(hostname::get()?.to_string_lossy().into_owned())
        } else {
            self.hostname.clone().ok_or_else(|| MissingHostnameError.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_yaml() {
        let yaml = r#"
http-host: "https://config.example.com"
api-key: "abc123"
app-key: "acme"
environment: "prod"
sleep: "10s"
top-n-sleep: "60s"
monitored-sleep: "5s"
log-file: "/var/log/anomalous-agent.log"
config-service: "https://config.example.com"
datastore-dir: "/var/lib/anomalous-agent"
websocket-ping: "30s"
config-websocket: "config.example.com:9100"
flush-interval: "1s"
plugins-dir: "/opt/plugins"
custom-plugins-dir: "/opt/custom-plugins"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.database(), "acme+prod");
        assert_eq!(cfg.sleep, Duration::from_secs(10));
        assert_eq!(cfg.top_n_processes, 10);
        assert_eq!(cfg.local_command_port, 8745);
        assert!(cfg.hostname_from_os);
    }

    #[test]
    fn explicit_hostname_required_when_not_from_os() {
        let mut cfg_yaml = String::from("hostname-from-os: false\n");
        cfg_yaml.push_str(
            r#"
http-host: "https://config.example.com"
api-key: "abc123"
app-key: "acme"
environment: "prod"
sleep: "10s"
top-n-sleep: "60s"
monitored-sleep: "5s"
log-file: "/var/log/anomalous-agent.log"
config-service: "https://config.example.com"
datastore-dir: "/var/lib/anomalous-agent"
websocket-ping: "30s"
config-websocket: "config.example.com:9100"
flush-interval: "1s"
plugins-dir: "/opt/plugins"
custom-plugins-dir: "/opt/custom-plugins"
"#,
        );
        let cfg: Config = serde_yaml::from_str(&cfg_yaml).unwrap();
        assert!(cfg.resolve_hostname().is_err());
    }
}
