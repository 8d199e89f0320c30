//! HTTP-JSON client for the central config service.
//!
//! Grounded on `manager/src/state_sync/rpc_client.rs`'s per-call,
//! `Result`-returning async functions over a shared `reqwest::Client`, and on
//! `manager/src/config/manager.rs`'s `Arc<RwLock<Arc<T>>>` cached-config
//! shape: every fetch keeps the last successfully decoded value and returns
//! it when the network call itself fails, since a config-service outage must
//! never be fatal to the agent loops that depend on it.

use crate::model::{AgentConfiguration, MonitorConfig, ProcessMonitorConfig};
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Wire shape of the `.../agents/<host>/configuration` response — mirrors
/// `original_source/src/utils/config_service.go`'s `AgentConfiguration`
/// (`Plugins`/`Processes`), generalized with the disabled-plugin set and
/// auto-update target version spec.md adds.
#[derive(Debug, Clone, Deserialize)]
struct ConfigurationResponse {
    #[serde(default)]
    plugins: std::collections::BTreeMap<String, Vec<crate::model::PluginInstance>>,
    #[serde(default)]
    disabled_plugins: BTreeSet<String>,
    #[serde(default)]
    auto_update_target_version: Option<String>,
    #[serde(default)]
    processes: Vec<ProcessMonitorConfig>,
}

#[derive(Debug, Serialize)]
struct AgentStatusBody<'a> {
    plugins: &'a [String],
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_plugin_info: Option<&'a serde_json::Value>,
}

struct Cached<T> {
    value: RwLock<Option<Arc<T>>>,
}

impl<T> Cached<T> {
    fn empty() -> Self {
        Self {
            value: RwLock::new(None),
        }
    }

    async fn get(&self) -> Option<Arc<T>> {
        self.value.read().await.clone()
    }

    async fn set(&self, v: T) -> Arc<T> {
        let arc = Arc::new(v);
        *self.value.write().await = Some(arc.clone());
        arc
    }
}

pub struct ConfigServiceClient {
    client: Client,
    base_url: String,
    api_key: String,
    database: String,
    hostname: String,
    monitor_config: Cached<MonitorConfig>,
    configuration: Cached<ConfigurationResponse>,
}

impl ConfigServiceClient {
    pub fn new(base_url: String, api_key: String, database: String, hostname: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            database,
            hostname,
            monitor_config: Cached::empty(),
            configuration: Cached::empty(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        if !response.status().is_success() {
            return Err(anyhow!("GET {url} returned status {}", response.status()));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("GET {url} returned unparseable body"))
    }

    /// Anomaly monitor rules and silence policies.
    pub async fn fetch_monitor_config(&self) -> Result<MonitorConfig> {
        let path = format!(
            "/v2/databases/{}/agents/{}/monitoring_config?api_key={}",
            self.database, self.hostname, self.api_key
        );
        match self.get_json::<MonitorConfig>(&path).await {
            Ok(cfg) => {
                self.monitor_config.set(cfg.clone()).await;
                Ok(cfg)
            }
            Err(err) => match self.monitor_config.get().await {
                Some(cached) => {
                    tracing::warn!(error = %err, "using last known monitor config");
                    Ok((*cached).clone())
                }
                None => Err(err),
            },
        }
    }

    /// Process-supervision list from the same `configuration` payload that
    /// carries plugin assignment, since `original_source/src/utils/
    /// config_service.go`'s `GetPluginsToRun` returns both together.
    pub async fn fetch_process_monitors(&self) -> Result<Vec<ProcessMonitorConfig>> {
        Ok(self.fetch_configuration().await?.processes)
    }

    pub async fn fetch_agent_configuration(&self) -> Result<AgentConfiguration> {
        let resp = self.fetch_configuration().await?;
        Ok(AgentConfiguration {
            plugin_instances: resp.plugins,
            disabled_plugins: resp.disabled_plugins,
            auto_update_target_version: resp.auto_update_target_version,
        })
    }

    async fn fetch_configuration(&self) -> Result<ConfigurationResponse> {
        let path = format!(
            "/v2/databases/{}/agents/{}/configuration?api_key={}",
            self.database, self.hostname, self.api_key
        );
        match self.get_json::<ConfigurationResponse>(&path).await {
            Ok(cfg) => {
                self.configuration.set(cfg.clone()).await;
                Ok(cfg)
            }
            Err(err) => match self.configuration.get().await {
                Some(cached) => {
                    tracing::warn!(error = %err, "using last known agent configuration");
                    Ok((*cached).clone())
                }
                None => Err(err),
            },
        }
    }

    pub async fn fetch_current_plugin_bundle_version(&self) -> Result<String> {
        let path = format!("/databases/{}/plugins/current_version", self.database);
        let url = self.url(&path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        if !response.status().is_success() {
            return Err(anyhow!("GET {url} returned status {}", response.status()));
        }
        let body = response.text().await.with_context(|| format!("GET {url} body read failed"))?;
        Ok(body.trim().to_string())
    }

    /// Downloads the plugin bundle at `version` as opaque bytes. Decompression
    /// and installation belong to the self-update installer, out of scope
    /// here — this is just the fetch.
    pub async fn download_plugin_bundle(&self, version: &str) -> Result<Vec<u8>> {
        let path = format!("/databases/{}/plugins/{}", self.database, version);
        let url = self.url(&path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        if !response.status().is_success() {
            return Err(anyhow!("GET {url} returned status {}", response.status()));
        }
        Ok(response.bytes().await.with_context(|| format!("GET {url} body read failed"))?.to_vec())
    }

    pub async fn post_status(&self, running_plugins: &[String], custom_plugin_info: Option<&serde_json::Value>) -> Result<()> {
        let path = format!(
            "/v2/databases/{}/agents/{}?api_key={}",
            self.database, self.hostname, self.api_key
        );
        let url = self.url(&path);
        let body = AgentStatusBody {
            plugins: running_plugins,
            timestamp: crate::clock::now_unix(),
            custom_plugin_info,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        if !response.status().is_success() {
            return Err(anyhow!("POST {url} returned status {}", response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_cached_monitor_config_on_network_failure() {
        let mut server = mockito::Server::new_async().await;
        let client = ConfigServiceClient::new(server.url(), "key".into(), "acme+prod".into(), "host-1".into());

        let good_body = r#"{"monitors":[],"silence_policies":[]}"#;
        let mock = server
            .mock("GET", "/v2/databases/acme+prod/agents/host-1/monitoring_config")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(good_body)
            .create_async()
            .await;
        let first = client.fetch_monitor_config().await.unwrap();
        assert!(first.monitors.is_empty());
        mock.assert_async().await;

        let _down = server
            .mock("GET", "/v2/databases/acme+prod/agents/host-1/monitoring_config")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        let second = client.fetch_monitor_config().await;
        assert!(second.is_ok(), "a failed refetch falls back to the cached value");
    }

    #[tokio::test]
    async fn fails_when_no_cached_value_exists_yet() {
        let mut server = mockito::Server::new_async().await;
        let client = ConfigServiceClient::new(server.url(), "key".into(), "acme+prod".into(), "host-1".into());
        let _down = server
            .mock("GET", "/v2/databases/acme+prod/agents/host-1/monitoring_config")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        assert!(client.fetch_monitor_config().await.is_err());
    }

    #[tokio::test]
    async fn fetch_current_plugin_bundle_version_trims_body() {
        let mut server = mockito::Server::new_async().await;
        let client = ConfigServiceClient::new(server.url(), "key".into(), "acme+prod".into(), "host-1".into());
        let _mock = server
            .mock("GET", "/databases/acme+prod/plugins/current_version")
            .with_status(200)
            .with_body("v3\n")
            .create_async()
            .await;
        assert_eq!(client.fetch_current_plugin_bundle_version().await.unwrap(), "v3");
    }
}
