//! Discovers plugin instances, runs them on a timer, parses their output,
//! derives rates, and reports everything through the fan-in reporter.

use super::grammar::{parse_first_line, state_name};
use super::{MANIFEST_FILE, STATUS_EXECUTABLE};
use crate::clock::now_unix;
use crate::config_service::ConfigServiceClient;
use crate::model::{OutputGrammar, PluginDescriptor, PluginInstance};
use crate::reporter::Reporter;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    output_grammar: Option<OutputGrammar>,
    #[serde(default)]
    calculate_rates: Vec<String>,
}

async fn discover_dir(root: &str, is_custom: bool) -> Vec<PluginDescriptor> {
    let pattern = format!("{}/*", root.trim_end_matches('/'));
    let Ok(paths) = glob::glob(&pattern) else {
        warn!(%pattern, "invalid plugin discovery glob");
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in paths.flatten() {
        if !entry.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().and_then(|n| n.to_str()) else { continue };
        let status_path = entry.join(STATUS_EXECUTABLE);
        if !status_path.exists() {
            continue;
        }
        let manifest = read_manifest(&entry).await;
        out.push(PluginDescriptor {
            name: name.to_string(),
            version: root.to_string(),
            output_grammar: manifest.as_ref().and_then(|m| m.output_grammar).unwrap_or(OutputGrammar::Nagios),
            calculate_rates: manifest.map(|m| m.calculate_rates).unwrap_or_default(),
            is_custom,
            path: entry,
        });
    }
    out
}

async fn read_manifest(dir: &Path) -> Option<Manifest> {
    let data = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await.ok()?;
    serde_json::from_str(&data).ok()
}

/// `plugins-dir/<bundle-version>/*` plus `custom-plugins-dir/*`; a custom
/// plugin with the same name as a bundled one replaces it.
async fn discover_all(plugins_dir: &str, custom_plugins_dir: &str, bundle_version: &str) -> BTreeMap<String, PluginDescriptor> {
    let versioned = format!("{}/{}", plugins_dir.trim_end_matches('/'), bundle_version);
    let mut map: BTreeMap<String, PluginDescriptor> = discover_dir(&versioned, false).await.into_iter().map(|d| (d.name.clone(), d)).collect();
    for custom in discover_dir(custom_plugins_dir, true).await {
        map.insert(custom.name.clone(), custom);
    }
    map
}

pub struct PluginRunner {
    config_client: Arc<ConfigServiceClient>,
    reporter: Arc<Reporter>,
    hostname: String,
    plugins_dir: String,
    custom_plugins_dir: String,
    rate_regexes: RwLock<BTreeMap<String, Vec<Regex>>>,
    rate_cache: RwLock<BTreeMap<(String, String, String), (f64, i64)>>,
}

impl PluginRunner {
    pub fn new(config_client: Arc<ConfigServiceClient>, reporter: Arc<Reporter>, hostname: String, plugins_dir: String, custom_plugins_dir: String) -> Self {
        Self {
            config_client,
            reporter,
            hostname,
            plugins_dir,
            custom_plugins_dir,
            rate_regexes: RwLock::new(BTreeMap::new()),
            rate_cache: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn spawn(self: Arc<Self>, sleep: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sleep);
            loop {
                interval.tick().await;
                self.run_cycle(sleep).await;
            }
        })
    }

    async fn run_cycle(&self, timeout: Duration) {
        let agent_config = match self.config_client.fetch_agent_configuration().await {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(error = %err, "failed to fetch agent configuration, skipping plugin cycle");
                return;
            }
        };
        let bundle_version = match self.config_client.fetch_current_plugin_bundle_version().await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to fetch plugin bundle version, skipping plugin cycle");
                return;
            }
        };

        let descriptors = discover_all(&self.plugins_dir, &self.custom_plugins_dir, &bundle_version).await;

        let mut handles = Vec::new();
        for (name, descriptor) in descriptors {
            if agent_config.disabled_plugins.contains(&name) {
                continue;
            }
            let instances = agent_config.plugin_instances.get(&name).cloned().unwrap_or_else(|| vec![PluginInstance::default()]);
            for instance in instances {
                let descriptor = descriptor.clone();
                handles.push(self.run_instance(descriptor, instance, timeout));
            }
        }
        futures::future::join_all(handles).await;
    }

    async fn run_instance(&self, descriptor: PluginDescriptor, instance: PluginInstance, timeout: Duration) {
        let argv = build_argv(&descriptor.path, &instance);
        let output = match spawn_and_capture(&argv, timeout).await {
            Ok(output) => output,
            Err(err) => {
                error!(plugin = %descriptor.name, instance = %instance.instance_name, error = %err, "plugin run failed");
                return;
            }
        };

        let first_line = output.stdout.lines().next().unwrap_or_default();
        let parsed = match parse_first_line(descriptor.output_grammar, first_line) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(plugin = %descriptor.name, instance = %instance.instance_name, error = %err, "unparseable plugin output");
                return;
            }
        };
        let state = match state_name(output.exit_code) {
            Ok(state) => state,
            Err(err) => {
                error!(plugin = %descriptor.name, instance = %instance.instance_name, error = %err, "unknown plugin exit code");
                return;
            }
        };

        self.report_status(&descriptor.name, &instance.instance_name, state).await;
        for point in parsed.points {
            self.report_metric(&descriptor, &instance.instance_name, &point.name, point.value, point.context, point.dimensions).await;
        }
        let _ = parsed.status_text;
    }

    async fn report_status(&self, plugin: &str, instance: &str, state: &'static str) {
        let metric = plugin_metric_name(&self.hostname, plugin, instance, "status");
        self.reporter.report(metric, 1.0, now_unix(), Some(state.to_string()), Vec::new()).await;
    }

    async fn report_metric(&self, descriptor: &PluginDescriptor, instance: &str, metric_name: &str, value: f64, context: Option<String>, mut dims: Vec<(String, String)>) {
        let now = now_unix();
        if !instance.is_empty() {
            dims.push(("instance".to_string(), instance.to_string()));
        }
        let full_name = plugin_metric_name(&self.hostname, &descriptor.name, instance, metric_name);

        if self.matches_rate_pattern(descriptor, metric_name).await {
            let key = (descriptor.name.clone(), instance.to_string(), metric_name.to_string());
            let mut cache = self.rate_cache.write().await;
            if let Some((prev_value, prev_t)) = cache.get(&key).copied() {
                let dt = (now - prev_t) as f64;
                if dt > 0.0 {
                    let rate = (value - prev_value) / dt;
                    self.reporter.report(full_name.clone(), rate, now, context.clone(), dims.clone()).await;
                }
            }
            cache.insert(key, (value, now));
        }

        self.reporter.report(full_name, value, now, context, dims).await;
    }

    async fn matches_rate_pattern(&self, descriptor: &PluginDescriptor, metric_name: &str) -> bool {
        if descriptor.calculate_rates.is_empty() {
            return false;
        }
        let mut cache = self.rate_regexes.write().await;
        let regexes = cache.entry(descriptor.name.clone()).or_insert_with(|| {
            descriptor.calculate_rates.iter().filter_map(|p| Regex::new(p).ok()).collect()
        });
        regexes.iter().any(|re| re.is_match(metric_name))
    }
}

fn plugin_metric_name(hostname: &str, plugin: &str, instance: &str, metric: &str) -> String {
    let _ = instance;
    format!("{hostname}.plugins.{plugin}.{metric}")
}

fn build_argv(path: &Path, instance: &PluginInstance) -> Vec<String> {
    let mut argv = vec![path.join(STATUS_EXECUTABLE).to_string_lossy().to_string()];
    for (key, value) in &instance.arguments {
        argv.push(format!("--{key}"));
        argv.push(value.clone());
    }
    argv
}

struct PluginOutput {
    stdout: String,
    exit_code: i32,
}

/// Spawns `argv`, draining stdout on a separate task while racing a
/// `timeout` deadline against `child.wait()`; on timeout the process is
/// killed.
async fn spawn_and_capture(argv: &[String], timeout: Duration) -> anyhow::Result<PluginOutput> {
    let (program, args) = argv.split_first().ok_or_else(|| anyhow::anyhow!("empty plugin argv"))?;
    let mut child = Command::new(program).args(args).stdout(Stdio::piped()).stderr(Stdio::null()).kill_on_drop(true).spawn()?;
    let mut stdout = child.stdout.take().expect("stdout piped above");

    let read_handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });

    let wait_result = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(timeout) => None,
    };

    let status = match wait_result {
        Some(status) => status?,
        None => {
            debug!(?argv, "plugin exceeded its timeout, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
            anyhow::bail!("plugin timed out after {timeout:?}");
        }
    };

    let bytes = read_handle.await.unwrap_or_default();
    Ok(PluginOutput {
        stdout: String::from_utf8_lossy(&bytes).into_owned(),
        exit_code: status.code().unwrap_or(-1),
    })
}

pub fn spawn(runner: Arc<PluginRunner>, sleep: Duration) -> tokio::task::JoinHandle<()> {
    runner.spawn(sleep)
}
