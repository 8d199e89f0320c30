//! Core data model shared across components: points, monitor rules,
//! conditions, process monitors, plugin descriptors, and snapshots.
//!
//! Field shapes follow `manager/src/health/types.rs`'s style of
//! serde-derived domain structs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single dimension key/value pair, ordered because the store's filter
/// semantics (§3 Point) care about exact dimension equality, not presence.
pub type Dimension = (String, String);

/// `(time: seconds-since-epoch, sequence: u32, value, context, dimensions)`.
/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub time: i64,
    pub sequence: u32,
    pub value: f64,
    pub context: Option<String>,
    pub dimensions: Vec<Dimension>,
}

impl Point {
    pub fn new(time: i64, value: f64) -> Self {
        Self {
            time,
            sequence: 0,
            value,
            context: None,
            dimensions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_dimensions(mut self, dims: Vec<Dimension>) -> Self {
        self.dimensions = dims;
        self
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
}

impl Comparator {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Ne => lhs != rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Gt => lhs > rhs,
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "=",
            Comparator::Ne => "!=",
            Comparator::Ge => ">=",
            Comparator::Gt => ">",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub comparator: Comparator,
    pub threshold: f64,
    #[serde(default)]
    pub match_regex: Option<String>,
    #[serde(with = "humantime_serde")]
    pub only_after: std::time::Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRule {
    pub id: String,
    #[serde(default)]
    pub log_name: Option<String>,
    #[serde(default)]
    pub stat_name: Option<String>,
    #[serde(default)]
    pub stat_regex: Option<String>,
    #[serde(default)]
    pub plugin_name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub snooze_until: Option<i64>,
    pub conditions: Vec<Condition>,
}

impl MonitorRule {
    pub fn is_snoozed(&self, now: i64) -> bool {
        self.snooze_until.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilencePolicy {
    pub max_fires: u32,
    #[serde(with = "humantime_serde")]
    pub window: std::time::Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub monitors: Vec<MonitorRule>,
    #[serde(default)]
    pub silence_policies: Vec<SilencePolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusMethod {
    Name,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMonitorConfig {
    pub id: String,
    pub name: String,
    pub nickname: String,
    pub status_method: StatusMethod,
    #[serde(default)]
    pub regex: Option<String>,
    pub start_cmd: String,
    /// Either a shell command string, `"kill"`, or empty — both of the
    /// latter mean "send `kill`/`kill -9`" per spec.md §4.G stop semantics.
    #[serde(default)]
    pub stop_cmd: String,
    pub user: String,
    #[serde(default)]
    pub snooze_until: Option<i64>,
}

impl ProcessMonitorConfig {
    pub fn stop_is_kill(&self) -> bool {
        self.stop_cmd.trim().is_empty() || self.stop_cmd.trim() == "kill"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputGrammar {
    Nagios,
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInstance {
    pub instance_name: String,
    #[serde(default)]
    pub arguments: Vec<Dimension>,
}

impl Default for PluginInstance {
    fn default() -> Self {
        Self {
            instance_name: "default".to_string(),
            arguments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub output_grammar: OutputGrammar,
    #[serde(default)]
    pub calculate_rates: Vec<String>,
    #[serde(default)]
    pub is_custom: bool,
    pub path: std::path::PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl PluginState {
    pub fn from_exit_code(code: i32) -> Result<Self, crate::error::PluginGrammarError> {
        match code {
            0 => Ok(PluginState::Ok),
            1 => Ok(PluginState::Warning),
            2 => Ok(PluginState::Critical),
            3 => Ok(PluginState::Unknown),
            other => Err(crate::error::PluginGrammarError::UnknownStateCode(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PluginState::Ok => "ok",
            PluginState::Warning => "warning",
            PluginState::Critical => "critical",
            PluginState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// 16 random bytes, hex-encoded.
    pub id: String,
    pub created_at: i64,
    pub requested_window: (i64, i64),
    pub series: Vec<(String, Vec<Point>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub regex: String,
    pub start: i64,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Plugin-instance list, disabled-plugin set, and auto-update target version,
/// as returned by the agent configuration endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfiguration {
    #[serde(default)]
    pub plugin_instances: BTreeMap<String, Vec<PluginInstance>>,
    #[serde(default)]
    pub disabled_plugins: std::collections::BTreeSet<String>,
    #[serde(default)]
    pub auto_update_target_version: Option<String>,
}

/// A read query against the series store. Mirrors spec.md §4.B `GetParams`.
#[derive(Debug, Clone)]
pub struct ReadSeriesParams {
    pub db: String,
    pub series: String,
    pub start: i64,
    pub end: Option<i64>,
    pub limit: Option<usize>,
    pub filter: BTreeMap<String, String>,
    pub not_filter: BTreeMap<String, String>,
    pub include_context: bool,
    pub include_dimensions: bool,
}

impl ReadSeriesParams {
    pub fn new(db: impl Into<String>, series: impl Into<String>, start: i64) -> Self {
        Self {
            db: db.into(),
            series: series.into(),
            start,
            end: None,
            limit: None,
            filter: BTreeMap::new(),
            not_filter: BTreeMap::new(),
            include_context: true,
            include_dimensions: true,
        }
    }
}
