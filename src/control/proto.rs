//! Frame types carried over the length-delimited control connection.
//!
//! The original wire uses protocol-buffer encoding; this port keeps the
//! field contract and swaps the encoding for JSON (see the module doc on
//! `channel.rs`), since no `.proto` schema ships with the source tree.

use crate::model::Snapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    ConfigReload,
    Metrics {
        #[serde(default)]
        start: Option<i64>,
        #[serde(default)]
        end: Option<i64>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        metric_names: Vec<String>,
        #[serde(default)]
        metric_regexes: Vec<String>,
    },
    Snapshot {
        snapshot_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesPayload {
    pub name: String,
    pub points: Vec<crate::model::Point>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Identification { agent_name: String, database: String },
    Metrics { series: Vec<SeriesPayload> },
    Snapshot { snapshot: Option<Snapshot> },
    /// Written by the writer loop whenever no other frame went out within
    /// a ping period; has no `Request` counterpart.
    Ping,
}

impl Response {
    pub fn identification(agent_name: impl Into<String>, database: impl Into<String>) -> Self {
        Response::Identification { agent_name: agent_name.into(), database: database.into() }
    }
}
