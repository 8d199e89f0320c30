//! Host telemetry and supervision agent: samples system/process metrics,
//! tails logs, runs plugins, evaluates anomaly rules against all three, and
//! exposes the results over a persistent control channel plus a small local
//! HTTP command surface.

pub mod anomaly;
pub mod cli;
pub mod clock;
pub mod collectors;
pub mod config;
pub mod config_service;
pub mod control;
pub mod error;
pub mod local_http;
pub mod log_watcher;
pub mod model;
pub mod plugins;
pub mod reporter;
pub mod store;
pub mod supervisor;
