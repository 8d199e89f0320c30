//! Plugin discovery and timeout-bounded execution.
//!
//! Grounded on `original_source/src/apps/agent/plugin.go`'s per-instance
//! subprocess loop and `plugin-check.go`'s perf-data grammar;
//! `agent/src/services/commands.rs::execute_cosmos_pruner` for the
//! spawn/timeout-race subprocess idiom.

pub mod grammar;
pub mod runner;

pub use runner::{spawn, PluginRunner};

/// Name of the optional per-plugin-directory manifest describing output
/// grammar and rate-derivation regexes; absent means nagios grammar with no
/// calculated rates, matching the one grammar the original source ever
/// emitted.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Name of the executable every plugin directory is expected to contain,
/// invoked as `<path>/status --k1 v1 --k2 v2 ...`.
pub const STATUS_EXECUTABLE: &str = "status";
