//! Persistent duplex connection to the central service carrying reload
//! signals, ad-hoc metric queries, and snapshot lookups.
//!
//! Grounded on `original_source/src/apps/agent/websocket_client.go` and the
//! teacher's `manager/src/state_sync/rpc_client.rs` retry philosophy.

pub mod channel;
pub mod proto;

pub use channel::ControlChannel;
