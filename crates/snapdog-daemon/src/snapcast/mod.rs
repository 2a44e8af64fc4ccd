//! Snapcast integration: JSON-RPC client, server state types, and the
//! zone-grouping reconciler.

pub mod client;
pub mod reconciler;
pub mod types;
