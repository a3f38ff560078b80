//! Telemetry batch reconciler for a time-series metrics store.
//!
//! Samples arrive over HTTP, are grouped per resource and metric, and
//! get written to the store with on-demand resource and metric
//! creation along the way.

pub mod agent;
pub mod cache;
pub mod config;
pub mod definitions;
pub mod dispatch;
pub mod filter;
pub mod health;
pub mod identity;
pub mod ingest;
pub mod lock;
pub mod route;
pub mod sample;
pub mod store;
