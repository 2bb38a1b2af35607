//! Resilient ntfy subscriber that surfaces notifications as browser tabs.
//!
//! The crate is organized by concern:
//! - `stream`: the subscription reader, wire types and SSE re-framing.
//! - `settings`: connection settings and the resume cursor store.
//! - `sink`: consumers of decoded notifications, including the tab sink.
//! - `keepalive`: periodic heartbeat for hosts that suspend idle processes.
//! - `retry`: reconnect delay and timeout utilities.

/// Periodic no-op heartbeat.
pub mod keepalive;
/// Reconnect policy and timeout helpers.
pub mod retry;
/// Settings provider trait, connection config and bundled stores.
pub mod settings;
/// Message sinks and notification presentation.
pub mod sink;
/// Subscription reader, protocol types and frame decoding.
pub mod stream;
