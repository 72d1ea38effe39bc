//! Real-time job and queue tracking.
//!
//! Provides the transport channel to the server's queue endpoint (with
//! reconnect and liveness pings), typed wire message parsing, the
//! reconciler that merges optimistic local tasks with authoritative server
//! snapshots, the per-job REST polling fallback, and the tracker service
//! that wires it all together for the application root.

pub mod api;
pub mod channel;
pub mod events;
pub mod messages;
pub mod poller;
pub mod reconcile;
pub mod tracker;
