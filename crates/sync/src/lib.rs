//! Interaction telemetry synchronization.
//!
//! [`engine::InteractionSyncEngine`] accepts interaction records, persists
//! them to the durable local history unconditionally, and forwards them to
//! the server either immediately (latency-sensitive kinds) or in periodic
//! batches, with retry and failure queues when the server is unavailable.

pub mod api;
pub mod engine;
