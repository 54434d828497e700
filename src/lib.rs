//! Postbus - durable fan-out relay for record events
//!
//! A publisher produces "post created" events into an acknowledged,
//! durable queue. Persister workers apply each event to the record store
//! exactly once (idempotency keys absorb redelivery), then announce the
//! result on a live broadcast hub that WebSocket listeners subscribe to.

pub mod admission;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod http;
pub mod model;
pub mod mutation;
pub mod persister;
pub mod publisher;
pub mod queue;
pub mod store;
pub mod utils;

#[cfg(test)]
pub mod test_utils;
