//! Realtime stream modules.
//!
//! - `multiplexer`: websocket connection, keepalive, activation, and handler
//!   dispatch.
//! - `proto`: frames exchanged with the stream endpoint.
//! - `registry`: subscriptions keyed by stream kind.

/// Websocket multiplexer and outbound sender.
pub mod multiplexer;
/// Stream protocol frames and decoded events.
pub mod proto;
/// Subscription registry.
pub mod registry;
