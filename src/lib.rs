//! Rust client for the Aternos server panel.
//!
//! The panel has no public API, so the crate drives it the way a browser
//! would. The crate is organized by transport surface:
//! - `gateway`: challenge-aware HTTP exchanges with a shared cookie store.
//! - `token`: ajax token extraction from the login page.
//! - `client`: login, logout, session persistence, server listing and
//!   account settings.
//! - `server`: per-server status and lifecycle requests.
//! - `stream`: realtime websocket multiplexer for status, console, heap and
//!   tick events.
//! - `retry`: shared retry and timeout utilities.

/// Account login and session persistence.
pub mod client;
/// Cookie store shared across transport resets.
pub mod cookies;
/// Crate error taxonomy.
pub mod error;
/// HTTP gateway that retries through anti-bot challenges.
pub mod gateway;
/// Pattern helpers for scraping panel pages.
pub mod html;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// SEC nonce generation.
pub mod sec;
/// Server handle, status info, and lifecycle requests.
pub mod server;
/// Realtime stream multiplexer and protocol types.
pub mod stream;
/// Ajax token extraction.
pub mod token;

pub use client::AternosClient;
pub use error::{AternosError, ErrorKind};
