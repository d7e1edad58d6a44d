//! Axum/tokio platform adapter: bridges native WebSockets to the router's
//! `ServerSocket` seam and drives `accept` / `ingest` / `disconnect` through
//! a connection's lifecycle.

mod server;
mod ws;

pub use server::{AuthOutcome, Authenticator, UpgradeRequest, build_gateway_app, serve};
