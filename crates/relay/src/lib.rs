// tandem-relay: hub for live collaborative sessions over WebSocket.

pub mod api;
pub mod auth;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod feed;
pub mod hub;
pub mod metrics;
pub mod server;
pub mod store;
pub mod ws;
