//! # callway-server
//!
//! WebSocket front end for the Callway signaling hub: upgrade
//! authentication, per-connection read/write loops, heartbeats,
//! configuration and Prometheus metrics.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use auth::{AuthError, Authenticator, ConnectQuery};
pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
