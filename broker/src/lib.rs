//! The SPICE session broker: a small authenticating reverse proxy that
//! brokers short-lived, per-session TCP tunnels between remote-display
//! clients and a hypervisor's SPICE port.
//!
//! Exposed as a library so the binary entry point (`main.rs`) stays thin
//! and so integration tests can build an [`AppState`] and a router directly.

pub mod auth_service;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod enrollment;
pub mod error;
pub mod forwarder;
pub mod hypervisor;
pub mod invites;
pub mod persistence;
pub mod server;
pub mod session;
pub mod state;
pub mod types;
