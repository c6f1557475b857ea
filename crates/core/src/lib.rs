//! Host-side supervisor for the familiar agent backend.
//!
//! Decides between the embedded worker and a remote server, starts the
//! embedded worker at most once, detects readiness through the handshake
//! artifact, and publishes one lifecycle state for any number of observers.

pub mod boot;
pub mod config;
pub mod service;
pub mod settings;
pub mod types;
