//! HTTP client for the familiar agent API, served by the embedded worker
//! or a remote server.

pub mod http;
pub mod models;

pub use http::{AgentClient, ClientError};
pub use models::*;
