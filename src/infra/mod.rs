//! Infrastructure adapters: HTTP and WebSocket clients, telemetry.

pub mod error;
pub mod graphql;
pub mod subscription;
pub mod telemetry;
