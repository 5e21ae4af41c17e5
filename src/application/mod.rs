//! Session orchestration: data sources, bulk fetches and the session task.

pub mod backend;
pub mod demo;
pub mod error;
pub mod fetch;
pub mod session;
