//! Live view of Kubernetes workloads and their container log files.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod live;
pub mod presentation;
