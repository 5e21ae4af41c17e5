//! Terminal rendering of published view snapshots.

pub mod table;

pub use table::{human_size, render, status_line};
