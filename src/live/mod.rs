//! Live-view synchronization engine.
//!
//! Merges a bulk snapshot with a stream of add, modify and delete events into
//! a sorted, de-duplicated row list. Nothing in here performs network I/O.

pub mod aggregate;
pub mod batcher;
pub mod order;
pub mod projector;
pub mod registry;
pub mod store;
pub mod view;
pub mod worker;

pub use batcher::{Batch, EventBatcher, LiveEvent};
pub use projector::Row;
pub use registry::{ContainmentIndex, EntityRegistry, ViewFilter};
pub use view::{FlushReport, LiveView};
