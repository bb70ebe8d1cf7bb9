//! Offline request queue.
//!
//! Requests that cannot be sent are kept in a bounded FIFO, persisted in the
//! key-value store, and replayed when connectivity returns.

mod offline;
mod request;

pub use offline::{RequestQueue, QUEUE_STORE_KEY};
pub use request::{DrainReport, QueueEvent, QueuedRequest};
