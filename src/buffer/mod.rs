//! Write buffering: pending operations, per-type queues, overflow policies and flushing.

mod manager;
mod ops;

pub use manager::{EnqueueOutcome, WriteBufferManager};
pub use ops::{PendingOperation, WriteAck, WriteCallback, WriteKind};
