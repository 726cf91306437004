//! Bounded staging area for produced telemetry.
//!
//! The scheduler appends, a single drainer (the sender or the connector
//! router) removes. Connector endpoint queues reuse the same type.

mod element;
mod queue;

pub use element::BufferElement;
pub use queue::ResultBuffer;
