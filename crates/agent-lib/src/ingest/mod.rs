//! Ingestion pipeline: bounded queue plus batching writer

mod queue;
mod writer;

pub use queue::{IngressQueue, QueueStats};
pub use writer::{BatchWriter, WriterConfig};
