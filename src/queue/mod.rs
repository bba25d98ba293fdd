//! Operation Queue: durable FIFO of remote mutations awaiting confirmation.

mod operation;
mod operation_queue;
mod settings;

pub use operation::{BatchedWrite, OperationKind, QueuedOperation};
pub use operation_queue::{NackOutcome, OperationQueue, QueueEvent};
pub use settings::{QueueSettings, DEFAULT_MAX_QUEUE_LEN, DEFAULT_MAX_RETRIES};
