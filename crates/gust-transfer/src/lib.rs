/// Gust: receiver core of a multi-connection TCP file transfer daemon.
///
/// One worker thread per listening port drives an explicit state machine
/// through a binary command protocol: settings negotiation, block writes
/// with CRC-32C footers, checkpointed reconnect recovery, a one-shot chunk
/// inventory handshake for resumed downloads, and a coordinated done
/// exchange across all sibling workers.

pub mod buffer;
pub mod controller;
pub mod protocol;
pub mod receiver;
pub mod socket;
pub mod stats;
pub mod throttle;
pub mod transfer_log;
pub mod types;
pub mod worker;
pub mod writer;

// Re-export the embedding surface.
pub use receiver::{Receiver, ReceiverConfig, ReceiverError, SessionEvent};
pub use stats::{TransferReport, WorkerStats};
pub use types::{
    AllocationStatus, BlockDetails, Checkpoint, ErrorCode, FileChunksInfo, Interval, Settings,
};
