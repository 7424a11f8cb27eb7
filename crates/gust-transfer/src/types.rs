/// Wire-visible data model shared by the codec, the worker state machine
/// and the parent session: error/status codes, sender settings, block
/// descriptors, checkpoints and the resumption chunk inventory.

use std::fmt;

/// Status and error codes. A single byte on the wire (sender transfer
/// status, DONE status, ABORT reason) and the worker's local error latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    Error = 1,
    Abort = 2,
    ConnError = 3,
    SocketReadError = 4,
    SocketWriteError = 5,
    FileWriteError = 6,
    MemoryAllocationError = 7,
    ProtocolError = 8,
    VersionIncompatible = 9,
    IdMismatch = 10,
    ChecksumMismatch = 11,
    VersionMismatch = 12,
}

impl ErrorCode {
    /// Decode a status byte. Unknown values collapse to `Error` so a newer
    /// peer cannot push us out of the enum.
    pub fn from_u8(b: u8) -> ErrorCode {
        match b {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Error,
            2 => ErrorCode::Abort,
            3 => ErrorCode::ConnError,
            4 => ErrorCode::SocketReadError,
            5 => ErrorCode::SocketWriteError,
            6 => ErrorCode::FileWriteError,
            7 => ErrorCode::MemoryAllocationError,
            8 => ErrorCode::ProtocolError,
            9 => ErrorCode::VersionIncompatible,
            10 => ErrorCode::IdMismatch,
            11 => ErrorCode::ChecksumMismatch,
            12 => ErrorCode::VersionMismatch,
            _ => ErrorCode::Error,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Error => "ERROR",
            ErrorCode::Abort => "ABORT",
            ErrorCode::ConnError => "CONN_ERROR",
            ErrorCode::SocketReadError => "SOCKET_READ_ERROR",
            ErrorCode::SocketWriteError => "SOCKET_WRITE_ERROR",
            ErrorCode::FileWriteError => "FILE_WRITE_ERROR",
            ErrorCode::MemoryAllocationError => "MEMORY_ALLOCATION_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::VersionIncompatible => "VERSION_INCOMPATIBLE",
            ErrorCode::IdMismatch => "ID_MISMATCH",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
        };
        f.write_str(s)
    }
}

/// Session settings announced by the sender in the SETTINGS command.
/// Latched by the worker for the duration of the accepted session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Settings {
    pub transfer_id: String,
    pub read_timeout_millis: u64,
    pub write_timeout_millis: u64,
    pub enable_checksum: bool,
    pub block_mode_disabled: bool,
    pub send_file_chunks: bool,
}

/// Allocation state of the target file as seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocationStatus {
    NotExists = 0,
    ExistsCorrectSize = 1,
    ExistsTooLarge = 2,
    ExistsTooSmall = 3,
}

impl AllocationStatus {
    pub fn from_u8(b: u8) -> Option<AllocationStatus> {
        match b {
            0 => Some(AllocationStatus::NotExists),
            1 => Some(AllocationStatus::ExistsCorrectSize),
            2 => Some(AllocationStatus::ExistsTooLarge),
            3 => Some(AllocationStatus::ExistsTooSmall),
            _ => None,
        }
    }
}

/// One block of one file, as described by a FILE command header. Lives for
/// the duration of a single block reception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDetails {
    pub file_name: String,
    pub seq_id: i64,
    pub file_size: i64,
    /// Byte offset of this block within the file.
    pub offset: i64,
    /// Payload bytes that follow the header on the wire.
    pub data_size: i64,
    pub allocation_status: AllocationStatus,
    /// Chain to the block previously written under a smaller file size.
    /// Only meaningful when `allocation_status` is `ExistsTooSmall`.
    pub prev_seq_id: i64,
}

/// Offset-granular progress inside a partially received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastBlockDetails {
    pub seq_id: i64,
    pub offset: i64,
    pub received_bytes: i64,
}

/// A worker's durable progress marker, keyed by its listening port. Sent to
/// the peer on reconnection so the sender can decide what to retransmit.
///
/// `num_blocks == -1` is the sentinel for "DONE was sent but its ack never
/// arrived"; the sender then finalizes instead of resending blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub port: u16,
    pub num_blocks: i64,
    pub last_block: Option<LastBlockDetails>,
}

impl Checkpoint {
    pub fn new(port: u16) -> Checkpoint {
        Checkpoint {
            port,
            num_blocks: 0,
            last_block: None,
        }
    }

    pub fn incr_num_blocks(&mut self) {
        self.num_blocks += 1;
    }

    pub fn set_last_block_details(&mut self, seq_id: i64, offset: i64, received_bytes: i64) {
        self.last_block = Some(LastBlockDetails {
            seq_id,
            offset,
            received_bytes,
        });
    }

    pub fn reset_last_block_details(&mut self) {
        self.last_block = None;
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "checkpoint port={} blocks={}", self.port, self.num_blocks)?;
        if let Some(lb) = &self.last_block {
            write!(
                f,
                " last_block=({}, {}, {})",
                lb.seq_id, lb.offset, lb.received_bytes
            )?;
        }
        Ok(())
    }
}

/// A received byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

/// Previously received ranges of one file, replayed to a resuming sender in
/// the CHUNKS command so it skips what is already on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunksInfo {
    pub seq_id: i64,
    pub file_name: String,
    pub file_size: i64,
    pub chunks: Vec<Interval>,
}
