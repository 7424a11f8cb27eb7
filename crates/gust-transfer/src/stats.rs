/// Per-worker transfer counters and the aggregated end-of-transfer report.
/// A worker owns its stats exclusively; aggregation happens once at join.

use std::fmt;

use crate::types::ErrorCode;

/// Counters for one worker. Header bytes are protocol overhead, data bytes
/// are payload moved (including retries), effective bytes count only blocks
/// that completed.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    header_bytes: i64,
    data_bytes: i64,
    effective_header_bytes: i64,
    effective_data_bytes: i64,
    num_blocks: i64,
    failed_attempts: i64,
    local_err: ErrorCode,
    remote_err: ErrorCode,
    num_blocks_send: i64,
    total_sender_bytes: i64,
}

impl WorkerStats {
    pub fn new() -> WorkerStats {
        WorkerStats {
            num_blocks_send: -1,
            total_sender_bytes: -1,
            ..WorkerStats::default()
        }
    }

    pub fn reset(&mut self) {
        *self = WorkerStats::new();
    }

    pub fn add_header_bytes(&mut self, bytes: i64) {
        self.header_bytes += bytes;
    }

    pub fn add_data_bytes(&mut self, bytes: i64) {
        self.data_bytes += bytes;
    }

    pub fn add_effective_bytes(&mut self, header: i64, data: i64) {
        self.effective_header_bytes += header;
        self.effective_data_bytes += data;
    }

    pub fn incr_num_blocks(&mut self) {
        self.num_blocks += 1;
    }

    pub fn incr_failed_attempts(&mut self) {
        self.failed_attempts += 1;
    }

    pub fn set_local_error(&mut self, code: ErrorCode) {
        self.local_err = code;
    }

    pub fn set_remote_error(&mut self, code: ErrorCode) {
        self.remote_err = code;
    }

    pub fn set_num_blocks_send(&mut self, n: i64) {
        self.num_blocks_send = n;
    }

    pub fn set_total_sender_bytes(&mut self, n: i64) {
        self.total_sender_bytes = n;
    }

    pub fn header_bytes(&self) -> i64 {
        self.header_bytes
    }

    pub fn data_bytes(&self) -> i64 {
        self.data_bytes
    }

    pub fn effective_data_bytes(&self) -> i64 {
        self.effective_data_bytes
    }

    pub fn num_blocks(&self) -> i64 {
        self.num_blocks
    }

    pub fn failed_attempts(&self) -> i64 {
        self.failed_attempts
    }

    pub fn local_error(&self) -> ErrorCode {
        self.local_err
    }

    pub fn remote_error(&self) -> ErrorCode {
        self.remote_err
    }

    pub fn num_blocks_send(&self) -> i64 {
        self.num_blocks_send
    }

    pub fn total_sender_bytes(&self) -> i64 {
        self.total_sender_bytes
    }
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocks={} effective={}B data={}B header={}B failed_attempts={} local={} remote={}",
            self.num_blocks,
            self.effective_data_bytes,
            self.data_bytes,
            self.header_bytes,
            self.failed_attempts,
            self.local_err,
            self.remote_err
        )
    }
}

/// Aggregated outcome of one receiver run, one entry per port.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub worker_stats: Vec<(u16, WorkerStats)>,
    pub total_effective_bytes: i64,
    pub num_blocks: i64,
    pub failed_attempts: i64,
    pub error: ErrorCode,
}

impl TransferReport {
    pub fn new(worker_stats: Vec<(u16, WorkerStats)>) -> TransferReport {
        let mut total_effective_bytes = 0;
        let mut num_blocks = 0;
        let mut failed_attempts = 0;
        let mut error = ErrorCode::Ok;
        for (_, stats) in &worker_stats {
            total_effective_bytes += stats.effective_data_bytes();
            num_blocks += stats.num_blocks();
            failed_attempts += stats.failed_attempts();
            if error.is_ok() && !stats.local_error().is_ok() {
                error = stats.local_error();
            }
        }
        TransferReport {
            worker_stats,
            total_effective_bytes,
            num_blocks,
            failed_attempts,
            error,
        }
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transfer {}: {} blocks, {} bytes over {} ports, {} failed attempts",
            self.error,
            self.num_blocks,
            self.total_effective_bytes,
            self.worker_stats.len(),
            self.failed_attempts
        )
    }
}
