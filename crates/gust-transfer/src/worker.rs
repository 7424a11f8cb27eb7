/// Per-port receiver worker. Each worker owns one listening socket, one
/// framing buffer, one checkpoint and its stats, and drives an explicit
/// state machine from cold start to transfer completion or error exit.
/// Siblings coordinate only through the controller and the parent session.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::buffer::{read_at_most, CommandBuffer};
use crate::controller::{
    FunnelStatus, ThreadStatus, ThreadsController, SEND_FILE_CHUNKS_FUNNEL,
    WAIT_FOR_FINISH_OR_CHECKPOINT_CV,
};
use crate::protocol::{
    self, Cmd, CHECKPOINT_OFFSET_VERSION, MAX_DONE_LEN, MAX_FOOTER_LEN, MAX_HEADER_LEN,
    MAX_SETTINGS_LEN, MAX_SIZE_LEN, MAX_VERSION_LEN, MIN_BUF_LENGTH, TIMEOUT_BUFFER_MILLIS,
    WAIT_TIMEOUT_FACTOR,
};
use crate::receiver::{SessionCore, SessionEvent};
use crate::socket::ServerSocket;
use crate::stats::WorkerStats;
use crate::types::{BlockDetails, Checkpoint, ErrorCode};

/// States of the worker machine. `End` and `Failed` are terminal; `Failed`
/// means the thread stops without coordinating a clean finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Listen,
    AcceptFirstConnection,
    AcceptWithTimeout,
    SendLocalCheckpoint,
    ReadNextCmd,
    ProcessFileCmd,
    ProcessSettingsCmd,
    ProcessDoneCmd,
    ProcessSizeCmd,
    SendFileChunks,
    SendGlobalCheckpoints,
    SendDoneCmd,
    SendAbortCmd,
    WaitForFinishOrNewCheckpoint,
    FinishWithError,
    End,
    Failed,
}

pub struct ReceiverWorker {
    index: usize,
    socket: ServerSocket,
    buf: CommandBuffer,
    parent: Arc<SessionCore>,
    controller: Arc<ThreadsController>,
    protocol_version: i32,
    stats: WorkerStats,
    checkpoint: Checkpoint,
    new_checkpoints: Vec<Checkpoint>,
    /// Checkpoints from the parent's list already relayed to the sender.
    checkpoint_index: usize,
    /// Candidate for `checkpoint_index`, promoted once a data command that
    /// followed the relay has been fully processed.
    pending_checkpoint_index: usize,
    done_send_failure: bool,
    cur_connection_verified: bool,
    enable_checksum: bool,
    block_mode: bool,
    sender_read_timeout: i64,
    sender_write_timeout: i64,
}

impl ReceiverWorker {
    pub(crate) fn new(
        index: usize,
        port: u16,
        parent: Arc<SessionCore>,
        controller: Arc<ThreadsController>,
    ) -> ReceiverWorker {
        let config = parent.config();
        let socket = ServerSocket::new(
            port,
            config.read_timeout_millis,
            config.write_timeout_millis,
        );
        let buf = CommandBuffer::new(config.buffer_size);
        let protocol_version = config.protocol_version;
        controller.register_thread(index);
        ReceiverWorker {
            index,
            socket,
            buf,
            parent,
            controller,
            protocol_version,
            stats: WorkerStats::new(),
            checkpoint: Checkpoint::new(port),
            new_checkpoints: Vec::new(),
            checkpoint_index: 0,
            pending_checkpoint_index: 0,
            done_send_failure: false,
            cur_connection_verified: false,
            enable_checksum: false,
            block_mode: true,
            sender_read_timeout: -1,
            sender_write_timeout: -1,
        }
    }

    /// Bind the listening socket so the real port is known before the
    /// worker thread starts.
    pub(crate) fn init(&mut self) -> ErrorCode {
        if !self.listen_with_retries().is_ok() {
            error!("worker {}: unable to listen on port {}", self.index, self.socket.port());
            return ErrorCode::ConnError;
        }
        self.checkpoint.port = self.socket.port();
        ErrorCode::Ok
    }

    pub(crate) fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Drive the state machine to completion, then run the exit work that
    /// must happen on every path: deregistration, the one-shot session-end
    /// hook and the final stats snapshot.
    pub(crate) fn run(mut self) -> WorkerStats {
        self.run_loop();
        self.controller.deregister_thread(self.index);
        let parent = self.parent.clone();
        self.controller.execute_at_end(move || parent.end_cur_global_session());
        info!(
            "worker {} port {} exiting: {}",
            self.index,
            self.socket.port(),
            self.stats
        );
        self.parent.publish(SessionEvent::WorkerFinished {
            port: self.socket.port(),
            error: self.stats.local_error(),
        });
        self.stats
    }

    fn run_loop(&mut self) {
        let mut state = WorkerState::Listen;
        loop {
            let abort_code = self.parent.cur_abort_code();
            if !abort_code.is_ok() {
                error!(
                    "worker {} port {}: transfer aborted: {}",
                    self.index,
                    self.socket.port(),
                    abort_code
                );
                self.stats.set_local_error(ErrorCode::Abort);
                return;
            }
            if state == WorkerState::End || state == WorkerState::Failed {
                return;
            }
            state = self.dispatch(state);
        }
    }

    fn dispatch(&mut self, state: WorkerState) -> WorkerState {
        debug!(
            "worker {} port {} entered {:?}",
            self.index,
            self.socket.port(),
            state
        );
        match state {
            WorkerState::Listen => self.listen(),
            WorkerState::AcceptFirstConnection => self.accept_first_connection(),
            WorkerState::AcceptWithTimeout => self.accept_with_timeout(),
            WorkerState::SendLocalCheckpoint => self.send_local_checkpoint(),
            WorkerState::ReadNextCmd => self.read_next_cmd(),
            WorkerState::ProcessFileCmd => self.process_file_cmd(),
            WorkerState::ProcessSettingsCmd => self.process_settings_cmd(),
            WorkerState::ProcessDoneCmd => self.process_done_cmd(),
            WorkerState::ProcessSizeCmd => self.process_size_cmd(),
            WorkerState::SendFileChunks => self.send_file_chunks(),
            WorkerState::SendGlobalCheckpoints => self.send_global_checkpoints(),
            WorkerState::SendDoneCmd => self.send_done_cmd(),
            WorkerState::SendAbortCmd => self.send_abort_cmd(),
            WorkerState::WaitForFinishOrNewCheckpoint => self.wait_for_finish_or_new_checkpoint(),
            WorkerState::FinishWithError => self.finish_with_error(),
            WorkerState::End | WorkerState::Failed => state,
        }
    }

    /// Reset per-session state before waiting for a first connection.
    fn reset(&mut self) {
        self.buf.reset();
        self.checkpoint_index = 0;
        self.pending_checkpoint_index = 0;
        self.done_send_failure = false;
        self.cur_connection_verified = false;
        self.sender_read_timeout = -1;
        self.sender_write_timeout = -1;
        self.enable_checksum = false;
        self.block_mode = true;
        self.stats.reset();
        self.new_checkpoints.clear();
        self.checkpoint = Checkpoint::new(self.socket.port());
    }

    fn abort_requested(&self) -> bool {
        !self.parent.cur_abort_code().is_ok()
    }

    /// Listen with retries, sleeping between attempts. A non-retryable
    /// `ConnError` fails immediately; otherwise one more sleepless try
    /// decides. `listen` is idempotent, so the last call is free when an
    /// earlier attempt already succeeded.
    fn listen_with_retries(&mut self) -> ErrorCode {
        let config = self.parent.config();
        let max_retries = config.max_retries;
        let sleep_millis = config.sleep_millis;
        for retry in 1..max_retries {
            match self.socket.listen() {
                ErrorCode::Ok => break,
                ErrorCode::ConnError => return ErrorCode::ConnError,
                _ => {
                    info!("worker {}: sleeping after failed listen attempt {}", self.index, retry);
                    std::thread::sleep(Duration::from_millis(sleep_millis));
                }
            }
        }
        self.socket.listen()
    }

    fn listen(&mut self) -> WorkerState {
        if !self.listen_with_retries().is_ok() {
            error!("worker {}: unable to listen despite retries", self.index);
            self.stats.set_local_error(ErrorCode::ConnError);
            return WorkerState::Failed;
        }
        WorkerState::AcceptFirstConnection
    }

    fn accept_first_connection(&mut self) -> WorkerState {
        self.reset();
        self.socket.close_connection();
        let config = self.parent.config();
        let timeout = config.accept_timeout_millis;
        let max_accept_retries = config.max_accept_retries;
        let mut accept_attempts = 0;
        loop {
            // another worker already has the sender; switch to the timeout
            // accept so this port synchronizes with the sender's settings
            if self.parent.has_new_transfer_started() {
                return WorkerState::AcceptWithTimeout;
            }
            if accept_attempts == max_accept_retries {
                error!("worker {}: unable to accept after {} attempts", self.index, accept_attempts);
                self.stats.set_local_error(ErrorCode::ConnError);
                return WorkerState::Failed;
            }
            if self.abort_requested() {
                error!(
                    "worker {}: abort while waiting for first connection, attempts {}",
                    self.index, accept_attempts
                );
                return WorkerState::Failed;
            }
            let parent = self.parent.clone();
            let code = self.socket.accept_next_connection(timeout, self.cur_connection_verified, || {
                !parent.cur_abort_code().is_ok()
            });
            if code.is_ok() {
                break;
            }
            accept_attempts += 1;
        }
        let parent = self.parent.clone();
        let peer = self.socket.peer_ip();
        self.controller
            .execute_at_start(move || parent.start_new_global_session(peer));
        WorkerState::ReadNextCmd
    }

    fn accept_with_timeout(&mut self) -> WorkerState {
        let socket_err = self.socket.non_retryable_err_code();
        if !socket_err.is_ok() {
            error!(
                "worker {} port {}: socket has non-retryable error {}",
                self.index,
                self.socket.port(),
                socket_err
            );
            self.stats.set_local_error(socket_err);
            return WorkerState::End;
        }
        self.socket.close_connection();

        let mut timeout = self.parent.config().accept_window_millis;
        if self.sender_read_timeout > 0 {
            // settings are in hand; cover the sender's own retry window
            timeout = self.sender_read_timeout.max(self.sender_write_timeout) as u64
                + TIMEOUT_BUFFER_MILLIS;
        }
        let parent = self.parent.clone();
        let code = self.socket.accept_next_connection(timeout, self.cur_connection_verified, || {
            !parent.cur_abort_code().is_ok()
        });
        self.cur_connection_verified = false;
        if !code.is_ok() {
            error!(
                "worker {} port {}: accept failed with timeout {}",
                self.index,
                self.socket.port(),
                timeout
            );
            self.stats.set_local_error(code);
            if self.done_send_failure {
                // the done handshake had already been reached; no need to
                // wait for the other workers
                return WorkerState::End;
            }
            return WorkerState::FinishWithError;
        }

        if self.done_send_failure {
            // session state stays as is, only the done exchange is replayed
            return WorkerState::SendLocalCheckpoint;
        }

        self.buf.reset();
        self.pending_checkpoint_index = self.checkpoint_index;
        let next = if self.stats.local_error().is_ok() {
            WorkerState::ReadNextCmd
        } else {
            WorkerState::SendLocalCheckpoint
        };
        self.stats.set_local_error(ErrorCode::Ok);
        next
    }

    fn send_local_checkpoint(&mut self) -> WorkerState {
        let checkpoint = if self.done_send_failure {
            // block count -1 tells the sender to finalize, not resend
            Checkpoint {
                port: self.socket.port(),
                num_blocks: -1,
                last_block: None,
            }
        } else {
            debug!("worker {} sending local {}", self.index, self.checkpoint);
            self.checkpoint.clone()
        };

        let frame_len = protocol::max_local_checkpoint_len(self.protocol_version);
        let mut frame = vec![0u8; frame_len];
        let mut off = 0;
        let encoded = protocol::encode_checkpoints(
            self.protocol_version,
            &mut frame,
            &mut off,
            std::slice::from_ref(&checkpoint),
        );
        debug_assert!(encoded);
        match self.socket.write(&frame) {
            Ok(n) if n == frame_len => {}
            other => {
                error!(
                    "worker {}: local checkpoint write mismatch {} {:?}",
                    self.index, frame_len, other
                );
                self.stats.set_local_error(ErrorCode::SocketWriteError);
                return WorkerState::AcceptWithTimeout;
            }
        }
        self.stats.add_header_bytes(frame_len as i64);
        if self.done_send_failure {
            return WorkerState::SendDoneCmd;
        }
        WorkerState::ReadNextCmd
    }

    fn read_next_cmd(&mut self) -> WorkerState {
        self.buf.start_cmd();
        let num_read = self.buf.read_at_least(&mut self.socket, MIN_BUF_LENGTH);
        if num_read < MIN_BUF_LENGTH {
            error!(
                "worker {} port {}: socket read failure {} {}",
                self.index,
                self.socket.port(),
                MIN_BUF_LENGTH,
                num_read
            );
            self.stats.set_local_error(ErrorCode::SocketReadError);
            return WorkerState::AcceptWithTimeout;
        }
        let tag = self.buf.next_u8();
        match Cmd::from_u8(tag) {
            Some(Cmd::Done) => WorkerState::ProcessDoneCmd,
            Some(Cmd::File) => WorkerState::ProcessFileCmd,
            Some(Cmd::Settings) => WorkerState::ProcessSettingsCmd,
            Some(Cmd::Size) => WorkerState::ProcessSizeCmd,
            _ => {
                error!("worker {}: received an unknown cmd {:#x}", self.index, tag);
                self.stats.set_local_error(ErrorCode::ProtocolError);
                WorkerState::FinishWithError
            }
        }
    }

    fn process_settings_cmd(&mut self) -> WorkerState {
        let mut off = self.buf.off;
        let version_end = (self.buf.old_off + MAX_VERSION_LEN).min(self.buf.valid_end());
        let sender_version = match protocol::decode_version(&self.buf.data, &mut off, version_end) {
            Some(v) => v,
            None => {
                error!("worker {}: unable to decode version", self.index);
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return WorkerState::FinishWithError;
            }
        };
        if sender_version != self.protocol_version {
            error!(
                "worker {}: sender/receiver protocol version mismatch {} {}",
                self.index, sender_version, self.protocol_version
            );
            let negotiated = protocol::negotiate_protocol(sender_version, self.protocol_version);
            if negotiated == 0 {
                warn!(
                    "worker {}: can not support sender with version {}, aborting",
                    self.index, sender_version
                );
                self.stats.set_local_error(ErrorCode::VersionIncompatible);
                return WorkerState::SendAbortCmd;
            }
            if negotiated != self.protocol_version {
                info!("worker {}: changing protocol version to {}", self.index, negotiated);
                self.protocol_version = negotiated;
            }
            if negotiated != sender_version {
                self.stats.set_local_error(ErrorCode::VersionMismatch);
                return WorkerState::SendAbortCmd;
            }
        }

        let settings_end =
            (self.buf.old_off + MAX_VERSION_LEN + MAX_SETTINGS_LEN).min(self.buf.valid_end());
        let settings = match protocol::decode_settings(&self.buf.data, &mut off, settings_end) {
            Some(s) => s,
            None => {
                error!("worker {}: unable to decode settings cmd", self.index);
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return WorkerState::FinishWithError;
            }
        };
        self.buf.off = off;
        if settings.transfer_id != self.parent.transfer_id() {
            error!(
                "worker {}: transfer id mismatch: sender '{}', receiver '{}'",
                self.index,
                settings.transfer_id,
                self.parent.transfer_id()
            );
            self.stats.set_local_error(ErrorCode::IdMismatch);
            return WorkerState::SendAbortCmd;
        }
        self.sender_read_timeout = settings.read_timeout_millis as i64;
        self.sender_write_timeout = settings.write_timeout_millis as i64;
        self.enable_checksum = settings.enable_checksum;
        self.block_mode = !settings.block_mode_disabled;
        self.cur_connection_verified = true;
        if settings.send_file_chunks {
            // the sender resumes; it now waits for our chunk inventory
            self.buf.reset();
            return WorkerState::SendFileChunks;
        }
        self.buf.consume_msg();
        WorkerState::ReadNextCmd
    }

    fn process_file_cmd(&mut self) -> WorkerState {
        // First file cmd on a non-resuming sender: one worker owns writing
        // the session header to the transfer log. Zero received blocks is a
        // good proxy for "first".
        if self.parent.config().enable_download_resumption && self.stats.num_blocks() == 0 {
            let funnel = self.controller.get_funnel(SEND_FILE_CHUNKS_FUNNEL);
            if funnel.status() == FunnelStatus::Start {
                self.parent.add_transfer_log_header(self.block_mode, false);
                funnel.notify_success();
            }
        }
        self.checkpoint.reset_last_block_details();
        let next = self.receive_block();
        if !self.stats.local_error().is_ok() {
            self.stats.incr_failed_attempts();
        }
        next
    }

    /// Body of PROCESS_FILE_CMD past the one-shot funnel work. Any exit
    /// before the block completes records the partial progress into the
    /// local checkpoint (protocol permitting) so the sender can resume
    /// inside the block.
    fn receive_block(&mut self) -> WorkerState {
        let transfer_status = ErrorCode::from_u8(self.buf.next_u8());
        if !transfer_status.is_ok() {
            debug!("worker {}: sender entered error state {}", self.index, transfer_status);
        }
        let header_len = u16::from_le_bytes([
            self.buf.data[self.buf.off],
            self.buf.data[self.buf.off + 1],
        ]) as usize;
        debug!("worker {}: processing file cmd, header len {}", self.index, header_len);

        if header_len > self.buf.num_read {
            self.buf.read_at_least(&mut self.socket, header_len);
        }
        if self.buf.num_read < header_len {
            error!(
                "worker {}: unable to read full header {} {}",
                self.index, header_len, self.buf.num_read
            );
            self.stats.set_local_error(ErrorCode::SocketReadError);
            return WorkerState::AcceptWithTimeout;
        }
        self.buf.off += 2;
        let mut off = self.buf.off;
        let bd = match protocol::decode_header(&self.buf.data, &mut off, self.buf.valid_end()) {
            Some(bd) => bd,
            None => {
                error!(
                    "worker {}: error decoding header at off {} num_read {}",
                    self.index, self.buf.off, self.buf.num_read
                );
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return WorkerState::FinishWithError;
            }
        };
        self.buf.off = off;
        let header_bytes = (self.buf.off - self.buf.old_off) as i64;
        self.stats.add_header_bytes(header_bytes);
        // the advertised length must cover exactly the decoded header
        if header_len as i64 != header_bytes {
            error!(
                "worker {}: header length mismatch for {} seq {}: advertised {}, decoded {}",
                self.index, bd.file_name, bd.seq_id, header_len, header_bytes
            );
            self.stats.set_local_error(ErrorCode::ProtocolError);
            return WorkerState::FinishWithError;
        }

        // a well formed file cmd arrived, apply the pending checkpoint update
        self.checkpoint_index = self.pending_checkpoint_index;
        debug!(
            "worker {}: read id:{} size:{} off:{} num_read:{}",
            self.index, bd.file_name, bd.data_size, self.buf.off, self.buf.num_read
        );

        let mut writer = match self.parent.file_creator().open_for_block(self.index, &bd) {
            Ok(w) => w,
            Err(e) => {
                error!("worker {}: cannot open {} for writing: {}", self.index, bd.file_name, e);
                self.record_partial_block(&bd, 0, header_bytes);
                self.stats.set_local_error(ErrorCode::FileWriteError);
                return WorkerState::SendAbortCmd;
            }
        };

        let mut checksum: u32 = 0;
        let mut remaining_data = (self.buf.valid_end() - self.buf.off) as i64;
        let to_write = remaining_data.min(bd.data_size);
        self.stats.add_data_bytes(to_write);
        let first_segment = self.buf.off..self.buf.off + to_write as usize;
        if self.enable_checksum {
            checksum = crc32c::crc32c_append(checksum, &self.buf.data[first_segment.clone()]);
        }
        if let Some(throttler) = self.parent.throttler() {
            // more than this block may already sit in the buffer, but the
            // bytes did cross the network; the first call accounts for the
            // header and the buffered payload, later calls only for wire
            // reads
            throttler.limit((to_write + header_bytes) as u64);
        }
        if let Err(e) = writer.write(&self.buf.data[first_segment]) {
            error!("worker {}: write failed for {}: {}", self.index, bd.file_name, e);
            let written = writer.total_written();
            self.record_partial_block(&bd, written, header_bytes);
            self.stats.set_local_error(ErrorCode::FileWriteError);
            return WorkerState::SendAbortCmd;
        }
        self.buf.off += to_write as usize;
        remaining_data -= to_write;

        // leftover handling below relies on this loop only running when the
        // buffer has been fully drained
        while writer.total_written() < bd.data_size {
            if self.abort_requested() {
                error!(
                    "worker {} port {}: marked for abort while processing a file",
                    self.index,
                    self.socket.port()
                );
                let written = writer.total_written();
                self.record_partial_block(&bd, written, header_bytes);
                return WorkerState::Failed;
            }
            let need = (bd.data_size - writer.total_written()) as usize;
            let nres = match read_at_most(&mut self.socket, &mut self.buf.data, need) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("worker {}: payload read error: {}", self.index, e);
                    break;
                }
            };
            if let Some(throttler) = self.parent.throttler() {
                // bytes actually read off the wire, known only after the read
                throttler.limit(nres as u64);
            }
            self.stats.add_data_bytes(nres as i64);
            if self.enable_checksum {
                checksum = crc32c::crc32c_append(checksum, &self.buf.data[..nres]);
            }
            if let Err(e) = writer.write(&self.buf.data[..nres]) {
                error!("worker {}: write failed for {}: {}", self.index, bd.file_name, e);
                let written = writer.total_written();
                self.record_partial_block(&bd, written, header_bytes);
                self.stats.set_local_error(ErrorCode::FileWriteError);
                return WorkerState::SendAbortCmd;
            }
        }
        if writer.total_written() != bd.data_size {
            // only transmission errors land here, disk errors returned above
            error!(
                "worker {} port {}: could not read entire content for {} ({} of {})",
                self.index,
                self.socket.port(),
                bd.file_name,
                writer.total_written(),
                bd.data_size
            );
            let written = writer.total_written();
            self.record_partial_block(&bd, written, header_bytes);
            self.stats.set_local_error(ErrorCode::SocketReadError);
            return WorkerState::AcceptWithTimeout;
        }
        debug!(
            "worker {}: completed {} off: {} num_read: {}",
            self.index, bd.file_name, self.buf.off, self.buf.num_read
        );
        self.buf.finish_block(remaining_data as usize, MAX_HEADER_LEN);

        if self.enable_checksum {
            self.buf.start_cmd();
            let num_read = self.buf.read_at_least(&mut self.socket, MIN_BUF_LENGTH);
            if num_read < MIN_BUF_LENGTH {
                error!(
                    "worker {}: socket read failure {} {}",
                    self.index, MIN_BUF_LENGTH, num_read
                );
                self.stats.set_local_error(ErrorCode::SocketReadError);
                return WorkerState::AcceptWithTimeout;
            }
            let tag = self.buf.next_u8();
            if Cmd::from_u8(tag) != Some(Cmd::Footer) {
                error!("worker {}: expecting footer cmd, received {:#x}", self.index, tag);
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return WorkerState::FinishWithError;
            }
            let mut off = self.buf.off;
            let footer_end = (self.buf.old_off + MAX_FOOTER_LEN).min(self.buf.valid_end());
            let received_checksum =
                match protocol::decode_footer(&self.buf.data, &mut off, footer_end) {
                    Some(c) => c,
                    None => {
                        error!("worker {}: unable to decode footer cmd", self.index);
                        self.stats.set_local_error(ErrorCode::ProtocolError);
                        return WorkerState::FinishWithError;
                    }
                };
            self.buf.off = off;
            if checksum != received_checksum {
                error!(
                    "worker {} port {}: checksum mismatch {} {} for {}",
                    self.index,
                    self.socket.port(),
                    checksum,
                    received_checksum,
                    bd.file_name
                );
                self.stats.set_local_error(ErrorCode::ChecksumMismatch);
                return WorkerState::AcceptWithTimeout;
            }
            self.buf.consume_msg();
        }

        if self.parent.is_log_based_resumption() {
            self.parent.transfer_log().add_block_write_entry(
                bd.seq_id,
                bd.offset,
                bd.data_size,
                bd.file_size,
                &bd.file_name,
            );
        }
        self.stats.add_effective_bytes(header_bytes, bd.data_size);
        self.stats.incr_num_blocks();
        self.checkpoint.incr_num_blocks();
        self.parent.publish(SessionEvent::BlockReceived {
            port: self.socket.port(),
            seq_id: bd.seq_id,
            bytes: bd.data_size,
        });
        WorkerState::ReadNextCmd
    }

    /// Partially received block contents stay valid for resumption when the
    /// protocol carries offsets; checksum verification is bypassed for the
    /// resumed remainder.
    fn record_partial_block(&mut self, bd: &BlockDetails, total_written: i64, header_bytes: i64) {
        if self.protocol_version >= CHECKPOINT_OFFSET_VERSION {
            self.checkpoint
                .set_last_block_details(bd.seq_id, bd.offset, total_written);
            self.stats.add_effective_bytes(header_bytes, total_written);
        }
    }

    fn process_done_cmd(&mut self) -> WorkerState {
        if self.buf.num_read != MIN_BUF_LENGTH {
            error!(
                "worker {}: unexpected state for done command, off {} num_read {}",
                self.index, self.buf.off, self.buf.num_read
            );
            self.stats.set_local_error(ErrorCode::ProtocolError);
            return WorkerState::FinishWithError;
        }
        let sender_status = ErrorCode::from_u8(self.buf.next_u8());
        let mut off = self.buf.off;
        let done_end = (self.buf.old_off + MAX_DONE_LEN).min(self.buf.valid_end());
        let (num_blocks_send, total_sender_bytes) =
            match protocol::decode_done(&self.buf.data, &mut off, done_end) {
                Some(pair) => pair,
                None => {
                    error!("worker {}: unable to decode done cmd", self.index);
                    self.stats.set_local_error(ErrorCode::ProtocolError);
                    return WorkerState::FinishWithError;
                }
            };
        self.buf.off = off;
        self.stats.set_num_blocks_send(num_blocks_send);
        self.stats.set_total_sender_bytes(total_sender_bytes);
        self.stats.set_remote_error(sender_status);

        // a valid command arrived, apply the pending checkpoint update
        self.checkpoint_index = self.pending_checkpoint_index;
        WorkerState::WaitForFinishOrNewCheckpoint
    }

    fn process_size_cmd(&mut self) -> WorkerState {
        let mut off = self.buf.off;
        let size_end = (self.buf.old_off + MAX_SIZE_LEN).min(self.buf.valid_end());
        let total_sender_bytes = match protocol::decode_size(&self.buf.data, &mut off, size_end) {
            Some(n) => n,
            None => {
                error!("worker {}: unable to decode size cmd", self.index);
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return WorkerState::FinishWithError;
            }
        };
        self.buf.off = off;
        debug!("worker {}: number of bytes to receive {}", self.index, total_sender_bytes);
        self.stats.set_total_sender_bytes(total_sender_bytes);
        self.buf.consume_msg();
        WorkerState::ReadNextCmd
    }

    fn send_file_chunks(&mut self) -> WorkerState {
        // settings must have been received to be here
        debug_assert!(self.sender_read_timeout > 0);
        let waiting_time =
            Duration::from_millis((self.sender_read_timeout / WAIT_TIMEOUT_FACTOR).max(1) as u64);
        let funnel = self.controller.get_funnel(SEND_FILE_CHUNKS_FUNNEL);
        loop {
            match funnel.status() {
                FunnelStatus::End => {
                    // inventory already replayed by a sibling
                    let frame = [Cmd::Ack as u8];
                    if !matches!(self.socket.write(&frame), Ok(1)) {
                        error!("worker {}: socket write error for ack", self.index);
                        self.stats.set_local_error(ErrorCode::SocketWriteError);
                        return WorkerState::AcceptWithTimeout;
                    }
                    self.stats.add_header_bytes(1);
                    return WorkerState::ReadNextCmd;
                }
                FunnelStatus::Progress => {
                    let frame = [Cmd::Wait as u8];
                    if !matches!(self.socket.write(&frame), Ok(1)) {
                        error!("worker {}: socket write error for wait", self.index);
                        self.stats.set_local_error(ErrorCode::SocketWriteError);
                        return WorkerState::AcceptWithTimeout;
                    }
                    self.stats.add_header_bytes(1);
                    funnel.wait(waiting_time);
                }
                FunnelStatus::Start => {
                    let chunks = self.parent.file_chunks_info();
                    let mut off = 0usize;
                    self.buf.data[off] = Cmd::Chunks as u8;
                    off += 1;
                    let encoded =
                        protocol::encode_chunks_cmd(&mut self.buf.data, &mut off, chunks.len() as i64);
                    debug_assert!(encoded);
                    match self.socket.write(&self.buf.data[..off]) {
                        Ok(n) if n == off => self.stats.add_header_bytes(n as i64),
                        other => {
                            if let Ok(n) = other {
                                self.stats.add_header_bytes(n as i64);
                            }
                            error!("worker {}: socket write error for chunks cmd", self.index);
                            self.stats.set_local_error(ErrorCode::SocketWriteError);
                            funnel.notify_fail();
                            return WorkerState::AcceptWithTimeout;
                        }
                    }
                    // pack as many entries per frame as fit:
                    // <frame length><entry><entry>...
                    let mut entries_written = 0;
                    while entries_written < chunks.len() {
                        let mut off = 4usize;
                        let consumed = protocol::encode_file_chunks_info_list(
                            &mut self.buf.data,
                            &mut off,
                            entries_written,
                            &chunks,
                        );
                        let frame_len = (off - 4) as u32;
                        self.buf.data[0..4].copy_from_slice(&frame_len.to_le_bytes());
                        match self.socket.write(&self.buf.data[..off]) {
                            Ok(n) => {
                                self.stats.add_header_bytes(n as i64);
                                if n != off {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                        entries_written += consumed;
                    }
                    if entries_written != chunks.len() {
                        error!(
                            "worker {}: could not write all the file chunks {} {}",
                            self.index,
                            chunks.len(),
                            entries_written
                        );
                        self.stats.set_local_error(ErrorCode::SocketWriteError);
                        funnel.notify_fail();
                        return WorkerState::AcceptWithTimeout;
                    }
                    let mut ack = [0u8; 1];
                    if !matches!(self.socket.read(&mut ack, true), Ok(1)) {
                        error!("worker {}: socket read error for chunks ack", self.index);
                        self.stats.set_local_error(ErrorCode::SocketReadError);
                        funnel.notify_fail();
                        return WorkerState::AcceptWithTimeout;
                    }
                    self.parent.add_transfer_log_header(self.block_mode, true);
                    funnel.notify_success();
                    return WorkerState::ReadNextCmd;
                }
            }
        }
    }

    fn send_global_checkpoints(&mut self) -> WorkerState {
        let mut off = 0usize;
        self.buf.data[off] = Cmd::Err as u8;
        off += 1;
        let len_pos = off;
        off += 2;
        let body_start = off;
        let encoded = protocol::encode_checkpoints(
            self.protocol_version,
            &mut self.buf.data,
            &mut off,
            &self.new_checkpoints,
        );
        debug_assert!(encoded);
        let body_len = (off - body_start) as u16;
        self.buf.data[len_pos..len_pos + 2].copy_from_slice(&body_len.to_le_bytes());

        match self.socket.write(&self.buf.data[..off]) {
            Ok(n) if n == off => {}
            _ => {
                error!("worker {}: unable to write global checkpoints", self.index);
                self.stats.set_local_error(ErrorCode::SocketWriteError);
                return WorkerState::AcceptWithTimeout;
            }
        }
        self.stats.add_header_bytes(off as i64);
        // promoted once the sender proves it saw them by sending more data
        self.pending_checkpoint_index = self.checkpoint_index + self.new_checkpoints.len();
        self.buf.reset();
        WorkerState::ReadNextCmd
    }

    fn send_abort_cmd(&mut self) -> WorkerState {
        let mut off = 0usize;
        self.buf.data[off] = Cmd::Abort as u8;
        off += 1;
        let encoded = protocol::encode_abort(
            &mut self.buf.data,
            &mut off,
            self.protocol_version,
            self.stats.local_error(),
            self.stats.num_blocks(),
        );
        debug_assert!(encoded);
        // no need to check the write result; this side disconnects and the
        // sender times out
        let _ = self.socket.write(&self.buf.data[..off]);
        self.socket.close_connection();
        self.stats.add_header_bytes(off as i64);
        if self.stats.local_error() == ErrorCode::VersionMismatch {
            // the sender reconnects with the renegotiated version
            return WorkerState::AcceptWithTimeout;
        }
        WorkerState::FinishWithError
    }

    fn send_done_cmd(&mut self) -> WorkerState {
        let frame = [Cmd::Done as u8];
        if !matches!(self.socket.write(&frame), Ok(1)) {
            error!("worker {}: unable to send done cmd", self.index);
            self.done_send_failure = true;
            self.stats.set_local_error(ErrorCode::SocketWriteError);
            return WorkerState::AcceptWithTimeout;
        }
        self.stats.add_header_bytes(1);

        let mut ack = [0u8; 1];
        match self.socket.read(&mut ack, false) {
            Ok(1) if ack[0] == Cmd::Done as u8 => {}
            _ => {
                error!("worker {} port {}: did not receive ack for done", self.index, self.socket.port());
                self.done_send_failure = true;
                self.stats.set_local_error(ErrorCode::SocketReadError);
                return WorkerState::AcceptWithTimeout;
            }
        }

        let mut tail = [0u8; MIN_BUF_LENGTH];
        match self.socket.read(&mut tail, false) {
            Ok(0) => {}
            other => {
                error!(
                    "worker {} port {}: eof not found where expected: {:?}",
                    self.index,
                    self.socket.port(),
                    other
                );
                self.done_send_failure = true;
                self.stats.set_local_error(ErrorCode::SocketReadError);
                return WorkerState::AcceptWithTimeout;
            }
        }
        self.socket.close_connection();
        info!(
            "worker {} port {}: got ack for done, transfer finished",
            self.index,
            self.socket.port()
        );
        WorkerState::End
    }

    fn check_for_finish_or_new_checkpoints(&mut self) -> WorkerState {
        let checkpoints = self.parent.new_checkpoints(self.checkpoint_index);
        if !checkpoints.is_empty() {
            self.new_checkpoints = checkpoints;
            self.controller.mark_state(self.index, ThreadStatus::Running);
            return WorkerState::SendGlobalCheckpoints;
        }
        if !self.controller.has_threads(self.index, ThreadStatus::Running) {
            self.controller.mark_state(self.index, ThreadStatus::Finished);
            return WorkerState::SendDoneCmd;
        }
        WorkerState::WaitForFinishOrNewCheckpoint
    }

    fn wait_for_finish_or_new_checkpoint(&mut self) -> WorkerState {
        // only reached on the clean path
        debug_assert!(self.stats.local_error().is_ok());
        debug_assert!(self.sender_read_timeout > 0);
        let cv = self.controller.get_condition(WAIT_FOR_FINISH_OR_CHECKPOINT_CV);
        let timeout =
            Duration::from_millis((self.sender_read_timeout / WAIT_TIMEOUT_FACTOR).max(1) as u64);
        self.controller.mark_state(self.index, ThreadStatus::Waiting);
        loop {
            {
                let mut guard = cv.acquire();
                let next = self.check_for_finish_or_new_checkpoints();
                if next != WorkerState::WaitForFinishOrNewCheckpoint {
                    guard.notify_one();
                    return next;
                }
                guard.wait_for(timeout);
                let next = self.check_for_finish_or_new_checkpoints();
                if next != WorkerState::WaitForFinishOrNewCheckpoint {
                    guard.notify_one();
                    return next;
                }
            }
            // still waiting on siblings; keep the sender thread alive
            let frame = [Cmd::Wait as u8];
            if !matches!(self.socket.write(&frame), Ok(1)) {
                warn!("worker {}: unable to write wait cmd", self.index);
                self.stats.set_local_error(ErrorCode::SocketWriteError);
                self.controller.mark_state(self.index, ThreadStatus::Running);
                return WorkerState::AcceptWithTimeout;
            }
            self.stats.add_header_bytes(1);
        }
    }

    fn finish_with_error(&mut self) -> WorkerState {
        // only reached with an error latched
        debug_assert!(!self.stats.local_error().is_ok());
        info!(
            "worker {} port {}: finishing with error {}",
            self.index,
            self.socket.port(),
            self.stats.local_error()
        );
        // close everything so the sender sees an error on connect
        self.socket.close_all();
        let cv = self.controller.get_condition(WAIT_FOR_FINISH_OR_CHECKPOINT_CV);
        {
            let guard = cv.acquire();
            self.parent.add_checkpoint(self.checkpoint.clone());
            self.controller.mark_state(self.index, ThreadStatus::Finished);
            guard.notify_one();
        }
        WorkerState::End
    }
}
