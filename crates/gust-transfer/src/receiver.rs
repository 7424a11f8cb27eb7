/// Receiver aggregate: binds one listening port per worker, spawns one OS
/// thread per port, and owns the state the siblings share: the abort code,
/// the checkpoint list, the chunk inventory, the resumption log, the file
/// creator and the throttler.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver as EventReceiver, Sender as EventSender};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::controller::ThreadsController;
use crate::protocol::PROTOCOL_VERSION;
use crate::stats::{TransferReport, WorkerStats};
use crate::throttle::Throttler;
use crate::transfer_log::TransferLogManager;
use crate::types::{Checkpoint, ErrorCode, FileChunksInfo};
use crate::worker::ReceiverWorker;
use crate::writer::FileCreator;

/// Receiver options. Everything a worker consults lives here; there is no
/// process-global configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Identifier the sender must echo in its SETTINGS command.
    pub transfer_id: String,
    /// Directory received files are written under.
    pub dest_dir: PathBuf,
    /// First listening port; 0 binds ephemeral ports.
    pub start_port: u16,
    /// Number of listening ports, one worker thread each.
    pub num_ports: usize,
    /// Per-worker framing buffer size in bytes.
    pub buffer_size: usize,
    /// Listen attempts before giving up on a port.
    pub max_retries: u32,
    /// Sleep between failed listen attempts.
    pub sleep_millis: u64,
    /// Accept attempts while waiting for the first connection.
    pub max_accept_retries: u32,
    /// Per-attempt accept timeout while waiting for the first connection.
    pub accept_timeout_millis: u64,
    /// Reconnect accept window before any sender settings are known.
    pub accept_window_millis: u64,
    /// Read timeout applied to accepted connections.
    pub read_timeout_millis: u64,
    /// Write timeout applied to accepted connections.
    pub write_timeout_millis: u64,
    /// Serve the chunks handshake and log received blocks for resumption.
    pub enable_download_resumption: bool,
    /// Keep resumption in memory only; skip the on-disk transfer log.
    pub disable_transfer_log: bool,
    /// Receive throttle in bytes/sec; 0 disables throttling.
    pub throttle_bytes_per_sec: u64,
    /// Protocol version this receiver starts negotiations at.
    pub protocol_version: i32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            transfer_id: String::new(),
            dest_dir: PathBuf::from("."),
            start_port: 0,
            num_ports: 8,
            buffer_size: 256 * 1024,
            max_retries: 3,
            sleep_millis: 50,
            max_accept_retries: 500,
            accept_timeout_millis: 100,
            accept_window_millis: 10_000,
            read_timeout_millis: 5000,
            write_timeout_millis: 5000,
            enable_download_resumption: false,
            disable_transfer_log: false,
            throttle_bytes_per_sec: 0,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Progress notifications published by the workers. Reads are optional;
/// a full channel drops the oldest-style by dropping the new event.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionStarted { peer: Option<IpAddr> },
    BlockReceived { port: u16, seq_id: i64, bytes: i64 },
    WorkerFinished { port: u16, error: ErrorCode },
    SessionEnded,
}

/// State shared between the workers and the embedding application.
pub(crate) struct SessionCore {
    config: ReceiverConfig,
    abort_code: AtomicU8,
    new_transfer_started: AtomicBool,
    checkpoints: Mutex<Vec<Checkpoint>>,
    file_chunks: Mutex<Vec<FileChunksInfo>>,
    transfer_log: TransferLogManager,
    file_creator: FileCreator,
    throttler: Option<Throttler>,
    events: EventSender<SessionEvent>,
}

impl SessionCore {
    pub(crate) fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub(crate) fn transfer_id(&self) -> &str {
        &self.config.transfer_id
    }

    pub(crate) fn cur_abort_code(&self) -> ErrorCode {
        ErrorCode::from_u8(self.abort_code.load(Ordering::Acquire))
    }

    pub(crate) fn abort(&self, code: ErrorCode) {
        self.abort_code.store(code as u8, Ordering::Release);
    }

    pub(crate) fn has_new_transfer_started(&self) -> bool {
        self.new_transfer_started.load(Ordering::Acquire)
    }

    /// First worker to accept a connection reports the session start.
    pub(crate) fn start_new_global_session(&self, peer: Option<IpAddr>) {
        self.new_transfer_started.store(true, Ordering::Release);
        match peer {
            Some(ip) => info!("starting new transfer session with {}", ip),
            None => info!("starting new transfer session"),
        }
        self.publish(SessionEvent::SessionStarted { peer });
    }

    /// Last worker out reports the session end.
    pub(crate) fn end_cur_global_session(&self) {
        self.new_transfer_started.store(false, Ordering::Release);
        info!("transfer session ended");
        self.publish(SessionEvent::SessionEnded);
    }

    pub(crate) fn add_checkpoint(&self, cp: Checkpoint) {
        info!("adding {}", cp);
        self.checkpoints.lock().push(cp);
    }

    /// Checkpoints appended after `since`, in append order.
    pub(crate) fn new_checkpoints(&self, since: usize) -> Vec<Checkpoint> {
        let checkpoints = self.checkpoints.lock();
        if since >= checkpoints.len() {
            return Vec::new();
        }
        checkpoints[since..].to_vec()
    }

    pub(crate) fn file_chunks_info(&self) -> Vec<FileChunksInfo> {
        self.file_chunks.lock().clone()
    }

    pub(crate) fn file_creator(&self) -> &FileCreator {
        &self.file_creator
    }

    pub(crate) fn throttler(&self) -> Option<&Throttler> {
        self.throttler.as_ref()
    }

    pub(crate) fn is_log_based_resumption(&self) -> bool {
        self.config.enable_download_resumption && !self.config.disable_transfer_log
    }

    pub(crate) fn transfer_log(&self) -> &TransferLogManager {
        &self.transfer_log
    }

    pub(crate) fn add_transfer_log_header(&self, block_mode: bool, sender_resuming: bool) {
        if self.is_log_based_resumption() {
            self.transfer_log
                .add_header(&self.config.transfer_id, block_mode, sender_resuming);
        }
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        let _ = self.events.try_send(event);
    }
}

#[derive(Debug)]
pub enum ReceiverError {
    /// Destination directory or transfer log could not be set up.
    Io(io::Error),
    /// A listening port could not be bound.
    Bind { port: u16 },
    /// A worker thread could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiverError::Io(e) => write!(f, "I/O error: {}", e),
            ReceiverError::Bind { port } => write!(f, "cannot bind listening port {}", port),
            ReceiverError::Spawn(e) => write!(f, "cannot spawn worker thread: {}", e),
        }
    }
}

impl std::error::Error for ReceiverError {}

/// The receiver endpoint. Construct, `start`, then `wait` for the report;
/// `run` does both.
pub struct Receiver {
    core: Arc<SessionCore>,
    workers: Vec<ReceiverWorker>,
    handles: Vec<(u16, JoinHandle<WorkerStats>)>,
    ports: Vec<u16>,
    events_rx: EventReceiver<SessionEvent>,
}

impl Receiver {
    /// Bind every listening port and prepare the shared session state. The
    /// chunk inventory is replayed from the transfer log when resumption is
    /// on, so a restarted receiver can tell the sender what it already has.
    pub fn new(config: ReceiverConfig) -> Result<Receiver, ReceiverError> {
        std::fs::create_dir_all(&config.dest_dir).map_err(ReceiverError::Io)?;
        let transfer_log = TransferLogManager::open(&config.dest_dir).map_err(ReceiverError::Io)?;

        let mut file_chunks = Vec::new();
        if config.enable_download_resumption && !config.disable_transfer_log {
            file_chunks = transfer_log.parse_file_chunks().map_err(ReceiverError::Io)?;
        }

        let throttler = if config.throttle_bytes_per_sec > 0 {
            Some(Throttler::new(config.throttle_bytes_per_sec))
        } else {
            None
        };

        let (events_tx, events_rx) = bounded(1024);
        let file_creator = FileCreator::new(config.dest_dir.clone());
        let num_ports = config.num_ports.max(1);
        let core = Arc::new(SessionCore {
            config,
            abort_code: AtomicU8::new(ErrorCode::Ok as u8),
            new_transfer_started: AtomicBool::new(false),
            checkpoints: Mutex::new(Vec::new()),
            file_chunks: Mutex::new(file_chunks),
            transfer_log,
            file_creator,
            throttler,
            events: events_tx,
        });

        let controller = Arc::new(ThreadsController::new(num_ports));
        let mut workers = Vec::with_capacity(num_ports);
        let mut ports = Vec::with_capacity(num_ports);
        for index in 0..num_ports {
            let port = match core.config.start_port {
                0 => 0,
                p => p + index as u16,
            };
            let mut worker = ReceiverWorker::new(index, port, core.clone(), controller.clone());
            if !worker.init().is_ok() {
                error!("could not bind port {} for worker {}", port, index);
                return Err(ReceiverError::Bind { port });
            }
            ports.push(worker.port());
            workers.push(worker);
        }
        info!(
            "receiver '{}' listening on ports {:?}",
            core.config.transfer_id, ports
        );

        Ok(Receiver {
            core,
            workers,
            handles: Vec::new(),
            ports,
            events_rx,
        })
    }

    /// Actual listening ports, in worker order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn transfer_id(&self) -> &str {
        self.core.transfer_id()
    }

    /// Progress event stream. Safe to drop; workers never block on it.
    pub fn events(&self) -> EventReceiver<SessionEvent> {
        self.events_rx.clone()
    }

    /// Latch the global abort code; every worker exits at its next check.
    pub fn abort(&self, code: ErrorCode) {
        warn!("aborting transfer: {}", code);
        self.core.abort(code);
    }

    /// Spawn one named thread per worker.
    pub fn start(&mut self) -> Result<(), ReceiverError> {
        for worker in self.workers.drain(..) {
            let port = worker.port();
            let handle = std::thread::Builder::new()
                .name(format!("gust-recv-{}", port))
                .spawn(move || worker.run())
                .map_err(ReceiverError::Spawn)?;
            self.handles.push((port, handle));
        }
        Ok(())
    }

    /// Join every worker and fold their stats into a report.
    pub fn wait(&mut self) -> TransferReport {
        let mut all = Vec::with_capacity(self.handles.len());
        for (port, handle) in self.handles.drain(..) {
            match handle.join() {
                Ok(stats) => all.push((port, stats)),
                Err(_) => {
                    error!("worker thread for port {} panicked", port);
                    let mut stats = WorkerStats::new();
                    stats.set_local_error(ErrorCode::Error);
                    all.push((port, stats));
                }
            }
        }
        let report = TransferReport::new(all);
        info!("{}", report);
        report
    }

    /// Run the whole transfer: start workers and wait for the report.
    pub fn run(&mut self) -> Result<TransferReport, ReceiverError> {
        self.start()?;
        Ok(self.wait())
    }
}
