/// Integration tests: drive a real receiver over TCP loopback with a
/// scripted sender and verify bytes on disk, checkpoint exchange and the
/// coordinated done handshake.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use gust_transfer::protocol::{self, Cmd, PROTOCOL_VERSION};
use gust_transfer::transfer_log::TransferLogManager;
use gust_transfer::types::{
    AllocationStatus, BlockDetails, Checkpoint, ErrorCode, FileChunksInfo, Interval, Settings,
};
use gust_transfer::{Receiver, ReceiverConfig, SessionEvent};

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gust_sm_test_{tag}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(tag: &str, dir: &PathBuf, num_ports: usize) -> ReceiverConfig {
    ReceiverConfig {
        transfer_id: format!("t-{tag}"),
        dest_dir: dir.clone(),
        start_port: 0,
        num_ports,
        read_timeout_millis: 2000,
        write_timeout_millis: 2000,
        accept_window_millis: 3000,
        ..ReceiverConfig::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn send_settings(stream: &mut TcpStream, version: i32, transfer_id: &str, settings: &Settings) {
    let mut settings = settings.clone();
    settings.transfer_id = transfer_id.to_owned();
    // pad whenever the sender stops and waits after this frame
    let pad = settings.send_file_chunks;
    let frame = protocol::encode_settings_frame(version, &settings, pad);
    stream.write_all(&frame).unwrap();
}

fn block(name: &str, seq_id: i64, offset: i64, data_size: i64, file_size: i64) -> BlockDetails {
    BlockDetails {
        file_name: name.into(),
        seq_id,
        file_size,
        offset,
        data_size,
        allocation_status: if offset == 0 {
            AllocationStatus::NotExists
        } else {
            AllocationStatus::ExistsCorrectSize
        },
        prev_seq_id: -1,
    }
}

fn send_file(stream: &mut TcpStream, bd: &BlockDetails, payload: &[u8]) {
    assert_eq!(bd.data_size as usize, payload.len());
    let frame = protocol::encode_file_frame(ErrorCode::Ok, bd);
    stream.write_all(&frame).unwrap();
    stream.write_all(payload).unwrap();
}

fn send_footer(stream: &mut TcpStream, checksum: u32) {
    stream
        .write_all(&protocol::encode_footer_frame(checksum))
        .unwrap();
}

fn send_done(stream: &mut TcpStream, num_blocks: i64, total_bytes: i64) {
    let frame = protocol::encode_done_frame(ErrorCode::Ok, num_blocks, total_bytes);
    stream.write_all(&frame).unwrap();
}

fn send_size(stream: &mut TcpStream, total_bytes: i64) {
    let mut frame = vec![0u8; 12];
    frame[0] = Cmd::Size as u8;
    let mut off = 1;
    assert!(protocol::encode_size(&mut frame, &mut off, total_bytes));
    stream.write_all(&frame[..off]).unwrap();
}

/// Read single-byte commands, skipping the keep-alive WAITs the receiver
/// emits while its siblings are still busy.
fn read_tag_skipping_waits(stream: &mut TcpStream) -> u8 {
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).unwrap();
        if byte[0] != Cmd::Wait as u8 {
            return byte[0];
        }
    }
}

/// Complete the done exchange: wait for the receiver's DONE, ack it and
/// close the connection so the receiver sees the EOF it requires.
fn finish_done_handshake(mut stream: TcpStream) {
    let tag = read_tag_skipping_waits(&mut stream);
    assert_eq!(tag, Cmd::Done as u8, "expected the receiver's done cmd");
    stream.write_all(&[Cmd::Done as u8]).unwrap();
}

/// Read the fixed-size local checkpoint frame a receiver sends right after
/// accepting a reconnect.
fn read_local_checkpoint(stream: &mut TcpStream, version: i32) -> Checkpoint {
    let len = protocol::max_local_checkpoint_len(version);
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).unwrap();
    let mut off = 0;
    let mut cps = protocol::decode_checkpoints(version, &frame, &mut off, len).unwrap();
    assert_eq!(cps.len(), 1);
    cps.pop().unwrap()
}

fn read_varint(stream: &mut TcpStream) -> u64 {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).unwrap();
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return value;
        }
        shift += 7;
    }
}

fn default_settings() -> Settings {
    Settings {
        read_timeout_millis: 1000,
        write_timeout_millis: 1000,
        ..Settings::default()
    }
}

#[test]
fn single_block_transfer_end_to_end() {
    let _ = env_logger::try_init();
    let dir = scratch_dir("happy");
    let mut receiver = Receiver::new(test_config("happy", &dir, 1)).unwrap();
    let events = receiver.events();
    let port = receiver.ports()[0];
    receiver.start().unwrap();

    let payload = pattern(1024);
    let mut stream = connect(port);
    send_settings(&mut stream, PROTOCOL_VERSION, "t-happy", &default_settings());
    send_size(&mut stream, 1024);
    send_file(&mut stream, &block("blob.bin", 0, 0, 1024, 1024), &payload);
    send_done(&mut stream, 1, 1024);
    finish_done_handshake(stream);

    let report = receiver.wait();
    assert_eq!(report.error, ErrorCode::Ok);
    assert_eq!(report.num_blocks, 1);
    assert_eq!(report.total_effective_bytes, 1024);
    assert_eq!(report.worker_stats[0].1.total_sender_bytes(), 1024);
    assert_eq!(fs::read(dir.join("blob.bin")).unwrap(), payload);

    let events: Vec<SessionEvent> = events.try_iter().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::SessionStarted { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::BlockReceived { seq_id: 0, bytes: 1024, .. })));
    assert!(events.iter().any(|e| matches!(e, SessionEvent::SessionEnded)));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn checksum_mismatch_recovers_over_reconnect() {
    let _ = env_logger::try_init();
    let dir = scratch_dir("crc");
    let mut receiver = Receiver::new(test_config("crc", &dir, 1)).unwrap();
    let port = receiver.ports()[0];
    receiver.start().unwrap();

    let payload = pattern(2048);
    let checksum = crc32c::crc32c(&payload);
    let settings = Settings {
        enable_checksum: true,
        ..default_settings()
    };

    let mut first = connect(port);
    send_settings(&mut first, PROTOCOL_VERSION, "t-crc", &settings);
    send_file(&mut first, &block("data.bin", 0, 0, 2048, 2048), &payload);
    send_footer(&mut first, checksum ^ 0xdead_beef);
    // a real sender streams its next command right behind the footer
    send_done(&mut first, 1, 2048);

    // the receiver rejects the block and waits for a retry; the fresh
    // connection starts with its local checkpoint: nothing counted yet
    let mut second = connect(port);
    let cp = read_local_checkpoint(&mut second, PROTOCOL_VERSION);
    assert_eq!(cp.num_blocks, 0);
    assert!(cp.last_block.is_none());

    send_file(&mut second, &block("data.bin", 0, 0, 2048, 2048), &payload);
    send_footer(&mut second, checksum);
    send_done(&mut second, 1, 2048);
    finish_done_handshake(second);
    drop(first);

    let report = receiver.wait();
    assert_eq!(report.error, ErrorCode::Ok);
    assert_eq!(report.num_blocks, 1);
    assert_eq!(report.failed_attempts, 1);
    assert_eq!(fs::read(dir.join("data.bin")).unwrap(), payload);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn version_mismatch_renegotiates_over_reconnect() {
    let _ = env_logger::try_init();
    let dir = scratch_dir("version");
    let mut receiver = Receiver::new(test_config("version", &dir, 1)).unwrap();
    let port = receiver.ports()[0];
    receiver.start().unwrap();

    // advertise a newer version; pad because nothing follows until the
    // receiver reacts
    let mut first = connect(port);
    {
        let mut settings = default_settings();
        settings.transfer_id = "t-version".into();
        let frame = protocol::encode_settings_frame(PROTOCOL_VERSION + 1, &settings, true);
        first.write_all(&frame).unwrap();
    }

    // the receiver aborts, telling us the version it latched, and closes
    let mut abort = Vec::new();
    first.read_to_end(&mut abort).unwrap();
    assert_eq!(abort[0], Cmd::Abort as u8);
    let mut off = 1;
    let (version, code, num_blocks) =
        protocol::decode_abort(&abort, &mut off, abort.len()).unwrap();
    assert_eq!(version, PROTOCOL_VERSION);
    assert_eq!(code, ErrorCode::VersionMismatch);
    assert_eq!(num_blocks, 0);

    // retry at the negotiated version; the receiver leads with a checkpoint
    let mut second = connect(port);
    let cp = read_local_checkpoint(&mut second, PROTOCOL_VERSION);
    assert_eq!(cp.num_blocks, 0);

    let payload = pattern(512);
    send_settings(&mut second, PROTOCOL_VERSION, "t-version", &default_settings());
    send_file(&mut second, &block("v.bin", 0, 0, 512, 512), &payload);
    send_done(&mut second, 1, 512);
    finish_done_handshake(second);

    let report = receiver.wait();
    assert_eq!(report.error, ErrorCode::Ok);
    assert_eq!(report.num_blocks, 1);
    assert_eq!(fs::read(dir.join("v.bin")).unwrap(), payload);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn mid_block_disconnect_checkpoints_partial_offset() {
    let _ = env_logger::try_init();
    let dir = scratch_dir("partial");
    let mut receiver = Receiver::new(test_config("partial", &dir, 1)).unwrap();
    let port = receiver.ports()[0];
    receiver.start().unwrap();

    let total = 200_000usize;
    let cut = 60_000usize;
    let payload = pattern(total);

    let mut first = connect(port);
    send_settings(&mut first, PROTOCOL_VERSION, "t-partial", &default_settings());
    let bd = block("big.bin", 0, 0, total as i64, total as i64);
    let frame = protocol::encode_file_frame(ErrorCode::Ok, &bd);
    first.write_all(&frame).unwrap();
    first.write_all(&payload[..cut]).unwrap();
    drop(first); // disconnect inside the block

    let mut second = connect(port);
    let cp = read_local_checkpoint(&mut second, PROTOCOL_VERSION);
    assert_eq!(cp.num_blocks, 0);
    let lb = cp.last_block.expect("offset-granular checkpoint");
    assert_eq!(lb.seq_id, 0);
    assert_eq!(lb.offset, 0);
    assert_eq!(lb.received_bytes, cut as i64);

    // resume inside the block, as the checkpoint allows
    let rest = (total - cut) as i64;
    send_file(
        &mut second,
        &block("big.bin", 0, cut as i64, rest, total as i64),
        &payload[cut..],
    );
    send_done(&mut second, 1, total as i64);
    finish_done_handshake(second);

    let report = receiver.wait();
    assert_eq!(report.error, ErrorCode::Ok);
    assert_eq!(report.num_blocks, 1);
    assert_eq!(report.failed_attempts, 1);
    assert_eq!(report.total_effective_bytes, total as i64);
    assert_eq!(fs::read(dir.join("big.bin")).unwrap(), payload);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn resuming_sender_gets_chunk_inventory_from_one_elected_worker() {
    let _ = env_logger::try_init();
    let dir = scratch_dir("chunks");

    // a previous run left two partially received files in the log
    {
        let log = TransferLogManager::open(&dir).unwrap();
        log.add_header("t-chunks", true, false);
        log.add_block_write_entry(0, 0, 4096, 8192, "c1.bin");
        log.add_block_write_entry(1, 0, 1024, 1024, "c2.bin");
    }

    let mut config = test_config("chunks", &dir, 2);
    config.enable_download_resumption = true;
    let mut receiver = Receiver::new(config).unwrap();
    let ports: Vec<u16> = receiver.ports().to_vec();
    receiver.start().unwrap();

    let sessions: Vec<_> = ports
        .into_iter()
        .map(|port| {
            std::thread::spawn(move || -> (bool, Vec<FileChunksInfo>) {
                let mut stream = connect(port);
                let mut settings = default_settings();
                settings.send_file_chunks = true;
                send_settings(&mut stream, PROTOCOL_VERSION, "t-chunks", &settings);

                let tag = read_tag_skipping_waits(&mut stream);
                let result = if tag == Cmd::Chunks as u8 {
                    // this connection won the election and replays the log
                    let count = read_varint(&mut stream) as usize;
                    let mut entries = Vec::new();
                    while entries.len() < count {
                        let mut len_bytes = [0u8; 4];
                        stream.read_exact(&mut len_bytes).unwrap();
                        let len = u32::from_le_bytes(len_bytes) as usize;
                        let mut body = vec![0u8; len];
                        stream.read_exact(&mut body).unwrap();
                        let mut off = 0;
                        entries.extend(
                            protocol::decode_file_chunks_info_list(&body, &mut off, len).unwrap(),
                        );
                    }
                    stream.write_all(&[0xa5]).unwrap(); // chunks ack
                    (true, entries)
                } else {
                    assert_eq!(tag, Cmd::Ack as u8);
                    (false, Vec::new())
                };

                send_done(&mut stream, 0, 0);
                finish_done_handshake(stream);
                result
            })
        })
        .collect();

    let results: Vec<(bool, Vec<FileChunksInfo>)> =
        sessions.into_iter().map(|h| h.join().unwrap()).collect();

    let report = receiver.wait();
    assert_eq!(report.error, ErrorCode::Ok);
    assert_eq!(report.num_blocks, 0);

    let elected: Vec<&Vec<FileChunksInfo>> = results
        .iter()
        .filter(|(won, _)| *won)
        .map(|(_, entries)| entries)
        .collect();
    assert_eq!(elected.len(), 1, "exactly one worker replays the inventory");
    assert_eq!(
        *elected[0],
        vec![
            FileChunksInfo {
                seq_id: 0,
                file_name: "c1.bin".into(),
                file_size: 8192,
                chunks: vec![Interval { start: 0, end: 4096 }],
            },
            FileChunksInfo {
                seq_id: 1,
                file_name: "c2.bin".into(),
                file_size: 1024,
                chunks: vec![Interval { start: 0, end: 1024 }],
            },
        ]
    );
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn lost_done_ack_retries_with_sentinel_checkpoint() {
    let _ = env_logger::try_init();
    let dir = scratch_dir("doneack");
    let mut receiver = Receiver::new(test_config("doneack", &dir, 1)).unwrap();
    let port = receiver.ports()[0];
    receiver.start().unwrap();

    let payload = pattern(512);
    let mut first = connect(port);
    send_settings(&mut first, PROTOCOL_VERSION, "t-doneack", &default_settings());
    send_file(&mut first, &block("d.bin", 0, 0, 512, 512), &payload);
    send_done(&mut first, 1, 512);
    // swallow the receiver's DONE but never ack it
    let tag = read_tag_skipping_waits(&mut first);
    assert_eq!(tag, Cmd::Done as u8);
    drop(first);

    // the reconnect leads with the -1 sentinel so we finalize, not resend
    let mut second = connect(port);
    let cp = read_local_checkpoint(&mut second, PROTOCOL_VERSION);
    assert_eq!(cp.num_blocks, -1);
    finish_done_handshake(second);

    let report = receiver.wait();
    // the transport error that ate the first ack stays latched even though
    // the retry completed
    assert_eq!(report.error, ErrorCode::SocketReadError);
    assert_eq!(report.num_blocks, 1);
    assert_eq!(fs::read(dir.join("d.bin")).unwrap(), payload);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn sibling_failure_forwards_global_checkpoint() {
    let _ = env_logger::try_init();
    let dir = scratch_dir("global");
    let mut receiver = Receiver::new(test_config("global", &dir, 2)).unwrap();
    let ports: Vec<u16> = receiver.ports().to_vec();
    receiver.start().unwrap();
    let (port_a, port_b) = (ports[0], ports[1]);

    let payload_a = pattern(1024);
    let payload_b = pattern(100_000);

    // connection B dies mid block and never comes back
    let mut conn_b = connect(port_b);
    send_settings(&mut conn_b, PROTOCOL_VERSION, "t-global", &default_settings());
    let bd_b = block("b.bin", 1, 0, payload_b.len() as i64, payload_b.len() as i64);
    conn_b
        .write_all(&protocol::encode_file_frame(ErrorCode::Ok, &bd_b))
        .unwrap();
    conn_b.write_all(&payload_b[..30_000]).unwrap();
    drop(conn_b);

    // connection A finishes its own block, then learns about B's failure
    // through the global checkpoint relay and takes over B's block
    let mut conn_a = connect(port_a);
    send_settings(&mut conn_a, PROTOCOL_VERSION, "t-global", &default_settings());
    send_file(
        &mut conn_a,
        &block("a.bin", 0, 0, payload_a.len() as i64, payload_a.len() as i64),
        &payload_a,
    );
    send_done(&mut conn_a, 1, payload_a.len() as i64);

    let tag = read_tag_skipping_waits(&mut conn_a);
    assert_eq!(tag, Cmd::Err as u8, "expected forwarded checkpoints");
    let mut len_bytes = [0u8; 2];
    conn_a.read_exact(&mut len_bytes).unwrap();
    let len = u16::from_le_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len];
    conn_a.read_exact(&mut body).unwrap();
    let mut off = 0;
    let checkpoints =
        protocol::decode_checkpoints(PROTOCOL_VERSION, &body, &mut off, len).unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].port, port_b);
    assert_eq!(checkpoints[0].num_blocks, 0);
    let lb = checkpoints[0].last_block.expect("partial block details");
    assert_eq!(lb.seq_id, 1);
    assert_eq!(lb.received_bytes, 30_000);

    send_file(&mut conn_a, &bd_b, &payload_b);
    send_done(&mut conn_a, 2, (payload_a.len() + payload_b.len()) as i64);
    finish_done_handshake(conn_a);

    let report = receiver.wait();
    // worker B's reconnect window expired, its error stays in the report
    assert_eq!(report.error, ErrorCode::ConnError);
    assert_eq!(report.num_blocks, 2);
    assert_eq!(fs::read(dir.join("a.bin")).unwrap(), payload_a);
    assert_eq!(fs::read(dir.join("b.bin")).unwrap(), payload_b);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn resumption_log_records_completed_blocks() {
    let _ = env_logger::try_init();
    let dir = scratch_dir("logged");
    let mut config = test_config("logged", &dir, 1);
    config.enable_download_resumption = true;
    let mut receiver = Receiver::new(config).unwrap();
    let port = receiver.ports()[0];
    receiver.start().unwrap();

    let payload = pattern(1000);
    let mut stream = connect(port);
    send_settings(&mut stream, PROTOCOL_VERSION, "t-logged", &default_settings());
    send_file(&mut stream, &block("logged.bin", 3, 0, 1000, 1000), &payload);
    send_done(&mut stream, 1, 1000);
    finish_done_handshake(stream);

    let report = receiver.wait();
    assert_eq!(report.error, ErrorCode::Ok);

    let log = TransferLogManager::open(&dir).unwrap();
    let chunks = log.parse_file_chunks().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].seq_id, 3);
    assert_eq!(chunks[0].file_name, "logged.bin");
    assert_eq!(chunks[0].chunks, vec![Interval { start: 0, end: 1000 }]);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn abort_stops_idle_workers() {
    let _ = env_logger::try_init();
    let dir = scratch_dir("abort");
    let mut receiver = Receiver::new(test_config("abort", &dir, 2)).unwrap();
    receiver.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    receiver.abort(ErrorCode::Abort);
    let report = receiver.wait();
    assert_eq!(report.error, ErrorCode::Abort);
    assert_eq!(report.num_blocks, 0);
    let _ = fs::remove_dir_all(&dir);
}
