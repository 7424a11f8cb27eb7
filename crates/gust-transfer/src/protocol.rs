/// Command framing for the transfer protocol.
///
/// Every command starts with a one-byte tag. Fixed-width multibyte integers
/// are little-endian; variable integers are LEB128 varints, with signed
/// fields carried as the two's-complement bit pattern (so the `-1` block
/// count sentinel encodes as ten bytes).
///
/// ```text
/// SETTINGS   'S' | varint senderVersion | varint idLen | id bytes
///                | varint readTimeoutMs | varint writeTimeoutMs | flags u8
/// FILE       'L' | status u8 | headerLen u16 LE | header body
///                | dataSize payload bytes [| FOOTER]
/// FOOTER     'F' | checksum u32 LE
/// DONE       'D' | status u8 | varint numBlocksSend | varint totalSenderBytes
/// SIZE       'Z' | varint totalSenderBytes
/// ERR        'E' | length u16 LE | checkpoint list
/// CHUNKS     'C' | varint totalCount, then frames: frameLen u32 LE | entries
/// ABORT      'A' | varint version | errorCode u8 | varint numBlocks
/// ACK        'K'
/// WAIT       'W'
/// ```
///
/// `headerLen` counts the whole FILE command prefix, tag and status and the
/// length field included. Decoders take a cursor and a parse-window cap and
/// either advance the cursor on success or return `None` with the cursor
/// position unspecified.
///
/// A sender pads any command after which it stops sending and waits for a
/// receiver reply (DONE always, SETTINGS when it requests the chunks
/// handshake) out to `MIN_BUF_LENGTH` bytes, so the receiver's read-at-least
/// can complete without blocking on a quiet wire.

use crate::types::{
    AllocationStatus, BlockDetails, Checkpoint, ErrorCode, FileChunksInfo, Interval,
    LastBlockDetails, Settings,
};

/// Minimum bytes buffered before command dispatch.
pub const MIN_BUF_LENGTH: usize = 256;

/// Parse-window bounds per command, from the start of the command.
pub const MAX_VERSION_LEN: usize = 10;
pub const MAX_SETTINGS_LEN: usize = 128;
pub const MAX_HEADER_LEN: usize = 640;
pub const MAX_DONE_LEN: usize = 24;
pub const MAX_SIZE_LEN: usize = 12;
pub const MAX_FOOTER_LEN: usize = 6;

/// Grace added to the sender's larger timeout when re-accepting mid session.
pub const TIMEOUT_BUFFER_MILLIS: u64 = 1000;
/// Divisor applied to the sender read timeout for coordination waits.
pub const WAIT_TIMEOUT_FACTOR: i64 = 5;

/// Oldest protocol this receiver can speak.
pub const MIN_PROTOCOL_VERSION: i32 = 20;
/// First version carrying offset-granular checkpoint details.
pub const CHECKPOINT_OFFSET_VERSION: i32 = 21;
/// Current protocol version.
pub const PROTOCOL_VERSION: i32 = 23;

const MAX_VARINT64: usize = 10;
const MAX_VARINT16: usize = 3;

/// Command tag magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    File = b'L',
    Done = b'D',
    Settings = b'S',
    Size = b'Z',
    Footer = b'F',
    Chunks = b'C',
    Err = b'E',
    Abort = b'A',
    Ack = b'K',
    Wait = b'W',
}

impl Cmd {
    pub fn from_u8(b: u8) -> Option<Cmd> {
        match b {
            b'L' => Some(Cmd::File),
            b'D' => Some(Cmd::Done),
            b'S' => Some(Cmd::Settings),
            b'Z' => Some(Cmd::Size),
            b'F' => Some(Cmd::Footer),
            b'C' => Some(Cmd::Chunks),
            b'E' => Some(Cmd::Err),
            b'A' => Some(Cmd::Abort),
            b'K' => Some(Cmd::Ack),
            b'W' => Some(Cmd::Wait),
            _ => None,
        }
    }
}

// ── Varints ──

/// Append a LEB128 varint. Returns false if the buffer runs out.
pub fn encode_varint(buf: &mut [u8], off: &mut usize, mut v: u64) -> bool {
    loop {
        if *off >= buf.len() {
            return false;
        }
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf[*off] = byte;
            *off += 1;
            return true;
        }
        buf[*off] = byte | 0x80;
        *off += 1;
    }
}

/// Decode a LEB128 varint bounded by `end`.
pub fn decode_varint(buf: &[u8], off: &mut usize, end: usize) -> Option<u64> {
    let end = end.min(buf.len());
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        if *off >= end || shift >= 64 {
            return None;
        }
        let b = buf[*off];
        *off += 1;
        v |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some(v);
        }
        shift += 7;
    }
}

fn encode_varint_i64(buf: &mut [u8], off: &mut usize, v: i64) -> bool {
    encode_varint(buf, off, v as u64)
}

fn decode_varint_i64(buf: &[u8], off: &mut usize, end: usize) -> Option<i64> {
    decode_varint(buf, off, end).map(|v| v as i64)
}

fn encode_string(buf: &mut [u8], off: &mut usize, s: &str) -> bool {
    let bytes = s.as_bytes();
    if !encode_varint(buf, off, bytes.len() as u64) {
        return false;
    }
    if *off + bytes.len() > buf.len() {
        return false;
    }
    buf[*off..*off + bytes.len()].copy_from_slice(bytes);
    *off += bytes.len();
    true
}

fn decode_string(buf: &[u8], off: &mut usize, end: usize) -> Option<String> {
    let end = end.min(buf.len());
    let len = decode_varint(buf, off, end)? as usize;
    if *off + len > end {
        return None;
    }
    let s = std::str::from_utf8(&buf[*off..*off + len]).ok()?.to_owned();
    *off += len;
    Some(s)
}

// ── Version negotiation ──

/// Pick a protocol version for a sender advertising `sender_version`.
/// Returns 0 when no common version exists.
pub fn negotiate_protocol(sender_version: i32, worker_version: i32) -> i32 {
    if sender_version < MIN_PROTOCOL_VERSION || worker_version < MIN_PROTOCOL_VERSION {
        return 0;
    }
    sender_version.min(worker_version)
}

pub fn encode_version(buf: &mut [u8], off: &mut usize, version: i32) -> bool {
    encode_varint(buf, off, version as u64)
}

pub fn decode_version(buf: &[u8], off: &mut usize, end: usize) -> Option<i32> {
    decode_varint(buf, off, end).map(|v| v as i32)
}

// ── Settings ──

const FLAG_ENABLE_CHECKSUM: u8 = 1 << 0;
const FLAG_BLOCK_MODE_DISABLED: u8 = 1 << 1;
const FLAG_SEND_FILE_CHUNKS: u8 = 1 << 2;

pub fn encode_settings(buf: &mut [u8], off: &mut usize, settings: &Settings) -> bool {
    if !encode_string(buf, off, &settings.transfer_id)
        || !encode_varint(buf, off, settings.read_timeout_millis)
        || !encode_varint(buf, off, settings.write_timeout_millis)
    {
        return false;
    }
    if *off >= buf.len() {
        return false;
    }
    let mut flags = 0u8;
    if settings.enable_checksum {
        flags |= FLAG_ENABLE_CHECKSUM;
    }
    if settings.block_mode_disabled {
        flags |= FLAG_BLOCK_MODE_DISABLED;
    }
    if settings.send_file_chunks {
        flags |= FLAG_SEND_FILE_CHUNKS;
    }
    buf[*off] = flags;
    *off += 1;
    true
}

pub fn decode_settings(buf: &[u8], off: &mut usize, end: usize) -> Option<Settings> {
    let end = end.min(buf.len());
    let transfer_id = decode_string(buf, off, end)?;
    let read_timeout_millis = decode_varint(buf, off, end)?;
    let write_timeout_millis = decode_varint(buf, off, end)?;
    if *off >= end {
        return None;
    }
    let flags = buf[*off];
    *off += 1;
    Some(Settings {
        transfer_id,
        read_timeout_millis,
        write_timeout_millis,
        enable_checksum: flags & FLAG_ENABLE_CHECKSUM != 0,
        block_mode_disabled: flags & FLAG_BLOCK_MODE_DISABLED != 0,
        send_file_chunks: flags & FLAG_SEND_FILE_CHUNKS != 0,
    })
}

// ── FILE header ──

pub fn encode_header(buf: &mut [u8], off: &mut usize, bd: &BlockDetails) -> bool {
    if !encode_string(buf, off, &bd.file_name)
        || !encode_varint_i64(buf, off, bd.seq_id)
        || !encode_varint_i64(buf, off, bd.file_size)
        || !encode_varint_i64(buf, off, bd.offset)
        || !encode_varint_i64(buf, off, bd.data_size)
    {
        return false;
    }
    if *off >= buf.len() {
        return false;
    }
    buf[*off] = bd.allocation_status as u8;
    *off += 1;
    if bd.allocation_status == AllocationStatus::ExistsTooSmall {
        return encode_varint_i64(buf, off, bd.prev_seq_id);
    }
    true
}

pub fn decode_header(buf: &[u8], off: &mut usize, end: usize) -> Option<BlockDetails> {
    let end = end.min(buf.len());
    let file_name = decode_string(buf, off, end)?;
    let seq_id = decode_varint_i64(buf, off, end)?;
    let file_size = decode_varint_i64(buf, off, end)?;
    let offset = decode_varint_i64(buf, off, end)?;
    let data_size = decode_varint_i64(buf, off, end)?;
    if *off >= end {
        return None;
    }
    let allocation_status = AllocationStatus::from_u8(buf[*off])?;
    *off += 1;
    let prev_seq_id = if allocation_status == AllocationStatus::ExistsTooSmall {
        decode_varint_i64(buf, off, end)?
    } else {
        -1
    };
    Some(BlockDetails {
        file_name,
        seq_id,
        file_size,
        offset,
        data_size,
        allocation_status,
        prev_seq_id,
    })
}

// ── DONE / SIZE / FOOTER ──

pub fn encode_done(buf: &mut [u8], off: &mut usize, num_blocks: i64, total_bytes: i64) -> bool {
    encode_varint_i64(buf, off, num_blocks) && encode_varint_i64(buf, off, total_bytes)
}

pub fn decode_done(buf: &[u8], off: &mut usize, end: usize) -> Option<(i64, i64)> {
    let end = end.min(buf.len());
    let num_blocks = decode_varint_i64(buf, off, end)?;
    let total_bytes = decode_varint_i64(buf, off, end)?;
    Some((num_blocks, total_bytes))
}

pub fn encode_size(buf: &mut [u8], off: &mut usize, total_bytes: i64) -> bool {
    encode_varint_i64(buf, off, total_bytes)
}

pub fn decode_size(buf: &[u8], off: &mut usize, end: usize) -> Option<i64> {
    decode_varint_i64(buf, off, end.min(buf.len()))
}

pub fn encode_footer(buf: &mut [u8], off: &mut usize, checksum: u32) -> bool {
    if *off + 4 > buf.len() {
        return false;
    }
    buf[*off..*off + 4].copy_from_slice(&checksum.to_le_bytes());
    *off += 4;
    true
}

pub fn decode_footer(buf: &[u8], off: &mut usize, end: usize) -> Option<u32> {
    let end = end.min(buf.len());
    if *off + 4 > end {
        return None;
    }
    let checksum = u32::from_le_bytes([buf[*off], buf[*off + 1], buf[*off + 2], buf[*off + 3]]);
    *off += 4;
    Some(checksum)
}

// ── Checkpoints ──

/// Encode a checkpoint list. For versions with offset-granular checkpoints
/// the last-block fields are always present; an absent last block is the
/// `seq_id = -1` sentinel.
pub fn encode_checkpoints(
    version: i32,
    buf: &mut [u8],
    off: &mut usize,
    checkpoints: &[Checkpoint],
) -> bool {
    if !encode_varint(buf, off, checkpoints.len() as u64) {
        return false;
    }
    for cp in checkpoints {
        if !encode_varint(buf, off, u64::from(cp.port))
            || !encode_varint_i64(buf, off, cp.num_blocks)
        {
            return false;
        }
        if version >= CHECKPOINT_OFFSET_VERSION {
            let (seq_id, offset, received) = match &cp.last_block {
                Some(lb) => (lb.seq_id, lb.offset, lb.received_bytes),
                None => (-1, 0, 0),
            };
            if !encode_varint_i64(buf, off, seq_id)
                || !encode_varint_i64(buf, off, offset)
                || !encode_varint_i64(buf, off, received)
            {
                return false;
            }
        }
    }
    true
}

pub fn decode_checkpoints(
    version: i32,
    buf: &[u8],
    off: &mut usize,
    end: usize,
) -> Option<Vec<Checkpoint>> {
    let end = end.min(buf.len());
    let count = decode_varint(buf, off, end)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let port = decode_varint(buf, off, end)? as u16;
        let num_blocks = decode_varint_i64(buf, off, end)?;
        let mut last_block = None;
        if version >= CHECKPOINT_OFFSET_VERSION {
            let seq_id = decode_varint_i64(buf, off, end)?;
            let offset = decode_varint_i64(buf, off, end)?;
            let received_bytes = decode_varint_i64(buf, off, end)?;
            if seq_id >= 0 {
                last_block = Some(LastBlockDetails {
                    seq_id,
                    offset,
                    received_bytes,
                });
            }
        }
        out.push(Checkpoint {
            port,
            num_blocks,
            last_block,
        });
    }
    Some(out)
}

/// Fixed frame length for the single local checkpoint sent right after a
/// reconnect. The frame is zero padded out to this length so the peer can
/// issue one exact-size read.
pub fn max_local_checkpoint_len(version: i32) -> usize {
    let per_checkpoint = if version >= CHECKPOINT_OFFSET_VERSION {
        MAX_VARINT16 + 4 * MAX_VARINT64
    } else {
        MAX_VARINT16 + MAX_VARINT64
    };
    1 + per_checkpoint
}

// ── CHUNKS ──

pub fn encode_chunks_cmd(buf: &mut [u8], off: &mut usize, num_chunks: i64) -> bool {
    encode_varint_i64(buf, off, num_chunks)
}

pub fn decode_chunks_cmd(buf: &[u8], off: &mut usize, end: usize) -> Option<i64> {
    decode_varint_i64(buf, off, end.min(buf.len()))
}

fn encode_file_chunks_info(buf: &mut [u8], off: &mut usize, info: &FileChunksInfo) -> bool {
    if !encode_varint_i64(buf, off, info.seq_id)
        || !encode_string(buf, off, &info.file_name)
        || !encode_varint_i64(buf, off, info.file_size)
        || !encode_varint(buf, off, info.chunks.len() as u64)
    {
        return false;
    }
    for iv in &info.chunks {
        if !encode_varint_i64(buf, off, iv.start) || !encode_varint_i64(buf, off, iv.end) {
            return false;
        }
    }
    true
}

fn decode_file_chunks_info(buf: &[u8], off: &mut usize, end: usize) -> Option<FileChunksInfo> {
    let seq_id = decode_varint_i64(buf, off, end)?;
    let file_name = decode_string(buf, off, end)?;
    let file_size = decode_varint_i64(buf, off, end)?;
    let count = decode_varint(buf, off, end)? as usize;
    let mut chunks = Vec::with_capacity(count);
    for _ in 0..count {
        let start = decode_varint_i64(buf, off, end)?;
        let end_off = decode_varint_i64(buf, off, end)?;
        chunks.push(Interval {
            start,
            end: end_off,
        });
    }
    Some(FileChunksInfo {
        seq_id,
        file_name,
        file_size,
        chunks,
    })
}

/// Pack as many chunk entries as fit, starting at `list[start]`. Returns how
/// many entries were consumed. An entry that does not fit even in an
/// otherwise empty buffer is dropped (logged) and counted as consumed so the
/// caller always makes progress.
pub fn encode_file_chunks_info_list(
    buf: &mut [u8],
    off: &mut usize,
    start: usize,
    list: &[FileChunksInfo],
) -> usize {
    let base = *off;
    let mut consumed = 0;
    for info in &list[start..] {
        let snapshot = *off;
        if encode_file_chunks_info(buf, off, info) {
            consumed += 1;
            continue;
        }
        *off = snapshot;
        if snapshot == base {
            log::error!(
                "chunks entry for seq {} ({} intervals) exceeds the buffer, dropping it",
                info.seq_id,
                info.chunks.len()
            );
            consumed += 1;
            continue;
        }
        break;
    }
    consumed
}

/// Parse chunk entries until the window is exhausted.
pub fn decode_file_chunks_info_list(
    buf: &[u8],
    off: &mut usize,
    end: usize,
) -> Option<Vec<FileChunksInfo>> {
    let end = end.min(buf.len());
    let mut out = Vec::new();
    while *off < end {
        out.push(decode_file_chunks_info(buf, off, end)?);
    }
    Some(out)
}

// ── ABORT ──

pub fn encode_abort(
    buf: &mut [u8],
    off: &mut usize,
    version: i32,
    code: ErrorCode,
    num_blocks: i64,
) -> bool {
    if !encode_varint(buf, off, version as u64) {
        return false;
    }
    if *off >= buf.len() {
        return false;
    }
    buf[*off] = code as u8;
    *off += 1;
    encode_varint_i64(buf, off, num_blocks)
}

pub fn decode_abort(buf: &[u8], off: &mut usize, end: usize) -> Option<(i32, ErrorCode, i64)> {
    let end = end.min(buf.len());
    let version = decode_varint(buf, off, end)? as i32;
    if *off >= end {
        return None;
    }
    let code = ErrorCode::from_u8(buf[*off]);
    *off += 1;
    let num_blocks = decode_varint_i64(buf, off, end)?;
    Some((version, code, num_blocks))
}

// ── Sender-side frame builders ──
//
// The receiver never emits these; they exist for the scripted peers in the
// integration tests and for future sender work.

/// Build a SETTINGS frame. Padded to `MIN_BUF_LENGTH` when the sender will
/// stop and wait for the chunks handshake.
pub fn encode_settings_frame(version: i32, settings: &Settings, pad: bool) -> Vec<u8> {
    let mut buf = vec![0u8; MIN_BUF_LENGTH.max(1 + MAX_VERSION_LEN + MAX_SETTINGS_LEN)];
    let mut off = 0;
    buf[off] = Cmd::Settings as u8;
    off += 1;
    let ok = encode_version(&mut buf, &mut off, version)
        && encode_settings(&mut buf, &mut off, settings);
    debug_assert!(ok);
    buf.truncate(if pad { MIN_BUF_LENGTH.max(off) } else { off });
    buf
}

/// Build a FILE frame prefix: tag, sender status, advertised length and the
/// block header. The payload follows separately on the wire.
pub fn encode_file_frame(status: ErrorCode, bd: &BlockDetails) -> Vec<u8> {
    let mut buf = vec![0u8; 4 + MAX_HEADER_LEN];
    buf[0] = Cmd::File as u8;
    buf[1] = status as u8;
    let mut off = 4;
    let ok = encode_header(&mut buf, &mut off, bd);
    debug_assert!(ok);
    buf[2..4].copy_from_slice(&(off as u16).to_le_bytes());
    buf.truncate(off);
    buf
}

/// Build the zero-padded DONE frame.
pub fn encode_done_frame(status: ErrorCode, num_blocks: i64, total_bytes: i64) -> Vec<u8> {
    let mut buf = vec![0u8; MIN_BUF_LENGTH];
    buf[0] = Cmd::Done as u8;
    buf[1] = status as u8;
    let mut off = 2;
    let ok = encode_done(&mut buf, &mut off, num_blocks, total_bytes);
    debug_assert!(ok);
    buf
}

/// Build a FOOTER frame.
pub fn encode_footer_frame(checksum: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 1 + 4];
    buf[0] = Cmd::Footer as u8;
    let mut off = 1;
    let ok = encode_footer(&mut buf, &mut off, checksum);
    debug_assert!(ok);
    buf
}
