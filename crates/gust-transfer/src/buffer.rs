/// Command framing buffer. One per worker, reused across connections.
///
/// Three cursors track the frame under parse:
///   `old_off`   start of the current command
///   `off`       next unread byte
///   `num_read`  valid bytes counted from `old_off`
///
/// Invariant: `old_off <= off <= old_off + num_read <= capacity`.
/// `start_cmd` moves `old_off` up to `off`, so after `consume_msg` shrinks
/// `num_read` by the parsed length, the count always describes bytes from
/// the coming command's start.

use std::io;

use log::{debug, warn};

use crate::socket::ServerSocket;

pub struct CommandBuffer {
    pub(crate) data: Vec<u8>,
    pub(crate) off: usize,
    pub(crate) old_off: usize,
    pub(crate) num_read: usize,
}

impl CommandBuffer {
    pub fn new(capacity: usize) -> CommandBuffer {
        CommandBuffer {
            data: vec![0u8; capacity],
            off: 0,
            old_off: 0,
            num_read: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Forget everything buffered. Used on every newly accepted connection.
    pub fn reset(&mut self) {
        self.off = 0;
        self.old_off = 0;
        self.num_read = 0;
    }

    /// Begin parsing a new command at the current read cursor.
    pub fn start_cmd(&mut self) {
        self.old_off = self.off;
    }

    /// One past the last valid byte.
    pub fn valid_end(&self) -> usize {
        self.old_off + self.num_read
    }

    /// Unread bytes still buffered.
    pub fn remaining(&self) -> usize {
        self.valid_end() - self.off
    }

    pub fn next_u8(&mut self) -> u8 {
        let b = self.data[self.off];
        self.off += 1;
        b
    }

    /// Drop the parsed command from the count. The bytes stay in place; the
    /// next `start_cmd` realigns `old_off` with the cursor.
    pub fn consume_msg(&mut self) {
        let len = self.off - self.old_off;
        self.num_read -= len;
    }

    /// Issue non-filling reads until at least `at_least` bytes are valid, the
    /// peer closes, or an error occurs. Returns the valid count; a read error
    /// with bytes already buffered is latent and surfaces on the next call.
    pub fn read_at_least(&mut self, sock: &mut ServerSocket, at_least: usize) -> usize {
        // a target beyond capacity can never be met; the short count makes
        // the caller fail the command instead of looping
        let at_least = at_least.min(self.data.len() - self.old_off);
        let mut reads = 0;
        while self.num_read < at_least {
            let end = self.old_off + self.num_read;
            match sock.read(&mut self.data[end..], false) {
                Ok(0) => {
                    debug!("eof after {} reads, got {}", reads, self.num_read);
                    break;
                }
                Ok(n) => {
                    self.num_read += n;
                    reads += 1;
                }
                Err(e) => {
                    warn!("read error after {} reads ({} buffered): {}", reads, self.num_read, e);
                    break;
                }
            }
        }
        self.num_read
    }

    /// Reposition after a block's payload left `leftover` unread bytes at
    /// the cursor. Small leftovers deep in the buffer move to the front so
    /// the next command's header is guaranteed to fit.
    pub fn finish_block(&mut self, leftover: usize, max_header: usize) {
        self.num_read = leftover;
        if leftover == 0 {
            self.off = 0;
        } else if leftover < max_header && self.off > self.data.len() / 2 {
            debug!("moving {} leftover bytes from {} to the front", leftover, self.off);
            self.data.copy_within(self.off..self.off + leftover, 0);
            self.off = 0;
        }
        self.old_off = self.off;
    }
}

/// Single non-filling read of up to `at_most` bytes into the front of `buf`.
/// `Ok(0)` is end of stream.
pub fn read_at_most(
    sock: &mut ServerSocket,
    buf: &mut [u8],
    at_most: usize,
) -> io::Result<usize> {
    let target = at_most.min(buf.len());
    sock.read(&mut buf[..target], false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, bytes: &[u8]) -> CommandBuffer {
        let mut buf = CommandBuffer::new(capacity);
        buf.data[..bytes.len()].copy_from_slice(bytes);
        buf.num_read = bytes.len();
        buf
    }

    #[test]
    fn consume_keeps_leftover_count() {
        let mut buf = filled(64, b"abcdef");
        buf.start_cmd();
        assert_eq!(buf.next_u8(), b'a');
        assert_eq!(buf.next_u8(), b'b');
        buf.consume_msg();
        assert_eq!(buf.num_read, 4);
        buf.start_cmd();
        assert_eq!(buf.remaining(), 4);
        assert_eq!(buf.next_u8(), b'c');
    }

    #[test]
    fn finish_block_compacts_small_tail_past_midpoint() {
        let mut buf = CommandBuffer::new(32);
        buf.data[20..24].copy_from_slice(b"tail");
        buf.off = 20;
        buf.old_off = 16;
        buf.num_read = 8;
        buf.finish_block(4, 8);
        assert_eq!(buf.off, 0);
        assert_eq!(buf.old_off, 0);
        assert_eq!(buf.num_read, 4);
        assert_eq!(&buf.data[..4], b"tail");
    }

    #[test]
    fn finish_block_leaves_large_or_shallow_leftovers_in_place() {
        // large leftover: stays where it is even deep in the buffer
        let mut buf = CommandBuffer::new(32);
        buf.off = 20;
        buf.old_off = 20;
        buf.num_read = 12;
        buf.finish_block(12, 8);
        assert_eq!(buf.off, 20);
        assert_eq!(buf.num_read, 12);

        // small leftover before the midpoint: no move needed
        let mut buf = CommandBuffer::new(32);
        buf.off = 4;
        buf.old_off = 0;
        buf.num_read = 8;
        buf.finish_block(4, 8);
        assert_eq!(buf.off, 4);
        assert_eq!(buf.old_off, 4);
    }

    #[test]
    fn finish_block_empty_resets_to_front() {
        let mut buf = CommandBuffer::new(32);
        buf.off = 30;
        buf.old_off = 28;
        buf.num_read = 2;
        buf.finish_block(0, 8);
        assert_eq!(buf.off, 0);
        assert_eq!(buf.old_off, 0);
        assert_eq!(buf.num_read, 0);
    }
}
