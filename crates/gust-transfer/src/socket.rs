/// Blocking server socket: one TCP listener plus the currently accepted
/// connection. Accepts are deadline bounded and poll the session abort flag
/// so a worker stuck waiting for a reconnect can still be cancelled.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::types::ErrorCode;

/// Receive buffer requested for accepted connections.
const STREAM_RECV_BUFFER: usize = 4 * 1024 * 1024;

/// Poll interval for the non-blocking accept loop.
const ACCEPT_POLL_MILLIS: u64 = 2;

pub struct ServerSocket {
    port: u16,
    read_timeout: Duration,
    write_timeout: Duration,
    listener: Option<TcpListener>,
    conn: Option<TcpStream>,
    peer: Option<SocketAddr>,
    /// First peer accepted this session; used by verified accepts.
    session_peer: Option<IpAddr>,
    non_retryable: ErrorCode,
}

impl ServerSocket {
    /// `port == 0` binds an ephemeral port; `port()` reports the real one
    /// after `listen` succeeds.
    pub fn new(port: u16, read_timeout_millis: u64, write_timeout_millis: u64) -> ServerSocket {
        ServerSocket {
            port,
            read_timeout: Duration::from_millis(read_timeout_millis),
            write_timeout: Duration::from_millis(write_timeout_millis),
            listener: None,
            conn: None,
            peer: None,
            session_peer: None,
            non_retryable: ErrorCode::Ok,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer.map(|p| p.ip())
    }

    pub fn non_retryable_err_code(&self) -> ErrorCode {
        self.non_retryable
    }

    /// Bind and start listening. Idempotent: an already listening socket
    /// returns `Ok` immediately, so retry loops can re-issue it freely.
    pub fn listen(&mut self) -> ErrorCode {
        if self.listener.is_some() {
            return ErrorCode::Ok;
        }
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                if let Err(e) = listener.set_nonblocking(true) {
                    error!("port {}: cannot make listener non-blocking: {}", self.port, e);
                    return ErrorCode::ConnError;
                }
                if let Ok(local) = listener.local_addr() {
                    self.port = local.port();
                }
                debug!("listening on port {}", self.port);
                self.listener = Some(listener);
                ErrorCode::Ok
            }
            Err(e) => match e.kind() {
                // address conflicts clear up (TIME_WAIT), permissions do not
                io::ErrorKind::PermissionDenied | io::ErrorKind::AddrNotAvailable => {
                    error!("port {}: bind failed permanently: {}", self.port, e);
                    ErrorCode::ConnError
                }
                _ => {
                    warn!("port {}: bind failed: {}", self.port, e);
                    ErrorCode::Error
                }
            },
        }
    }

    /// Wait up to `timeout_millis` for the next connection. `verify_peer`
    /// rejects connections that do not come from the session's known peer.
    /// `abort_check` is polled between accept attempts.
    pub fn accept_next_connection(
        &mut self,
        timeout_millis: u64,
        verify_peer: bool,
        abort_check: impl Fn() -> bool,
    ) -> ErrorCode {
        let listener = match &self.listener {
            Some(l) => l,
            None => {
                self.non_retryable = ErrorCode::ConnError;
                return ErrorCode::ConnError;
            }
        };
        let deadline = Instant::now() + Duration::from_millis(timeout_millis);
        loop {
            if abort_check() {
                return ErrorCode::Abort;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    if verify_peer {
                        if let Some(expected) = self.session_peer {
                            if addr.ip() != expected {
                                warn!(
                                    "port {}: rejecting connection from {} (session peer is {})",
                                    self.port, addr, expected
                                );
                                drop(stream);
                                continue;
                            }
                        }
                    }
                    if let Err(e) = self.configure_stream(&stream) {
                        warn!("port {}: cannot configure accepted stream: {}", self.port, e);
                        return ErrorCode::ConnError;
                    }
                    debug!("port {}: accepted connection from {}", self.port, addr);
                    self.session_peer = Some(addr.ip());
                    self.peer = Some(addr);
                    self.conn = Some(stream);
                    return ErrorCode::Ok;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return ErrorCode::ConnError;
                    }
                    std::thread::sleep(Duration::from_millis(ACCEPT_POLL_MILLIS));
                }
                Err(e) => {
                    error!("port {}: accept failed: {}", self.port, e);
                    return ErrorCode::ConnError;
                }
            }
        }
    }

    fn configure_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.write_timeout))?;
        let sock = socket2::SockRef::from(stream);
        if let Err(e) = sock.set_recv_buffer_size(STREAM_RECV_BUFFER) {
            // best effort, the kernel clamps or refuses on some systems
            debug!("port {}: recv buffer resize refused: {}", self.port, e);
        }
        Ok(())
    }

    /// Read from the current connection. With `try_full` the read loops
    /// until `buf` is full or the peer closes; otherwise a single read
    /// returns whatever arrived. `Ok(0)` is end of stream.
    pub fn read(&mut self, buf: &mut [u8], try_full: bool) -> io::Result<usize> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection"))?;
        if buf.is_empty() {
            return Ok(0);
        }
        if !try_full {
            return conn.read(buf);
        }
        let mut total = 0;
        while total < buf.len() {
            match conn.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    /// Write the whole buffer. Returns the number of bytes that made it out,
    /// which callers compare against the frame length; an error with nothing
    /// written surfaces as `Err`.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection"))?;
        let mut total = 0;
        while total < buf.len() {
            match conn.write(&buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    warn!("port {}: write failed after {} bytes: {}", self.port, total, e);
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    pub fn close_connection(&mut self) {
        self.conn = None;
        self.peer = None;
    }

    pub fn close_all(&mut self) {
        self.close_connection();
        self.listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn listen_is_idempotent_and_reports_port() {
        let mut sock = ServerSocket::new(0, 1000, 1000);
        assert_eq!(sock.listen(), ErrorCode::Ok);
        let port = sock.port();
        assert_ne!(port, 0);
        assert_eq!(sock.listen(), ErrorCode::Ok);
        assert_eq!(sock.port(), port);
    }

    #[test]
    fn accept_times_out_without_peer() {
        let mut sock = ServerSocket::new(0, 1000, 1000);
        assert_eq!(sock.listen(), ErrorCode::Ok);
        let code = sock.accept_next_connection(50, false, || false);
        assert_eq!(code, ErrorCode::ConnError);
    }

    #[test]
    fn accept_respects_abort() {
        let mut sock = ServerSocket::new(0, 1000, 1000);
        assert_eq!(sock.listen(), ErrorCode::Ok);
        let code = sock.accept_next_connection(5000, false, || true);
        assert_eq!(code, ErrorCode::Abort);
    }

    #[test]
    fn loopback_read_write() {
        let mut sock = ServerSocket::new(0, 1000, 1000);
        assert_eq!(sock.listen(), ErrorCode::Ok);
        let port = sock.port();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).unwrap();
            reply
        });

        assert_eq!(sock.accept_next_connection(2000, false, || false), ErrorCode::Ok);
        let mut buf = [0u8; 4];
        assert_eq!(sock.read(&mut buf, true).unwrap(), 4);
        assert_eq!(&buf, b"ping");
        assert_eq!(sock.write(b"pong").unwrap(), 4);
        assert_eq!(&client.join().unwrap(), b"pong");
    }
}
