//! Buffered non-blocking socket.

use std::io;
use std::net::SocketAddr;

use tokio::io::Interest;
use tokio::net::TcpStream;

use super::ReadySet;
use crate::wire::{Frame, MAX_STRING_LEN, WireError, decode_frame};

/// Bytes requested per non-blocking read.
pub const READ_CHUNK: usize = 4096;

/// Most bytes either buffer may hold before the peer is given up on.
pub const MAX_BUFFERED: usize = 16 * MAX_STRING_LEN as usize;

/// Result of one non-blocking read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes were appended to the inbound buffer.
    Data(usize),
    /// Not connected, or nothing to read right now.
    Idle,
    /// The peer closed its end.
    Closed,
    Failed(io::Error),
    /// The inbound buffer went over [`MAX_BUFFERED`].
    Overflow,
}

/// A socket with its inbound and outbound byte buffers.
///
/// Outbound bytes are flushed strictly in order. Inbound bytes are only
/// consumed a whole frame at a time. Neither buffer is allowed past
/// [`MAX_BUFFERED`].
#[derive(Debug, Default)]
pub struct PeerConnection {
    addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
}

impl PeerConnection {
    /// A disconnected connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, addr: SocketAddr) -> Self {
        let mut conn = Self::new();
        conn.attach(stream, addr);
        conn
    }

    /// Take over a freshly connected stream, discarding any old buffers.
    pub fn attach(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %addr, "Failed to set TCP_NODELAY: {e}");
        }
        self.reset();
        self.addr = Some(addr);
        self.stream = Some(stream);
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// The remote address for log messages.
    pub fn peer_label(&self) -> String {
        match self.addr {
            Some(addr) => addr.to_string(),
            None => "<disconnected>".to_string(),
        }
    }

    /// Register for reading if connected, and for writing if output is
    /// pending.
    pub fn prepare_readiness<'a>(&'a self, ready: &mut ReadySet<'a>) {
        let Some(stream) = &self.stream else {
            return;
        };
        let interest = if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        ready.register(stream, interest);
    }

    /// One non-blocking read of up to [`READ_CHUNK`] bytes.
    pub fn read_ready(&mut self) -> ReadOutcome {
        let Some(stream) = &self.stream else {
            return ReadOutcome::Idle;
        };
        let mut buf = [0u8; READ_CHUNK];
        match stream.try_read(&mut buf) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => {
                self.inbound.extend_from_slice(&buf[..n]);
                if self.inbound.len() > MAX_BUFFERED {
                    ReadOutcome::Overflow
                } else {
                    ReadOutcome::Data(n)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Idle,
            Err(e) => ReadOutcome::Failed(e),
        }
    }

    /// One non-blocking write of as much pending output as the socket takes.
    /// Returns the number of bytes sent.
    pub fn write_ready(&mut self) -> io::Result<usize> {
        let Some(stream) = &self.stream else {
            return Ok(0);
        };
        if self.outbound.is_empty() {
            return Ok(0);
        }
        match stream.try_write(&self.outbound) {
            Ok(n) => {
                self.outbound.drain(..n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Queue `frame` for sending.
    pub fn enqueue<F: Frame>(&mut self, frame: &F) {
        self.outbound.extend_from_slice(&frame.to_bytes());
    }

    /// Decode and consume the next complete frame, if the buffer holds one.
    pub fn decode_next<F: Frame>(&mut self) -> Result<Option<F>, WireError> {
        match decode_frame::<F>(&self.inbound)? {
            Some((frame, used)) => {
                self.inbound.drain(..used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    pub fn has_inbound(&self) -> bool {
        !self.inbound.is_empty()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Whether unsent output has piled up past [`MAX_BUFFERED`].
    pub fn is_outbound_full(&self) -> bool {
        self.outbound.len() > MAX_BUFFERED
    }

    /// Drop the socket and both buffers.
    pub fn reset(&mut self) {
        self.stream = None;
        self.addr = None;
        self.inbound.clear();
        self.outbound.clear();
    }
}
